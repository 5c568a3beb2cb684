//! Preset blob codec: the full pedal configuration exchanged by
//! `STATE_DATA` (0x31), `SAVE_PRESET` (0x32) and `PRESET_DATA` (0x34).
//!
//! # Version 3 layout (written by [`serialize_state`])
//!
//! ```text
//! [version=3][bpm][master][nameLen][name bytes]
//! per effect, layout order:  [id][flatCount][enabled][knob 0..K][dropdown 0..D]
//! optional EQ block:         [0xFE][count] count × [freq u16 LE][gain i8][q×10][enabled]
//! ```
//!
//! # Older layouts (read only)
//!
//! | Version | Effect record | EQ record |
//! |---|---|---|
//! | ≤ 1 | `[id][enabled][kCount][knobs][dCount][dropdowns]` | 4 bytes, no enabled flag |
//! | 2 | `[id][enabled][kCount][knobs][dCount][dropdowns]` | 5 bytes |
//! | ≥ 3 | `[id][flatCount][flat values]` or the counted form | 5 bytes |
//!
//! Earlier web app builds wrote the counted form under version 3 as well;
//! see [`deserialize_state`] for how the two are told apart.
//!
//! Decoding is best-effort: it never fails, never panics, and returns
//! whatever was readable before the buffer ran out.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::layout::{EffectLayout, EffectLayoutProvider};
use crate::protocol::{eq_gain_to_wire, eq_q_to_wire};
use crate::types::{
    EffectParameterSet, EqBand, PresetState, DEFAULT_DROPDOWN_VALUE, DEFAULT_KNOB_VALUE,
    MAX_EQ_BANDS,
};

/// Version byte written by [`serialize_state`].
pub const BLOB_VERSION: u8 = 3;

/// Block id that introduces the EQ section instead of an effect record.
pub const EQ_SENTINEL: u8 = 0xFE;

/// Longest preset name stored on the device, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Name written when the state carries none.
pub const DEFAULT_SAVE_NAME: &str = "User Preset";

// ── Encode ───────────────────────────────────────────────────────────────────

/// Serialise `state` as a version-3 blob.
///
/// Every effect in `layout` is written, in slot order, whether or not
/// `state` mentions it; missing knobs and dropdowns take their defaults.
/// At most [`MAX_EQ_BANDS`] bands are written and the EQ block is omitted
/// when there are none.
pub fn serialize_state(state: &PresetState, layout: &dyn EffectLayoutProvider) -> Vec<u8> {
    let name = truncate_name(if state.name.is_empty() {
        DEFAULT_SAVE_NAME
    } else {
        &state.name
    });

    let mut out = Vec::with_capacity(256);
    out.push(BLOB_VERSION);
    out.push(state.bpm);
    out.push(state.master_volume);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());

    let empty = EffectParameterSet::default();
    for id in 0..layout.effect_count().min(EQ_SENTINEL as usize) {
        let id = id as u8;
        let Some(fx) = layout.layout(id) else {
            continue;
        };
        let params = state.effects.get(&id).unwrap_or(&empty);
        let flat = flatten(fx, params);
        out.push(id);
        out.push(flat.len() as u8);
        out.extend_from_slice(&flat);
    }

    if !state.eq_bands.is_empty() {
        let bands = &state.eq_bands[..state.eq_bands.len().min(MAX_EQ_BANDS)];
        out.push(EQ_SENTINEL);
        out.push(bands.len() as u8);
        for band in bands {
            out.extend_from_slice(&band.frequency_hz.to_le_bytes());
            out.push(eq_gain_to_wire(band.gain_db) as u8);
            out.push(eq_q_to_wire(band.q));
            out.push(band.enabled as u8);
        }
    }
    out
}

/// `[enabled][knobs…][dropdowns…]`, capped at 255 values.
fn flatten(fx: &EffectLayout, params: &EffectParameterSet) -> Vec<u8> {
    let mut flat = Vec::with_capacity(fx.flat_param_count());
    flat.push(params.enabled as u8);
    flat.extend((0..fx.knob_count).map(|k| params.knob(k)));
    flat.extend((0..fx.dropdown_count).map(|d| params.dropdown(d)));
    flat.truncate(u8::MAX as usize);
    flat
}

/// Cut `name` to at most [`MAX_NAME_LEN`] bytes without splitting a character.
fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Bounds-checked forward reader over a blob.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(bytes)
    }

    /// Up to `n` bytes; fewer if the buffer ends first.
    fn take_up_to(&mut self, n: usize) -> &'a [u8] {
        let end = self.pos + n.min(self.remaining());
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        bytes
    }
}

/// Decode a preset blob of any known version.
///
/// A version-3 body that does not fit the flat form but parses cleanly as
/// counted records is read as counted records.
///
/// Fields that are absent keep the defaults of [`PresetState::default`]
/// (bpm 120, master 100, name `"Loaded"`). Unknown effect ids are skipped.
/// A record cut short by the end of the buffer is kept with defaults for
/// its missing values, and decoding stops there.
pub fn deserialize_state(buf: &[u8], layout: &dyn EffectLayoutProvider) -> PresetState {
    let mut state = PresetState::default();
    if buf.len() < 4 {
        return state;
    }

    let mut r = Reader::new(buf);
    let (Some(version), Some(bpm), Some(master), Some(name_len)) =
        (r.u8(), r.u8(), r.u8(), r.u8())
    else {
        return state;
    };
    state.version = version;
    state.bpm = bpm;
    state.master_volume = master;

    if version > BLOB_VERSION {
        warn!("preset blob version {version} is newer than {BLOB_VERSION}; decoding as {BLOB_VERSION}");
    }

    if name_len > 0 {
        match r.take(name_len as usize) {
            Some(name) => state.name = String::from_utf8_lossy(name).into_owned(),
            None => {
                debug!("preset name overruns blob ({name_len} bytes declared)");
                return state;
            }
        }
    }

    let eq_record_len = if version <= 1 { 4 } else { 5 };
    let form = record_form(&buf[r.pos..], version, eq_record_len, layout);

    while let Some(id) = r.u8() {
        if id == EQ_SENTINEL {
            read_eq_block(&mut r, eq_record_len, &mut state.eq_bands);
            continue;
        }
        let complete = match form {
            RecordForm::Flat => read_flat_record(&mut r, id, layout, &mut state.effects),
            RecordForm::Counted => read_counted_record(&mut r, id, layout, &mut state.effects),
        };
        if !complete {
            debug!("preset blob truncated inside record for effect {id}");
            break;
        }
    }
    state
}

/// How effect records after the header are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordForm {
    /// `[id][flatCount][flat values]`
    Flat,
    /// `[id][enabled][kCount][knobs][dCount][dropdowns]`
    Counted,
}

/// Pick the record form for the bytes after the name.
///
/// Versions ≤ 2 are always counted. Version 3 was stamped by both the
/// counted and the flat writers, so the body is checked against each form
/// as a whole: flat wins if every record is a known effect in ascending
/// order with exactly the layout's flat count and the body ends on a record
/// boundary; otherwise counted wins if it parses just as cleanly and every
/// known effect carries at least its layout's knobs; otherwise
/// flat is assumed and decoded best-effort.
fn record_form(
    body: &[u8],
    version: u8,
    eq_record_len: usize,
    layout: &dyn EffectLayoutProvider,
) -> RecordForm {
    if version < 3 {
        return RecordForm::Counted;
    }
    if scan_records(body, eq_record_len, |r, id| {
        let expected = layout.layout(id)?.flat_param_count();
        let count = r.u8()? as usize;
        (count == expected).then_some(())?;
        r.take(count).map(|_| ())
    }) {
        return RecordForm::Flat;
    }
    if scan_records(body, eq_record_len, |r, id| {
        let want_knobs = layout.layout(id).map_or(0, |fx| fx.knob_count);
        (r.u8()? <= 1).then_some(())?;
        let knobs = r.u8()?;
        r.take(knobs as usize)?;
        let dropdowns = r.u8()? as usize;
        r.take(dropdowns)?;
        (knobs >= want_knobs).then_some(())
    }) {
        debug!("version {version} blob uses counted effect records");
        return RecordForm::Counted;
    }
    RecordForm::Flat
}

/// `true` if `body` is a clean sequence of ascending effect records (each
/// accepted by `record`) and complete EQ blocks, with no trailing bytes.
fn scan_records(
    body: &[u8],
    eq_record_len: usize,
    record: impl Fn(&mut Reader<'_>, u8) -> Option<()>,
) -> bool {
    let mut r = Reader::new(body);
    let mut last_id: Option<u8> = None;
    while let Some(id) = r.u8() {
        if id == EQ_SENTINEL {
            let Some(count) = r.u8() else {
                return false;
            };
            if r.take(count as usize * eq_record_len).is_none() {
                return false;
            }
            continue;
        }
        if last_id.is_some_and(|last| id <= last) || record(&mut r, id).is_none() {
            return false;
        }
        last_id = Some(id);
    }
    true
}

fn read_eq_block(r: &mut Reader<'_>, record_len: usize, bands: &mut Vec<EqBand>) {
    let Some(count) = r.u8() else {
        return;
    };
    for _ in 0..(count as usize).min(MAX_EQ_BANDS) {
        let Some(rec) = r.take(record_len) else {
            return;
        };
        bands.push(EqBand {
            frequency_hz: u16::from_le_bytes([rec[0], rec[1]]),
            gain_db: rec[2] as i8,
            q: rec[3] as f32 / 10.0,
            enabled: rec.get(4).map_or(true, |&b| b != 0),
        });
    }
}

/// Version ≥ 3 record. Returns `false` if the buffer ended inside it.
fn read_flat_record(
    r: &mut Reader<'_>,
    id: u8,
    layout: &dyn EffectLayoutProvider,
    effects: &mut BTreeMap<u8, EffectParameterSet>,
) -> bool {
    let Some(flat_count) = r.u8() else {
        return false;
    };
    let flat = r.take_up_to(flat_count as usize);
    let complete = flat.len() == flat_count as usize;

    let Some(fx) = layout.layout(id) else {
        debug!("skipping unknown effect id {id} ({flat_count} values)");
        return complete;
    };

    let mut params = EffectParameterSet {
        enabled: flat.first().is_some_and(|&b| b != 0),
        ..Default::default()
    };
    let values = flat.get(1..).unwrap_or_default();
    for k in 0..fx.knob_count {
        let v = values.get(k as usize).copied().unwrap_or(DEFAULT_KNOB_VALUE);
        params.knobs.insert(k, v);
    }
    for d in 0..fx.dropdown_count {
        let v = values
            .get(fx.knob_count as usize + d as usize)
            .copied()
            .unwrap_or(DEFAULT_DROPDOWN_VALUE);
        params.dropdowns.insert(d, v);
    }
    effects.insert(id, params);
    complete
}

/// Version ≤ 2 record: `[enabled][kCount][knobs][dCount][dropdowns]`.
fn read_counted_record(
    r: &mut Reader<'_>,
    id: u8,
    layout: &dyn EffectLayoutProvider,
    effects: &mut BTreeMap<u8, EffectParameterSet>,
) -> bool {
    let (Some(enabled), Some(k_count)) = (r.u8(), r.u8()) else {
        return false;
    };
    let knobs = r.take_up_to(k_count as usize);
    let mut complete = knobs.len() == k_count as usize;
    let dropdowns: &[u8] = match (complete, r.u8()) {
        (true, Some(d_count)) => {
            let d = r.take_up_to(d_count as usize);
            complete = d.len() == d_count as usize;
            d
        }
        _ => {
            complete = false;
            &[]
        }
    };

    let Some(fx) = layout.layout(id) else {
        debug!("skipping unknown effect id {id}");
        return complete;
    };

    let mut params = EffectParameterSet {
        enabled: enabled != 0,
        ..Default::default()
    };
    for k in 0..fx.knob_count {
        let v = knobs.get(k as usize).copied().unwrap_or(DEFAULT_KNOB_VALUE);
        params.knobs.insert(k, v);
    }
    for d in 0..fx.dropdown_count {
        let v = dropdowns
            .get(d as usize)
            .copied()
            .unwrap_or(DEFAULT_DROPDOWN_VALUE);
        params.dropdowns.insert(d, v);
    }
    effects.insert(id, params);
    complete
}
