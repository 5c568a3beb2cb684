//! GATT UUIDs, command bytes, and outbound frame builders for the JamMate pedal.
//!
//! Every control frame shares one header:
//!
//! ```text
//! byte 0     : command
//! bytes 1..2 : payload length, u16 little-endian
//! bytes 3..  : payload
//! ```
//!
//! All multi-byte fields in payloads are little-endian. Builders never fail:
//! out-of-range inputs (EQ gain, Q) are clamped to what the firmware accepts.
//! The length field is always the number of payload bytes actually written.
//!
//! System commands (`0x60..=0x64`) are the exception and are sent as a lone
//! command byte.

use uuid::Uuid;

use crate::layout::{EffectLayoutProvider, LayoutTable};
use crate::preset::serialize_state;
use crate::types::{
    DrumPattern, DrumSettings, EqBand, GlobalSettings, PresetState, UtilitySettings,
};

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service advertised by the pedal (Nordic UART base UUID).
pub const JAMMATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9f);

/// Bidirectional control characteristic.
///
/// The host writes command frames to it; the pedal answers with
/// notifications on the same characteristic.
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9f);

/// Advertised name prefix of every JamMate unit.
pub const DEVICE_NAME_PREFIX: &str = "JamMate";

// ── Framing ──────────────────────────────────────────────────────────────────

/// `[command][len lo][len hi]`
pub const HEADER_LEN: usize = 3;

/// Four-byte marker that prefixes the drum/looper update payload.
pub const DRUM_TAG: [u8; 4] = *b"DRUM";

/// Wire-stable command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    SetParam = 0x20,
    /// Legacy enable toggle; superseded by `SetParam` with flat index 0.
    SetToggle = 0x21,
    SetEqBand = 0x22,
    SetUtil = 0x23,
    SetGlobal = 0x25,
    GetState = 0x30,
    StateData = 0x31,
    SavePreset = 0x32,
    LoadRequest = 0x33,
    PresetData = 0x34,
    TunerData = 0x35,
    SetDrumPattern = 0x40,
    SetDrumUpdate = 0x41,
    NamListData = 0x45,
    IrListData = 0x46,
    UpdateConfig = 0x50,
    FlashDsp = 0x60,
    ResetDsp = 0x61,
    StartMidiScan = 0x62,
    ReadSdCard = 0x63,
    SaveToSd = 0x64,
}

impl Command {
    /// Commands whose payload may span several notifications.
    pub fn is_large(self) -> bool {
        matches!(self, Command::StateData | Command::PresetData)
    }

    /// Inbound header width. Device-list frames carry no length field.
    pub fn inbound_header_len(self) -> usize {
        match self {
            Command::NamListData | Command::IrListData => 1,
            _ => HEADER_LEN,
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        cmd as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            0x20 => Command::SetParam,
            0x21 => Command::SetToggle,
            0x22 => Command::SetEqBand,
            0x23 => Command::SetUtil,
            0x25 => Command::SetGlobal,
            0x30 => Command::GetState,
            0x31 => Command::StateData,
            0x32 => Command::SavePreset,
            0x33 => Command::LoadRequest,
            0x34 => Command::PresetData,
            0x35 => Command::TunerData,
            0x40 => Command::SetDrumPattern,
            0x41 => Command::SetDrumUpdate,
            0x45 => Command::NamListData,
            0x46 => Command::IrListData,
            0x50 => Command::UpdateConfig,
            0x60 => Command::FlashDsp,
            0x61 => Command::ResetDsp,
            0x62 => Command::StartMidiScan,
            0x63 => Command::ReadSdCard,
            0x64 => Command::SaveToSd,
            other => return Err(other),
        })
    }
}

/// Wrap `payload` in a `[command][len LE][payload]` frame.
///
/// Payloads longer than `u16::MAX` are truncated so the header and body
/// always agree.
///
/// # Example
///
/// ```
/// # use jammate::protocol::{encode_frame, Command};
/// assert_eq!(encode_frame(Command::LoadRequest, &[1, 2]), [0x33, 0x02, 0x00, 1, 2]);
/// ```
pub fn encode_frame(command: Command, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(u16::MAX as usize)];
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(command as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

// ── Parameters ───────────────────────────────────────────────────────────────

/// `SET_PARAM` (0x20): `[effect][flat index][value]`.
///
/// One command covers the enable checkbox, every knob and every dropdown;
/// see [`crate::layout`] for the flat index layout.
///
/// ```
/// # use jammate::protocol::param_update;
/// assert_eq!(param_update(3, 5, 200), [0x20, 0x03, 0x00, 0x03, 0x05, 0xC8]);
/// ```
pub fn param_update(effect_id: u8, flat_index: u8, value: u8) -> Vec<u8> {
    encode_frame(Command::SetParam, &[effect_id, flat_index, value])
}

/// Enable or bypass an effect: a [`param_update`] at flat index 0.
pub fn toggle_update(effect_id: u8, enabled: bool) -> Vec<u8> {
    param_update(effect_id, 0, enabled as u8)
}

/// `SET_TOGGLE` (0x21): `[effect][enabled]`, for firmware predating flat indices.
pub fn legacy_toggle_update(effect_id: u8, enabled: bool) -> Vec<u8> {
    encode_frame(Command::SetToggle, &[effect_id, enabled as u8])
}

// ── EQ ───────────────────────────────────────────────────────────────────────

/// Clamp gain to the ±20 dB the DSP accepts.
pub fn eq_gain_to_wire(gain_db: i8) -> i8 {
    gain_db.clamp(-20, 20)
}

/// Clamp Q to `[0.1, 16.0]` and scale to tenths.
pub fn eq_q_to_wire(q: f32) -> u8 {
    let q = if q.is_nan() { 0.1 } else { q.clamp(0.1, 16.0) };
    (q * 10.0).round() as u8
}

/// `SET_EQ_BAND` (0x22): `[band][enabled][freq u16][gain i8][q×10]`.
///
/// ```
/// # use jammate::protocol::eq_band_update;
/// # use jammate::types::EqBand;
/// let band = EqBand { frequency_hz: 1200, gain_db: -6, q: 2.0, enabled: true };
/// assert_eq!(
///     eq_band_update(2, &band),
///     [0x22, 0x06, 0x00, 0x02, 0x01, 0xB0, 0x04, 0xFA, 0x14]
/// );
/// ```
pub fn eq_band_update(band_index: u8, band: &EqBand) -> Vec<u8> {
    let freq = band.frequency_hz.to_le_bytes();
    encode_frame(
        Command::SetEqBand,
        &[
            band_index,
            band.enabled as u8,
            freq[0],
            freq[1],
            eq_gain_to_wire(band.gain_db) as u8,
            eq_q_to_wire(band.q),
        ],
    )
}

// ── Utility / global ─────────────────────────────────────────────────────────

/// `SET_UTIL` (0x23): `[kind][enabled][level][freq u16]`.
pub fn utility_update(util: &UtilitySettings) -> Vec<u8> {
    let freq = util.frequency_hz.to_le_bytes();
    encode_frame(
        Command::SetUtil,
        &[util.kind as u8, util.enabled as u8, util.level, freq[0], freq[1]],
    )
}

/// Bit positions of the `SET_GLOBAL` flags byte.
pub mod global_flags {
    pub const A2DP: u8 = 1 << 0;
    pub const BLE: u8 = 1 << 1;
    pub const FLASH_REQUEST: u8 = 1 << 2;
    pub const RESET_REQUEST: u8 = 1 << 3;
}

/// `SET_GLOBAL` (0x25): `[master][bt volume][bpm][flags]`.
pub fn global_update(settings: &GlobalSettings) -> Vec<u8> {
    let mut flags = 0u8;
    if settings.a2dp_enabled {
        flags |= global_flags::A2DP;
    }
    if settings.ble_enabled {
        flags |= global_flags::BLE;
    }
    if settings.flash_request {
        flags |= global_flags::FLASH_REQUEST;
    }
    if settings.reset_request {
        flags |= global_flags::RESET_REQUEST;
    }
    encode_frame(
        Command::SetGlobal,
        &[settings.master_volume, settings.bt_volume, settings.bpm, flags],
    )
}

// ── State and presets ────────────────────────────────────────────────────────

/// `GET_STATE` (0x30) handshake: always `[0x30, 0x00, 0x00]`.
pub fn get_state() -> Vec<u8> {
    encode_frame(Command::GetState, &[])
}

/// `LOAD_REQ` (0x33): `[bank][slot]`. The pedal answers with `PRESET_DATA`.
pub fn load_request(bank: u8, slot: u8) -> Vec<u8> {
    encode_frame(Command::LoadRequest, &[bank, slot])
}

/// `SAVE_PRESET` (0x32): `[bank][slot][preset blob]`.
pub fn save_preset(
    bank: u8,
    slot: u8,
    state: &PresetState,
    layout: &dyn EffectLayoutProvider,
) -> Vec<u8> {
    let blob = serialize_state(state, layout);
    let mut payload = Vec::with_capacity(2 + blob.len());
    payload.push(bank);
    payload.push(slot);
    payload.extend_from_slice(&blob);
    encode_frame(Command::SavePreset, &payload)
}

/// `UPDATE_CONFIG` (0x50): compact JSON layout for the firmware's `/config.json`.
pub fn config_upload(layout: &LayoutTable) -> Vec<u8> {
    encode_frame(Command::UpdateConfig, layout.to_config_json().as_bytes())
}

// ── Drum machine ─────────────────────────────────────────────────────────────

/// `SET_DRUM_PATTERN` (0x40): the whole 9 × 16 grid, row-major (144 bytes).
pub fn drum_pattern(pattern: &DrumPattern) -> Vec<u8> {
    let grid: Vec<u8> = pattern.0.iter().flatten().copied().collect();
    encode_frame(Command::SetDrumPattern, &grid)
}

/// `SET_DRUM_PATTERN` (0x40), single-row form: `[row][16 velocities]`.
///
/// Used by firmware that expects the grid one row at a time.
pub fn drum_pattern_row(row: u8, steps: &[u8; 16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(17);
    payload.push(row);
    payload.extend_from_slice(steps);
    encode_frame(Command::SetDrumPattern, &payload)
}

/// `SET_DRUM_UPDATE` (0x41): `"DRUM"` followed by a 16-byte control block.
///
/// | Offset after tag | Field |
/// |---|---|
/// | 0 | drum enable |
/// | 1 | drum level |
/// | 2 | bpm |
/// | 3 | style |
/// | 4 | fill |
/// | 5 | drum number |
/// | 6 | looper enable |
/// | 7 | looper level |
/// | 8 | loop sync |
/// | 9 | loop arm |
/// | 10 | loop length |
/// | 11 | loop tracks |
/// | 12..15 | reserved, zero |
pub fn drum_update(drum: &DrumSettings) -> Vec<u8> {
    let mut payload = Vec::with_capacity(DRUM_TAG.len() + 16);
    payload.extend_from_slice(&DRUM_TAG);
    payload.extend_from_slice(&[
        drum.drum_enabled as u8,
        drum.drum_level,
        drum.bpm,
        drum.style,
        drum.fill,
        drum.drum_number,
        drum.looper_enabled as u8,
        drum.looper_level,
        drum.loop_sync,
        drum.loop_arm,
        drum.loop_length,
        drum.loop_tracks,
        0,
        0,
        0,
        0,
    ]);
    encode_frame(Command::SetDrumUpdate, &payload)
}

// ── System commands ──────────────────────────────────────────────────────────

/// A lone command byte with no header.
pub fn system_command(command: Command) -> Vec<u8> {
    vec![command as u8]
}

/// Put the DSP into bootloader mode. Audio stops until it is reflashed.
pub fn flash_dsp() -> Vec<u8> {
    system_command(Command::FlashDsp)
}

pub fn reset_dsp() -> Vec<u8> {
    system_command(Command::ResetDsp)
}

pub fn start_midi_scan() -> Vec<u8> {
    system_command(Command::StartMidiScan)
}

/// Ask the pedal to list NAM models and IR files on its SD card.
pub fn read_sd_card() -> Vec<u8> {
    system_command(Command::ReadSdCard)
}

/// Ask the pedal to flush its current state to the SD card.
pub fn save_to_sd() -> Vec<u8> {
    system_command(Command::SaveToSd)
}
