//! Effect layout table: how many knobs and dropdowns each effect slot has.
//!
//! The preset codec and the flat-parameter addressing both depend on this
//! table, and the device firmware must agree with it. It is injected through
//! [`EffectLayoutProvider`] so alternative tables (or synthetic ones in
//! tests) can be supplied. [`LayoutTable::builtin`] is the table shipped with
//! the current firmware.
//!
//! # Flat parameter index
//!
//! | Flat index | Parameter |
//! |---|---|
//! | `0` | enable checkbox |
//! | `1 ..= K` | knob `i - 1` |
//! | `K + 1 ..= K + D` | dropdown `i - 1 - K` |

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Layout of one effect slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectLayout {
    /// Short UI tag, e.g. `"GATE"`.
    pub short_name: String,
    /// Four-character tag the DSP firmware uses for this effect.
    pub dsp_tag: String,
    /// Number of knobs (`K`).
    #[serde(rename = "k")]
    pub knob_count: u8,
    /// Number of dropdowns (`D`).
    #[serde(rename = "d")]
    pub dropdown_count: u8,
}

/// A single addressable parameter within an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatParam {
    Enable,
    Knob(u8),
    Dropdown(u8),
}

impl EffectLayout {
    pub fn new(short_name: &str, dsp_tag: &str, knob_count: u8, dropdown_count: u8) -> Self {
        Self {
            short_name: short_name.into(),
            dsp_tag: dsp_tag.into(),
            knob_count,
            dropdown_count,
        }
    }

    /// `1 + K + D`: the length of this effect's flat parameter record.
    pub fn flat_param_count(&self) -> usize {
        1 + self.knob_count as usize + self.dropdown_count as usize
    }

    /// Map a flat index to the parameter it addresses.
    ///
    /// Returns `None` for indices past `K + D`.
    pub fn flat_index_to_param(&self, flat_index: u8) -> Option<FlatParam> {
        let k = self.knob_count;
        match flat_index {
            0 => Some(FlatParam::Enable),
            i if i <= k => Some(FlatParam::Knob(i - 1)),
            i if (i as usize) < self.flat_param_count() => Some(FlatParam::Dropdown(i - 1 - k)),
            _ => None,
        }
    }

    /// Inverse of [`flat_index_to_param`](Self::flat_index_to_param).
    ///
    /// Returns `None` if the knob or dropdown index is out of range.
    pub fn param_to_flat_index(&self, param: FlatParam) -> Option<u8> {
        match param {
            FlatParam::Enable => Some(0),
            FlatParam::Knob(i) if i < self.knob_count => Some(1 + i),
            FlatParam::Dropdown(i) if i < self.dropdown_count => {
                u8::try_from(1 + self.knob_count as usize + i as usize).ok()
            }
            _ => None,
        }
    }
}

/// Source of effect layouts, keyed by effect slot index.
pub trait EffectLayoutProvider {
    /// Layout of slot `effect_id`, or `None` if the slot is unknown.
    fn layout(&self, effect_id: u8) -> Option<&EffectLayout>;

    /// Number of effect slots; ids `0..effect_count()` are all valid.
    fn effect_count(&self) -> usize;
}

/// Ordered list of effect layouts, indexed by slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutTable {
    tabs: Vec<EffectLayout>,
}

impl LayoutTable {
    /// Build a table from a list of slots.
    ///
    /// Slot id `0xFE` is reserved for the preset EQ sentinel, so at most 254
    /// effects can be addressed.
    pub fn new(tabs: Vec<EffectLayout>) -> Result<Self, LayoutError> {
        if tabs.is_empty() {
            return Err(LayoutError::Empty);
        }
        if tabs.len() > 0xFE {
            return Err(LayoutError::TooManyEffects(tabs.len()));
        }
        Ok(Self { tabs })
    }

    /// The 18-effect layout of the current JamMate firmware.
    pub fn builtin() -> Self {
        let tabs = [
            ("GATE", "GATE", 5, 0),
            ("COMP", "COMP", 8, 0),
            ("AWAH", "AWAH", 9, 3),
            ("OVRD", "OVRD", 10, 2),
            ("DIST", "DIST", 10, 2),
            ("EQUL", "EQUL", 10, 2),
            ("HARM", "HARM", 7, 6),
            ("VIBR", "VIBR", 3, 0),
            ("CHOR", "CHOR", 7, 0),
            ("OCTV", "OCTV", 5, 2),
            ("FLNG", "FLNG", 5, 0),
            ("PHAS", "PHAS", 7, 1),
            ("TREM", "TREM", 4, 2),
            ("_FIR", "_FIR", 6, 5),
            ("DELY", "DELY", 9, 3),
            ("_NAM", "NAM ", 2, 1),
            ("RVRB", "RVRB", 10, 2),
            ("GNRC", "GNRC", 10, 2),
        ]
        .into_iter()
        .map(|(short, tag, k, d)| EffectLayout::new(short, tag, k, d))
        .collect();
        Self { tabs }
    }

    /// Parse the compact config schema produced by [`to_config_json`](Self::to_config_json):
    ///
    /// ```json
    /// {"tabs":[{"short_name":"GATE","dsp_tag":"GATE","k":5,"d":0}]}
    /// ```
    pub fn from_json(json: &str) -> Result<Self, LayoutError> {
        let table: LayoutTable = serde_json::from_str(json)?;
        Self::new(table.tabs)
    }

    /// Serialise to the compact JSON the firmware stores as `/config.json`.
    pub fn to_config_json(&self) -> String {
        // Only strings and small integers; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectLayout> {
        self.tabs.iter()
    }
}

impl EffectLayoutProvider for LayoutTable {
    fn layout(&self, effect_id: u8) -> Option<&EffectLayout> {
        self.tabs.get(effect_id as usize)
    }

    fn effect_count(&self) -> usize {
        self.tabs.len()
    }
}

impl Default for LayoutTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_bijection_holds_for_every_builtin_effect() {
        let table = LayoutTable::builtin();
        for layout in table.iter() {
            let last = layout.flat_param_count() as u8 - 1;
            for idx in 0..=last {
                let param = layout.flat_index_to_param(idx).unwrap();
                assert_eq!(layout.param_to_flat_index(param), Some(idx));
            }
            assert_eq!(layout.flat_index_to_param(last + 1), None);
        }
    }

    #[test]
    fn flat_index_layout_order() {
        let fx = EffectLayout::new("TEST", "TEST", 3, 2);
        assert_eq!(fx.flat_index_to_param(0), Some(FlatParam::Enable));
        assert_eq!(fx.flat_index_to_param(1), Some(FlatParam::Knob(0)));
        assert_eq!(fx.flat_index_to_param(3), Some(FlatParam::Knob(2)));
        assert_eq!(fx.flat_index_to_param(4), Some(FlatParam::Dropdown(0)));
        assert_eq!(fx.flat_index_to_param(5), Some(FlatParam::Dropdown(1)));
        assert_eq!(fx.flat_index_to_param(6), None);
        assert_eq!(fx.param_to_flat_index(FlatParam::Knob(3)), None);
        assert_eq!(fx.param_to_flat_index(FlatParam::Dropdown(2)), None);
    }

    #[test]
    fn effect_without_dropdowns() {
        let fx = EffectLayout::new("VIBR", "VIBR", 3, 0);
        assert_eq!(fx.flat_param_count(), 4);
        assert_eq!(fx.flat_index_to_param(3), Some(FlatParam::Knob(2)));
        assert_eq!(fx.flat_index_to_param(4), None);
    }

    #[test]
    fn config_json_round_trip() {
        let table = LayoutTable::builtin();
        let json = table.to_config_json();
        assert!(json.starts_with(r#"{"tabs":[{"short_name":"GATE","dsp_tag":"GATE","k":5,"d":0}"#));
        assert_eq!(LayoutTable::from_json(&json).unwrap(), table);
    }

    #[test]
    fn rejects_empty_table() {
        assert!(matches!(
            LayoutTable::from_json(r#"{"tabs":[]}"#),
            Err(LayoutError::Empty)
        ));
        assert!(matches!(
            LayoutTable::from_json("not json"),
            Err(LayoutError::Json(_))
        ));
    }

    #[test]
    fn builtin_has_eighteen_slots() {
        let table = LayoutTable::builtin();
        assert_eq!(table.effect_count(), 18);
        assert_eq!(table.layout(15).unwrap().dsp_tag, "NAM ");
        assert!(table.layout(18).is_none());
    }
}
