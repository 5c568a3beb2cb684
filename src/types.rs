use std::collections::BTreeMap;

/// Default value of a knob that is missing from a preset record.
pub const DEFAULT_KNOB_VALUE: u8 = 50;

/// Default value of a dropdown that is missing from a preset record.
pub const DEFAULT_DROPDOWN_VALUE: u8 = 0;

/// Maximum number of parametric EQ bands carried in a preset.
pub const MAX_EQ_BANDS: usize = 12;

/// One complete inbound application message.
///
/// The payload never contains the frame header, regardless of whether the
/// message arrived in a single notification or was reassembled from many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw command byte (see [`crate::protocol::Command`]).
    pub command: u8,
    /// Header-stripped payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// The command as a known [`crate::protocol::Command`], if it is one.
    pub fn kind(&self) -> Option<crate::protocol::Command> {
        crate::protocol::Command::try_from(self.command).ok()
    }
}

/// Parameter values of one effect slot.
///
/// Knob and dropdown maps are sparse; the accessors fall back to
/// [`DEFAULT_KNOB_VALUE`] and [`DEFAULT_DROPDOWN_VALUE`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectParameterSet {
    pub enabled: bool,
    /// Knob index → value (0–255).
    pub knobs: BTreeMap<u8, u8>,
    /// Dropdown index → selected entry.
    pub dropdowns: BTreeMap<u8, u8>,
}

impl EffectParameterSet {
    pub fn knob(&self, index: u8) -> u8 {
        self.knobs.get(&index).copied().unwrap_or(DEFAULT_KNOB_VALUE)
    }

    pub fn dropdown(&self, index: u8) -> u8 {
        self.dropdowns
            .get(&index)
            .copied()
            .unwrap_or(DEFAULT_DROPDOWN_VALUE)
    }
}

/// One parametric EQ band.
///
/// On the wire, gain is clamped to ±20 dB and Q is stored as `round(q × 10)`
/// after clamping to `[0.1, 16.0]`, so Q survives a round trip only to the
/// nearest 0.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub frequency_hz: u16,
    pub gain_db: i8,
    pub q: f32,
    pub enabled: bool,
}

impl Default for EqBand {
    fn default() -> Self {
        Self {
            frequency_hz: 1000,
            gain_db: 0,
            q: 1.0,
            enabled: true,
        }
    }
}

/// Full pedal configuration as carried by a preset blob.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetState {
    /// Blob format version the state was decoded from (or will be written as).
    pub version: u8,
    pub bpm: u8,
    pub master_volume: u8,
    /// Preset name; truncated to 32 bytes on the wire.
    pub name: String,
    /// Effect slot index → parameters.
    pub effects: BTreeMap<u8, EffectParameterSet>,
    pub eq_bands: Vec<EqBand>,
}

impl Default for PresetState {
    fn default() -> Self {
        Self {
            version: crate::preset::BLOB_VERSION,
            bpm: 120,
            master_volume: 100,
            name: "Loaded".into(),
            effects: BTreeMap::new(),
            eq_bands: Vec::new(),
        }
    }
}

/// Global device settings sent with `SET_GLOBAL` (0x25).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSettings {
    pub master_volume: u8,
    pub bt_volume: u8,
    pub bpm: u8,
    /// Enable the A2DP audio sink (flag bit 0).
    pub a2dp_enabled: bool,
    /// Keep the BLE control link enabled (flag bit 1).
    pub ble_enabled: bool,
    /// Ask the device to flash the DSP (flag bit 2).
    pub flash_request: bool,
    /// Ask the device to reset the DSP (flag bit 3).
    pub reset_request: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            master_volume: 100,
            bt_volume: 100,
            bpm: 120,
            a2dp_enabled: true,
            ble_enabled: true,
            flash_request: false,
            reset_request: false,
        }
    }
}

/// Which utility generator a `SET_UTIL` (0x23) frame addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UtilityKind {
    Noise = 0,
    Tone = 1,
    Tuner = 2,
}

/// Utility generator settings (noise, test tone, tuner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtilitySettings {
    pub kind: UtilityKind,
    pub enabled: bool,
    pub level: u8,
    /// Only meaningful for [`UtilityKind::Tone`].
    pub frequency_hz: u16,
}

/// Drum machine and looper controls sent with `SET_DRUM_UPDATE` (0x41).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrumSettings {
    pub drum_enabled: bool,
    pub drum_level: u8,
    pub bpm: u8,
    /// Style index (0–10).
    pub style: u8,
    /// Fill index (0–4).
    pub fill: u8,
    /// Pattern number (1–5).
    pub drum_number: u8,
    pub looper_enabled: bool,
    pub looper_level: u8,
    /// 0 = none, 1 = bar, 2 = beat.
    pub loop_sync: u8,
    /// 0 = none, 1 = low, 2 = high.
    pub loop_arm: u8,
    /// 0 = custom, otherwise 4/8/12/16 bars.
    pub loop_length: u8,
    /// Track count (1–4).
    pub loop_tracks: u8,
}

impl Default for DrumSettings {
    fn default() -> Self {
        Self {
            drum_enabled: false,
            drum_level: 50,
            bpm: 120,
            style: 0,
            fill: 0,
            drum_number: 1,
            looper_enabled: false,
            looper_level: 50,
            loop_sync: 0,
            loop_arm: 0,
            loop_length: 0,
            loop_tracks: 1,
        }
    }
}

/// Number of instrument rows in the drum grid.
pub const DRUM_ROWS: usize = 9;

/// Number of steps per drum grid row.
pub const DRUM_STEPS: usize = 16;

/// Drum grid: 9 instrument rows × 16 steps of velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrumPattern(pub [[u8; DRUM_STEPS]; DRUM_ROWS]);

/// One entry of a NAM model or IR file listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListEntry {
    /// Index 255: discard the current list, a fresh scan follows.
    Clear,
    Item { index: u8, name: String },
}

/// Typed view of an inbound [`Message`], produced by [`crate::parse::interpret`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Current device configuration (`STATE_DATA`, 0x31).
    State(PresetState),
    /// A stored preset requested with a load request (`PRESET_DATA`, 0x34).
    Preset(PresetState),
    /// Detected pitch in Hz (`TUNER_DATA`, 0x35).
    Tuner(f32),
    /// NAM model listing entry (`NAM_LIST_DATA`, 0x45).
    NamModel(DeviceListEntry),
    /// IR file listing entry (`IR_LIST_DATA`, 0x46).
    IrFile(DeviceListEntry),
    /// Anything else, passed through untouched.
    Other(Message),
}

/// Connection health as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped unexpectedly; attempt `attempt` of `max_attempts`
    /// is pending.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Every reconnect attempt failed. The session is finished and must be
    /// restarted by the user.
    ReconnectFailed { attempts: u32 },
}

/// Events emitted by [`crate::session::Session`].
///
/// Consumers receive these through the `mpsc::Receiver` returned by
/// [`crate::session::Session::start`].
#[derive(Debug, Clone, PartialEq)]
pub enum JamEvent {
    Status(ConnectionStatus),
    Message(Message),
}
