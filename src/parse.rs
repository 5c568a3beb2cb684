//! Decoders for inbound JamMate messages.
//!
//! Everything here is pure and bounds-checked: malformed input yields `None`
//! (or [`Inbound::Other`]) rather than a panic. Decoders take the
//! header-stripped payload of a [`Message`] as produced by
//! [`crate::reassembly::Reassembler`].
//!
//! | Command | Decoder | Payload |
//! |---|---|---|
//! | `0x31` STATE_DATA | [`crate::preset::deserialize_state`] | preset blob |
//! | `0x34` PRESET_DATA | [`crate::preset::deserialize_state`] | preset blob |
//! | `0x35` TUNER_DATA | [`parse_tuner`] | `f32` LE pitch in Hz |
//! | `0x45` NAM_LIST_DATA | [`parse_device_list`] | `[index][name]` |
//! | `0x46` IR_LIST_DATA | [`parse_device_list`] | `[index][name]` |

use log::debug;

use crate::layout::EffectLayoutProvider;
use crate::preset::deserialize_state;
use crate::protocol::{Command, HEADER_LEN};
use crate::types::{DeviceListEntry, Inbound, Message};

/// Index value that tells the host to discard its current file listing.
pub const LIST_CLEAR_INDEX: u8 = 255;

/// Decoded `[command][len LE]` prefix of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u8,
    /// Payload length declared by the sender.
    pub payload_len: u16,
}

impl FrameHeader {
    /// Declared length of the whole frame, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// Read the 3-byte frame header. Returns `None` if fewer than 3 bytes.
pub fn decode_header(bytes: &[u8]) -> Option<FrameHeader> {
    match bytes {
        [command, lo, hi, ..] => Some(FrameHeader {
            command: *command,
            payload_len: u16::from_le_bytes([*lo, *hi]),
        }),
        _ => None,
    }
}

/// Detected pitch from a `TUNER_DATA` payload.
///
/// Returns `None` if the payload is shorter than 4 bytes or the value is not
/// a finite frequency.
pub fn parse_tuner(payload: &[u8]) -> Option<f32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    let hz = f32::from_le_bytes(bytes);
    hz.is_finite().then_some(hz)
}

/// One entry of a NAM model or IR file listing.
///
/// The name is decoded lossily; stray NUL padding is trimmed.
pub fn parse_device_list(payload: &[u8]) -> Option<DeviceListEntry> {
    let (&index, name) = payload.split_first()?;
    if index == LIST_CLEAR_INDEX {
        return Some(DeviceListEntry::Clear);
    }
    let name = String::from_utf8_lossy(name)
        .trim_end_matches('\0')
        .to_string();
    Some(DeviceListEntry::Item { index, name })
}

/// Give a complete inbound message a typed shape.
///
/// Messages that are not recognised, or whose payload is too short for their
/// command, come back as [`Inbound::Other`] unchanged.
pub fn interpret(message: &Message, layout: &dyn EffectLayoutProvider) -> Inbound {
    let decoded = match message.kind() {
        Some(Command::StateData) => Some(Inbound::State(deserialize_state(
            &message.payload,
            layout,
        ))),
        Some(Command::PresetData) => Some(Inbound::Preset(deserialize_state(
            &message.payload,
            layout,
        ))),
        Some(Command::TunerData) => parse_tuner(&message.payload).map(Inbound::Tuner),
        Some(Command::NamListData) => parse_device_list(&message.payload).map(Inbound::NamModel),
        Some(Command::IrListData) => parse_device_list(&message.payload).map(Inbound::IrFile),
        _ => None,
    };
    decoded.unwrap_or_else(|| {
        debug!(
            "passing through message 0x{:02x} ({} bytes)",
            message.command,
            message.payload.len()
        );
        Inbound::Other(message.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutTable;

    fn msg(command: u8, payload: &[u8]) -> Message {
        Message {
            command,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn header_needs_three_bytes() {
        assert_eq!(decode_header(&[0x31, 0x10]), None);
        let h = decode_header(&[0x31, 0x2C, 0x01, 0xAA]).unwrap();
        assert_eq!(h.command, 0x31);
        assert_eq!(h.payload_len, 300);
        assert_eq!(h.frame_len(), 303);
    }

    #[test]
    fn tuner_reads_float_at_offset_zero() {
        let payload = 440.0f32.to_le_bytes();
        assert_eq!(parse_tuner(&payload), Some(440.0));
        assert_eq!(parse_tuner(&payload[..3]), None);
        assert_eq!(parse_tuner(&f32::NAN.to_le_bytes()), None);
    }

    #[test]
    fn device_list_clear_and_item() {
        assert_eq!(parse_device_list(&[255]), Some(DeviceListEntry::Clear));
        assert_eq!(parse_device_list(&[]), None);
        assert_eq!(
            parse_device_list(b"\x03Plexi.nam\0\0"),
            Some(DeviceListEntry::Item {
                index: 3,
                name: "Plexi.nam".into()
            })
        );
    }

    #[test]
    fn interpret_dispatches_by_command() {
        let table = LayoutTable::builtin();
        assert_eq!(
            interpret(&msg(0x35, &82.4f32.to_le_bytes()), &table),
            Inbound::Tuner(82.4)
        );
        assert_eq!(
            interpret(&msg(0x46, b"\x00cab.wav"), &table),
            Inbound::IrFile(DeviceListEntry::Item {
                index: 0,
                name: "cab.wav".into()
            })
        );
        assert_eq!(
            interpret(&msg(0x45, &[255]), &table),
            Inbound::NamModel(DeviceListEntry::Clear)
        );
        match interpret(&msg(0x31, &[3, 90, 80, 2, b'H', b'i']), &table) {
            Inbound::State(state) => {
                assert_eq!(state.bpm, 90);
                assert_eq!(state.master_volume, 80);
                assert_eq!(state.name, "Hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            interpret(&msg(0x34, &[]), &table),
            Inbound::Preset(_)
        ));
    }

    #[test]
    fn interpret_passes_through_unknown_and_short() {
        let table = LayoutTable::builtin();
        let unknown = msg(0x7F, &[1, 2, 3]);
        assert_eq!(interpret(&unknown, &table), Inbound::Other(unknown.clone()));
        let short_tuner = msg(0x35, &[0, 0]);
        assert_eq!(
            interpret(&short_tuner, &table),
            Inbound::Other(short_tuner.clone())
        );
    }
}
