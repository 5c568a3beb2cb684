//! Reassembly of MTU-limited BLE notifications into complete [`Message`]s.
//!
//! Only the two bulk commands, `STATE_DATA` (0x31) and `PRESET_DATA` (0x34),
//! are ever split across notifications. Their first fragment carries the
//! header; continuation fragments are raw payload bytes with no header of
//! their own. Everything else fits in one notification and is delivered
//! straight away.
//!
//! ```text
//! Idle ──(0x31/0x34 header)──▶ Accumulating ──(len ≥ expected)──▶ deliver, Idle
//!  │                               │
//!  └──(any other packet)──▶ deliver └──(reset)──▶ discard, Idle
//! ```
//!
//! The reassembler is not thread-safe; the session's driver task owns it.

use log::{debug, warn};

use crate::parse::decode_header;
use crate::protocol::{Command, HEADER_LEN};
use crate::types::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating {
        command: u8,
        expected: u16,
        pending: Vec<u8>,
    },
}

/// Turns a sequence of notification fragments into complete messages.
#[derive(Debug, Clone)]
pub struct Reassembler {
    state: State,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Feed one notification.
    ///
    /// Returns the message it completes, if any. The payload of a bulk
    /// message is exactly its declared length; surplus bytes in the final
    /// fragment are dropped.
    pub fn push(&mut self, packet: &[u8]) -> Option<Message> {
        match &mut self.state {
            State::Accumulating { pending, .. } => {
                pending.extend_from_slice(packet);
                self.take_if_complete()
            }
            State::Idle => self.start(packet),
        }
    }

    fn start(&mut self, packet: &[u8]) -> Option<Message> {
        let &command = packet.first()?;
        let kind = Command::try_from(command).ok();

        if kind.is_some_and(Command::is_large) {
            let Some(header) = decode_header(packet) else {
                warn!(
                    "dropping {}-byte fragment of bulk command 0x{command:02x}: header incomplete",
                    packet.len()
                );
                return None;
            };
            debug!(
                "bulk message 0x{command:02x}: expecting {} bytes",
                header.payload_len
            );
            self.state = State::Accumulating {
                command,
                expected: header.payload_len,
                pending: packet[HEADER_LEN..].to_vec(),
            };
            return self.take_if_complete();
        }

        let header_len = kind.map_or(HEADER_LEN, Command::inbound_header_len);
        let payload = packet.get(header_len..).unwrap_or_default().to_vec();
        Some(Message { command, payload })
    }

    fn take_if_complete(&mut self) -> Option<Message> {
        match &self.state {
            State::Accumulating {
                expected, pending, ..
            } if pending.len() >= *expected as usize => {}
            _ => return None,
        }
        let State::Accumulating {
            command,
            expected,
            mut pending,
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return None;
        };
        if pending.len() > expected as usize {
            debug!(
                "bulk message 0x{command:02x}: dropping {} surplus bytes",
                pending.len() - expected as usize
            );
            pending.truncate(expected as usize);
        }
        Some(Message {
            command,
            payload: pending,
        })
    }

    /// Discard any partially received message.
    pub fn reset(&mut self) {
        if let State::Accumulating {
            command, pending, ..
        } = &self.state
        {
            debug!(
                "discarding partial 0x{command:02x} message ({} bytes)",
                pending.len()
            );
        }
        self.state = State::Idle;
    }

    /// `true` when no bulk message is in progress.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Bytes collected so far for the message in progress.
    pub fn pending_len(&self) -> usize {
        match &self.state {
            State::Accumulating { pending, .. } => pending.len(),
            State::Idle => 0,
        }
    }
}
