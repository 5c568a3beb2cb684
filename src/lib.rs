//! # jammate
//!
//! Async Rust client for the JamMate Bluetooth LE multi-effects pedal.
//!
//! The pedal exposes one GATT characteristic for control. The host writes
//! length-prefixed command frames to it; the pedal answers with
//! notifications, splitting large state dumps across several of them.
//!
//! ## Quick start
//!
//! ```no_run
//! use jammate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layout = LayoutTable::builtin();
//!     let transport = BleTransport::new(BleConfig::default());
//!     let (mut rx, handle) = Session::start(transport, SessionConfig::default()).await?;
//!
//!     // Enable the delay (slot 14) and turn its first knob to 80.
//!     handle.send(&jammate::protocol::toggle_update(14, true)).await;
//!     handle.send(&jammate::protocol::param_update(14, 1, 80)).await;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             JamEvent::Message(msg) => {
//!                 if let Inbound::State(state) = interpret(&msg, &layout) {
//!                     println!("{} @ {} bpm", state.name, state.bpm);
//!                 }
//!             }
//!             JamEvent::Status(ConnectionStatus::Disconnected) => break,
//!             JamEvent::Status(status) => println!("{status:?}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`protocol`] | GATT UUIDs, command bytes, and outbound frame builders |
//! | [`parse`] | Decoders for inbound messages |
//! | [`layout`] | Effect layout table and flat parameter addressing |
//! | [`preset`] | Preset blob encoder and version-aware decoder |
//! | [`reassembly`] | Notification fragments → complete messages |
//! | [`transport`] | The [`transport::Transport`] seam |
//! | [`ble`] | `btleplug` transport: scan, connect, subscribe |
//! | [`session`] | Connection lifecycle, send gating, reconnect |
//! | [`types`] | Data and event types |
//! | [`error`] | Error types |

pub mod ble;
pub mod error;
pub mod layout;
pub mod parse;
pub mod preset;
pub mod protocol;
pub mod reassembly;
pub mod session;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use jammate::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let scanner = BleTransport::new(BleConfig::default());
/// let device = scanner.scan_all().await?.into_iter().next().unwrap();
/// let transport = BleTransport::with_device(BleConfig::default(), device);
/// let (_rx, handle) = Session::start(transport, SessionConfig::default()).await?;
/// handle.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Session and transport ─────────────────────────────────────────────────
    pub use crate::ble::{BleConfig, BleTransport, JamMateDevice};
    pub use crate::error::{LayoutError, TransportError};
    pub use crate::session::{SendOutcome, Session, SessionConfig, SessionHandle};
    pub use crate::transport::{LinkEvent, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        ConnectionStatus, DeviceListEntry, DrumPattern, DrumSettings, EffectParameterSet,
        EqBand, GlobalSettings, Inbound, JamEvent, Message, PresetState, UtilityKind,
        UtilitySettings,
    };

    // ── Layout and codecs ─────────────────────────────────────────────────────
    pub use crate::layout::{EffectLayout, EffectLayoutProvider, FlatParam, LayoutTable};
    pub use crate::parse::interpret;
    pub use crate::preset::{deserialize_state, serialize_state};
    pub use crate::protocol::Command;
}
