//! Connection lifecycle for one JamMate pedal.
//!
//! [`Session::start`] opens the transport, sends the get-state handshake and
//! spawns a driver task. The driver owns the [`Reassembler`], turns
//! notifications into [`JamEvent::Message`]s, and on an unexpected drop runs
//! a bounded reconnect loop:
//!
//! ```text
//! Connecting ─▶ Connected ──(link lost)──▶ Reconnecting{1..=N} ─▶ Connected
//!     │             │                              │
//!     └─(open err)──┴──(disconnect())──▶ Disconnected ◀── ReconnectFailed{N}
//! ```
//!
//! Outbound frames go through [`SessionHandle::send`], which never blocks on
//! a missing link and never returns an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::TransportError;
use crate::protocol::get_state;
use crate::reassembly::Reassembler;
use crate::transport::{LinkEvent, Transport};
use crate::types::{ConnectionStatus, JamEvent, Message};

// ── SessionConfig ────────────────────────────────────────────────────────────

/// Configuration for [`Session::start`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect attempts after an unexpected disconnect. Default: `5`.
    pub max_reconnect_attempts: u32,
    /// Wait before each reconnect attempt. Default: 1.5 s.
    pub reconnect_delay: Duration,
    /// Capacity of the event channel. Default: `256`.
    ///
    /// Raised to at least 2: `Connecting` and `Connected` are queued before
    /// [`Session::start`] hands back the receiver.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1500),
            event_buffer: 256,
        }
    }
}

/// What happened to a frame handed to [`SessionHandle::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the transport.
    Sent,
    /// Dropped because the syncing gate is set.
    Suppressed,
    /// Dropped because there is no open link.
    NotConnected,
    /// The transport rejected the write; the error was logged.
    Failed,
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared<T> {
    transport: T,
    config: SessionConfig,
    syncing: AtomicBool,
    /// Cleared by an intentional disconnect or reconnect exhaustion.
    wanted: AtomicBool,
    connected: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
    /// Fires once, on [`SessionHandle::disconnect`].
    cancel: watch::Sender<bool>,
    events: mpsc::Sender<JamEvent>,
    /// Serialises `wanted` checks with the status they guard, so nothing
    /// follows the `Disconnected` of an intentional disconnect.
    lifecycle: Mutex<()>,
}

impl<T: Transport> Shared<T> {
    async fn set_status(&self, status: ConnectionStatus) {
        info!("session status: {status:?}");
        self.status.send_replace(status);
        let _ = self.events.send(JamEvent::Status(status)).await;
    }

    async fn emit_message(&self, message: Message) {
        debug!(
            "message 0x{:02x} ({} bytes)",
            message.command,
            message.payload.len()
        );
        let _ = self.events.send(JamEvent::Message(message)).await;
    }

    /// Mark the link up and request the current device state.
    ///
    /// Returns `false`, leaving the session untouched, if a disconnect got in
    /// first.
    async fn on_connected(&self) -> bool {
        {
            let _lifecycle = self.lifecycle.lock().await;
            if !self.wanted() {
                return false;
            }
            self.connected.store(true, Ordering::SeqCst);
            self.set_status(ConnectionStatus::Connected).await;
        }
        if let Err(e) = self.transport.write(&get_state()).await {
            warn!("get-state handshake failed: {e}");
        }
        true
    }

    /// Emit `status` unless the session has been given up.
    async fn set_status_if_wanted(&self, status: ConnectionStatus) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.wanted() {
            return false;
        }
        self.set_status(status).await;
        true
    }

    /// Forget the link. The syncing gate belongs to the state load of that
    /// link, so it is cleared too.
    fn link_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.syncing.store(false, Ordering::SeqCst);
    }

    fn wanted(&self) -> bool {
        self.wanted.load(Ordering::SeqCst)
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Entry point for driving a JamMate over any [`Transport`].
///
/// ```no_run
/// use jammate::prelude::*;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let transport = BleTransport::new(BleConfig::default());
/// let (mut rx, handle) = Session::start(transport, SessionConfig::default()).await?;
/// handle.send(&jammate::protocol::load_request(0, 1)).await;
///
/// while let Some(event) = rx.recv().await {
///     if let JamEvent::Status(ConnectionStatus::Disconnected) = event {
///         break;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Session;

impl Session {
    /// Open `transport` and start the session.
    ///
    /// Emits `Connecting`, then `Connected` followed by the `[0x30, 0, 0]`
    /// handshake. If the first open fails, `Disconnected` is emitted and the
    /// error returned; no reconnect is attempted in that case.
    pub async fn start<T: Transport>(
        transport: T,
        config: SessionConfig,
    ) -> Result<(mpsc::Receiver<JamEvent>, SessionHandle<T>), TransportError> {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(2));
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (cancel, cancel_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport,
            config,
            syncing: AtomicBool::new(false),
            wanted: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            status,
            cancel,
            events: tx,
            lifecycle: Mutex::new(()),
        });

        shared.set_status(ConnectionStatus::Connecting).await;
        let link = match shared.transport.open().await {
            Ok(link) => link,
            Err(e) => {
                warn!("open failed: {e}");
                shared.wanted.store(false, Ordering::SeqCst);
                shared.set_status(ConnectionStatus::Disconnected).await;
                return Err(e);
            }
        };
        if !shared.on_connected().await {
            return Err(TransportError::Closed);
        }

        tokio::spawn(drive(Arc::clone(&shared), link, cancel_rx));

        Ok((rx, SessionHandle { shared }))
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

async fn drive<T: Transport>(
    shared: Arc<Shared<T>>,
    mut link: mpsc::Receiver<LinkEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut reassembler = Reassembler::new();
    loop {
        loop {
            tokio::select! {
                event = link.recv() => match event {
                    Some(LinkEvent::Notification(bytes)) => {
                        if let Some(message) = reassembler.push(&bytes) {
                            shared.emit_message(message).await;
                        }
                    }
                    Some(LinkEvent::Disconnected) | None => break,
                },
                _ = cancel.changed() => {
                    reassembler.reset();
                    return;
                }
            }
        }

        reassembler.reset();
        shared.link_down();
        if !shared.wanted() {
            return;
        }
        warn!("link lost, reconnecting");

        match reconnect(&shared, &mut cancel).await {
            Some(next) => link = next,
            None => return,
        }
    }
}

/// Bounded retry loop. Returns the new link, or `None` once the session is over.
async fn reconnect<T: Transport>(
    shared: &Shared<T>,
    cancel: &mut watch::Receiver<bool>,
) -> Option<mpsc::Receiver<LinkEvent>> {
    let max_attempts = shared.config.max_reconnect_attempts;
    for attempt in 1..=max_attempts {
        let announced = shared
            .set_status_if_wanted(ConnectionStatus::Reconnecting {
                attempt,
                max_attempts,
            })
            .await;
        if !announced {
            return None;
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
            _ = cancel.changed() => {
                debug!("reconnect cancelled");
                return None;
            }
        }
        if !shared.wanted() {
            return None;
        }

        info!("reconnect attempt {attempt}/{max_attempts}");
        let opened = tokio::select! {
            opened = shared.transport.open() => opened,
            _ = cancel.changed() => {
                debug!("reconnect cancelled during open");
                let _ = shared.transport.close().await;
                return None;
            }
        };
        match opened {
            Ok(link) => {
                if shared.on_connected().await {
                    return Some(link);
                }
                // disconnect() won the race with a successful open.
                let _ = shared.transport.close().await;
                return None;
            }
            Err(e) => warn!("reconnect attempt {attempt}/{max_attempts} failed: {e}"),
        }
    }

    let _lifecycle = shared.lifecycle.lock().await;
    if shared.wanted.swap(false, Ordering::SeqCst) {
        shared
            .set_status(ConnectionStatus::ReconnectFailed {
                attempts: max_attempts,
            })
            .await;
        shared.set_status(ConnectionStatus::Disconnected).await;
    }
    None
}

// ── SessionHandle ────────────────────────────────────────────────────────────

/// Control surface of a running session.
///
/// Cheap to clone; every clone drives the same session.
pub struct SessionHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> SessionHandle<T> {
    /// Write one frame, unless the link is down or the syncing gate is set.
    ///
    /// Dropped frames are not queued.
    pub async fn send(&self, frame: &[u8]) -> SendOutcome {
        if !self.shared.connected.load(Ordering::SeqCst) {
            debug!("send: not connected, dropping {} bytes", frame.len());
            return SendOutcome::NotConnected;
        }
        if self.shared.syncing.load(Ordering::SeqCst) {
            debug!("send: syncing, dropping {} bytes", frame.len());
            return SendOutcome::Suppressed;
        }
        match self.shared.transport.write(frame).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                warn!("send failed: {e}");
                SendOutcome::Failed
            }
        }
    }

    /// Set while applying a bulk state load so UI echoes are not sent back.
    ///
    /// Cleared whenever the link goes down.
    pub fn set_syncing(&self, syncing: bool) {
        self.shared.syncing.store(syncing, Ordering::SeqCst);
    }

    pub fn is_syncing(&self) -> bool {
        self.shared.syncing.load(Ordering::SeqCst)
    }

    /// Close the link on purpose.
    ///
    /// Stops any reconnect loop in progress and emits `Disconnected`. The
    /// session cannot be restarted; call [`Session::start`] again.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        {
            let _lifecycle = shared.lifecycle.lock().await;
            shared.wanted.store(false, Ordering::SeqCst);
            shared.link_down();
            shared.cancel.send_replace(true);
            if self.status() != ConnectionStatus::Disconnected {
                shared.set_status(ConnectionStatus::Disconnected).await;
            }
        }
        if let Err(e) = shared.transport.close().await {
            warn!("close failed: {e}");
        }
    }

    /// Most recent status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Watch status changes without consuming the event channel.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Scripted transport: each `open` pops the next result (default: fail).
    #[derive(Clone, Default)]
    struct Scripted {
        opens: Arc<Mutex<VecDeque<bool>>>,
        open_calls: Arc<AtomicUsize>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        link: Arc<Mutex<Option<mpsc::Sender<LinkEvent>>>>,
    }

    impl Scripted {
        fn new(opens: &[bool]) -> Self {
            let s = Self::default();
            s.opens.lock().unwrap().extend(opens);
            s
        }

        fn link(&self) -> mpsc::Sender<LinkEvent> {
            self.link.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            if !self.opens.lock().unwrap().pop_front().unwrap_or(false) {
                return Err(TransportError::DeviceNotFound("JamMate".into()));
            }
            let (tx, rx) = mpsc::channel(16);
            *self.link.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.link.lock().unwrap().take();
            Ok(())
        }
    }

    fn fast() -> SessionConfig {
        SessionConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sends_handshake() {
        let mock = Scripted::new(&[true]);
        let (mut rx, handle) = Session::start(mock.clone(), fast()).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(JamEvent::Status(ConnectionStatus::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(JamEvent::Status(ConnectionStatus::Connected))
        );
        assert_eq!(*mock.writes.lock().unwrap(), vec![vec![0x30, 0, 0]]);
        assert!(handle.is_connected());
        assert_eq!(handle.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_reports_disconnected() {
        let mock = Scripted::new(&[false]);
        let err = Session::start(mock.clone(), fast()).await.err().unwrap();
        assert!(matches!(err, TransportError::DeviceNotFound(_)));
        assert_eq!(mock.open_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn syncing_gate_suppresses_sends() {
        let mock = Scripted::new(&[true]);
        let (_rx, handle) = Session::start(mock.clone(), fast()).await.unwrap();

        handle.set_syncing(true);
        assert!(handle.is_syncing());
        assert_eq!(handle.send(&[0x20, 3, 0, 1, 2, 3]).await, SendOutcome::Suppressed);

        handle.set_syncing(false);
        assert_eq!(handle.send(&[0x20, 3, 0, 1, 2, 3]).await, SendOutcome::Sent);
        assert_eq!(mock.writes.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_reassembled() {
        let mock = Scripted::new(&[true]);
        let (mut rx, _handle) = Session::start(mock.clone(), fast()).await.unwrap();
        rx.recv().await;
        rx.recv().await;

        let link = mock.link();
        link.send(LinkEvent::Notification(vec![0x31, 4, 0, 1])).await.unwrap();
        link.send(LinkEvent::Notification(vec![2, 3, 4])).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(JamEvent::Message(Message {
                command: 0x31,
                payload: vec![1, 2, 3, 4]
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot_event_buffer_still_starts() {
        let mock = Scripted::new(&[true]);
        let config = SessionConfig {
            event_buffer: 1,
            ..fast()
        };
        let started = tokio::time::timeout(Duration::from_secs(5), Session::start(mock, config))
            .await
            .expect("start returned");
        let (mut rx, handle) = started.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(JamEvent::Status(ConnectionStatus::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(JamEvent::Status(ConnectionStatus::Connected))
        );
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_syncing() {
        let mock = Scripted::new(&[true]);
        let (_rx, handle) = Session::start(mock, fast()).await.unwrap();
        handle.set_syncing(true);

        handle.disconnect().await;
        assert!(!handle.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_after_connect_is_terminal() {
        let mock = Scripted::new(&[true, true]);
        let (mut rx, handle) = Session::start(mock.clone(), fast()).await.unwrap();
        rx.recv().await;
        rx.recv().await;

        handle.disconnect().await;
        assert_eq!(
            rx.recv().await,
            Some(JamEvent::Status(ConnectionStatus::Disconnected))
        );
        assert_eq!(handle.send(&[0x30, 0, 0]).await, SendOutcome::NotConnected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.open_calls.load(Ordering::SeqCst), 1);
    }
}
