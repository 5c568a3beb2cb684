//! Session lifecycle against an in-memory transport, on paused tokio time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use jammate::prelude::*;

#[derive(Clone, Default)]
struct MockTransport {
    /// Result of each successive `open`; an empty script fails.
    script: Arc<Mutex<VecDeque<bool>>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    link: Arc<Mutex<Option<mpsc::Sender<LinkEvent>>>>,
    /// While set, `open` parks until `release` is notified.
    hold: Arc<AtomicBool>,
    release: Arc<Notify>,
}

impl MockTransport {
    fn scripted(results: &[bool]) -> Self {
        let mock = Self::default();
        mock.script.lock().unwrap().extend(results);
        mock
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn hold_opens(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    fn release_opens(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    async fn notify(&self, bytes: &[u8]) {
        let link = self.link.lock().unwrap().clone().expect("link open");
        link.send(LinkEvent::Notification(bytes.to_vec()))
            .await
            .unwrap();
    }

    async fn drop_link(&self) {
        let link = self.link.lock().unwrap().take().expect("link open");
        link.send(LinkEvent::Disconnected).await.unwrap();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let ok = self.script.lock().unwrap().pop_front().unwrap_or(false);
        if !ok {
            return Err(TransportError::Timeout("connect"));
        }
        let (tx, rx) = mpsc::channel(32);
        *self.link.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.link.lock().unwrap().is_none() {
            return Err(TransportError::NotConnected);
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.link.lock().unwrap().take();
        Ok(())
    }
}

async fn next_status(rx: &mut mpsc::Receiver<JamEvent>) -> ConnectionStatus {
    loop {
        match rx.recv().await.expect("event channel open") {
            JamEvent::Status(s) => return s,
            JamEvent::Message(_) => continue,
        }
    }
}

async fn next_message(rx: &mut mpsc::Receiver<JamEvent>) -> Message {
    loop {
        match rx.recv().await.expect("event channel open") {
            JamEvent::Message(m) => return m,
            JamEvent::Status(_) => continue,
        }
    }
}

async fn connected(mock: &MockTransport) -> (mpsc::Receiver<JamEvent>, SessionHandle<MockTransport>) {
    let (mut rx, handle) = Session::start(mock.clone(), SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Connected);
    (rx, handle)
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_five_failures() {
    let mock = MockTransport::scripted(&[true]);
    let (mut rx, handle) = connected(&mock).await;

    mock.drop_link().await;
    for attempt in 1..=5 {
        assert_eq!(
            next_status(&mut rx).await,
            ConnectionStatus::Reconnecting {
                attempt,
                max_attempts: 5
            }
        );
    }
    assert_eq!(
        next_status(&mut rx).await,
        ConnectionStatus::ReconnectFailed { attempts: 5 }
    );
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Disconnected);
    assert_eq!(mock.opens(), 6);

    // No sixth attempt, however long we wait.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(mock.opens(), 6);
    assert!(!handle.is_connected());
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn retry_waits_for_the_configured_delay() {
    let mock = MockTransport::scripted(&[true, false, true]);
    let (mut rx, _handle) = connected(&mock).await;
    let dropped_at = tokio::time::Instant::now();

    mock.drop_link().await;
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { attempt: 1, .. }
    ));
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { attempt: 2, .. }
    ));
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Connected);
    assert!(dropped_at.elapsed() >= Duration::from_millis(3000));
    assert_eq!(mock.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_repeats_handshake() {
    let mock = MockTransport::scripted(&[true, true]);
    let (mut rx, handle) = connected(&mock).await;

    mock.drop_link().await;
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { attempt: 1, .. }
    ));
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Connected);
    assert_eq!(mock.writes(), vec![vec![0x30, 0, 0], vec![0x30, 0, 0]]);
    assert_eq!(handle.send(&[0x33, 2, 0, 0, 1]).await, SendOutcome::Sent);
}

#[tokio::test(start_paused = true)]
async fn intentional_disconnect_cancels_retry_loop() {
    let mock = MockTransport::scripted(&[true, true]);
    let (mut rx, handle) = connected(&mock).await;

    mock.drop_link().await;
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { attempt: 1, .. }
    ));
    handle.disconnect().await;
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.opens(), 1);
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn intentional_disconnect_does_not_reconnect() {
    let mock = MockTransport::scripted(&[true, true]);
    let (mut rx, handle) = connected(&mock).await;

    handle.disconnect().await;
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Disconnected);
    assert_eq!(mock.closes.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.opens(), 1);
    assert_eq!(handle.send(&[0x30, 0, 0]).await, SendOutcome::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_message_discards_partial_data() {
    let mock = MockTransport::scripted(&[true, true]);
    let (mut rx, _handle) = connected(&mock).await;

    mock.notify(&[0x31, 10, 0, 1, 2, 3]).await;
    mock.drop_link().await;
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { .. }
    ));
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Connected);

    // Would complete the stale 0x31 message if it had survived.
    mock.notify(&[0x34, 2, 0, 7, 8]).await;
    let msg = next_message(&mut rx).await;
    assert_eq!(msg.command, 0x34);
    assert_eq!(msg.payload, [7, 8]);
}

#[tokio::test(start_paused = true)]
async fn sends_are_gated() {
    let mock = MockTransport::scripted(&[true]);
    let (_rx, handle) = connected(&mock).await;
    let frame = jammate::protocol::param_update(3, 5, 200);

    handle.set_syncing(true);
    assert_eq!(handle.send(&frame).await, SendOutcome::Suppressed);
    handle.set_syncing(false);
    assert_eq!(handle.send(&frame).await, SendOutcome::Sent);
    assert_eq!(mock.writes(), vec![vec![0x30, 0, 0], frame]);
}

#[tokio::test(start_paused = true)]
async fn status_watch_follows_events() {
    let mock = MockTransport::scripted(&[true]);
    let (mut rx, handle) = connected(&mock).await;
    let mut status = handle.subscribe_status();
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

    mock.drop_link().await;
    next_status(&mut rx).await;
    status.changed().await.unwrap();
    assert!(matches!(
        *status.borrow(),
        ConnectionStatus::Reconnecting { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnect_open_is_final() {
    let mock = MockTransport::scripted(&[true, true]);
    let (mut rx, handle) = connected(&mock).await;
    mock.hold_opens();

    mock.drop_link().await;
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { attempt: 1, .. }
    ));
    // Past the retry delay: the reconnect open is now parked.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(mock.opens(), 2);

    tokio::time::timeout(Duration::from_secs(1), handle.disconnect())
        .await
        .expect("disconnect does not wait for the pending open");
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Disconnected);

    mock.release_opens();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err(), "nothing follows Disconnected");
    assert!(!handle.is_connected());
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    assert_eq!(mock.writes(), vec![vec![0x30, 0, 0]]);
}

#[tokio::test(start_paused = true)]
async fn link_loss_clears_syncing() {
    let mock = MockTransport::scripted(&[true, true]);
    let (mut rx, handle) = connected(&mock).await;
    handle.set_syncing(true);

    mock.drop_link().await;
    assert!(matches!(
        next_status(&mut rx).await,
        ConnectionStatus::Reconnecting { attempt: 1, .. }
    ));
    assert!(!handle.is_syncing());
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Connected);
    assert_eq!(
        handle.send(&jammate::protocol::get_state()).await,
        SendOutcome::Sent
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_syncing_and_gates_sends() {
    let mock = MockTransport::scripted(&[true]);
    let (mut rx, handle) = connected(&mock).await;
    handle.set_syncing(true);

    handle.disconnect().await;
    assert_eq!(next_status(&mut rx).await, ConnectionStatus::Disconnected);
    assert!(!handle.is_syncing());
    assert_eq!(handle.send(&[0x30, 0, 0]).await, SendOutcome::NotConnected);
}
