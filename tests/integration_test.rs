//! Integration tests driving the session manager over an in-memory transport.

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;

use blueteeth::bluetooth::{
    BoxedStream, DeviceHandle, ReadingKind, SessionManager, SessionOptions, Transport,
    TransportError, DEFAULT_RECONNECT_DELAY,
};
use blueteeth::events::SessionEvent;
use blueteeth::state::ConnectionState;
use blueteeth::storage::{ReadingDb, ReadingStore};

const ADDRESS: &str = "00:11:22:AA:BB:CC";
const DENIED_ADDRESS: &str = "00:00:00:00:00:00";

/// Stream half handed to the session; counts itself as a live socket.
struct TrackedStream {
    inner: DuplexStream,
    live: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport whose behaviour the test switches at runtime.
struct ScriptedTransport {
    refuse: AtomicBool,
    hang: AtomicBool,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl ScriptedTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            refuse: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            peers,
        });
        (transport, rx)
    }

    fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn resolve(&self, address: &str) -> Result<DeviceHandle, TransportError> {
        let parts: Vec<&str> = address.split(':').collect();
        let valid = parts.len() == 6
            && parts
                .iter()
                .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        if address == DENIED_ADDRESS {
            return Err(TransportError::PermissionDenied("denied".to_string()));
        }
        Ok(DeviceHandle {
            address: address.to_string(),
        })
    }

    async fn cancel_discovery(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn open(&self, _device: &DeviceHandle) -> Result<BoxedStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let (local, remote) = tokio::io::duplex(1024);
        let _ = self.peers.send(remote);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedStream {
            inner: local,
            live: self.live.clone(),
        }))
    }
}

fn manager(transport: Arc<ScriptedTransport>) -> SessionManager {
    SessionManager::new(transport, ReadingStore::new(100), SessionOptions::default())
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

async fn next_state(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> ConnectionState {
    loop {
        if let SessionEvent::StateChanged(state) = next_event(events).await {
            return state;
        }
    }
}

/// Let every runnable task settle without passing the reconnect delay.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cap() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    for attempt in 1..=3 {
        let peer = peers.recv().await.unwrap();
        let dropped_at = Instant::now();
        drop(peer);

        assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_attempts(), attempt);
        assert!(manager.is_reconnect_pending());

        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert!(dropped_at.elapsed() >= DEFAULT_RECONNECT_DELAY);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    }

    drop(peers.recv().await.unwrap());
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert!(!manager.is_reconnect_pending());

    tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 3).await;
    assert!(events.try_recv().is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.opens(), 4);
    assert_eq!(transport.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_connect_resets_attempts() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    drop(peers.recv().await.unwrap());
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert_eq!(manager.reconnect_attempts(), 1);

    // Explicit connect before the retry fires replaces it
    manager.connect(ADDRESS);
    assert_eq!(manager.reconnect_attempts(), 0);
    assert!(!manager.is_reconnect_pending());
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 2).await;
    assert!(events.try_recv().is_err());
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_under_back_to_back_connect() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    settle().await;
    assert_eq!(transport.live(), 1);

    // Reconnecting while connected closes the first socket
    let mut first = peers.recv().await.unwrap();
    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    settle().await;
    assert_eq!(transport.live(), 1);
    assert!(manager.has_active_worker());
    assert!(first.write_all(b"Data1:1\r\n").await.is_err());

    let mut second = peers.recv().await.unwrap();
    second.write_all(b"Data1:2\r\n").await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::LineReceived { line, .. } => assert_eq!(line, b"Data1:2".to_vec()),
        other => panic!("unexpected event: {:?}", other),
    }
    settle().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_from_connected() {
    let (transport, _peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    manager.disconnect();
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);

    // Never reconnects after an explicit disconnect
    tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 3).await;
    assert!(events.try_recv().is_err());
    assert_eq!(transport.opens(), 1);
    assert_eq!(transport.live(), 0);
    assert!(!manager.has_active_worker());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_from_connecting() {
    let (transport, _peers) = ScriptedTransport::new();
    transport.set_hang(true);
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    settle().await;
    assert_eq!(transport.opens(), 1);

    manager.disconnect();
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);

    settle().await;
    assert!(events.try_recv().is_err());
    assert!(!manager.has_active_worker());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_from_connection_failed() {
    let (transport, _peers) = ScriptedTransport::new();
    transport.set_refuse(true);
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(
        next_state(&mut events).await,
        ConnectionState::ConnectionFailed
    );

    // Initial connect failures are not retried
    tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 3).await;
    assert!(events.try_recv().is_err());
    assert_eq!(transport.opens(), 1);
    assert_eq!(manager.reconnect_attempts(), 0);

    manager.disconnect();
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_ends_in_connection_failed() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    transport.set_refuse(true);
    drop(peers.recv().await.unwrap());
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(
        next_state(&mut events).await,
        ConnectionState::ConnectionFailed
    );

    tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 3).await;
    assert!(events.try_recv().is_err());
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_disabled() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    manager.set_auto_reconnect(false);
    assert!(!manager.auto_reconnect());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    drop(peers.recv().await.unwrap());
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);

    tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 2).await;
    assert!(events.try_recv().is_err());
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resolution_failures() {
    let (transport, _peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    manager.connect("not-an-address");
    assert_eq!(
        next_state(&mut events).await,
        ConnectionState::ConnectionFailed
    );
    assert_eq!(manager.last_address().as_deref(), Some("not-an-address"));

    manager.connect(DENIED_ADDRESS);
    assert_eq!(
        next_state(&mut events).await,
        ConnectionState::ConnectionFailed
    );

    settle().await;
    assert!(events.try_recv().is_err());
    assert_eq!(transport.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_measuring_mode() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    manager.set_auto_reconnect(false);
    let mut events = manager.subscribe();

    assert!(!manager.start_measuring());

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

    let mut peer = peers.recv().await.unwrap();

    // Lines before measuring are only published raw
    peer.write_all(b"Data1:100\r\n").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::LineReceived {
            line: b"Data1:100".to_vec(),
            reading: None
        }
    );

    assert!(manager.start_measuring());
    peer.write_all(b"Data2:21.50%\r\nDataX:1\r\nData3:3.30V\r\n")
        .await
        .unwrap();

    let mut parsed = Vec::new();
    for _ in 0..3 {
        match next_event(&mut events).await {
            SessionEvent::LineReceived { reading, .. } => parsed.push(reading),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(parsed[1].is_none());
    assert_eq!(parsed[0].as_ref().unwrap().kind(), ReadingKind::OxygenPercent);
    assert_eq!(parsed[2].as_ref().unwrap().kind(), ReadingKind::Voltage);

    let readings = manager.readings();
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].value(), 21.50);
    assert_eq!(readings[1].value(), 3.30);

    drop(peer);
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert!(!manager.is_measuring());

    manager.clear_readings();
    assert!(manager.readings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readings_reach_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(ReadingDb::new(dir.path()).unwrap());

    let (transport, mut peers) = ScriptedTransport::new();
    let store = ReadingStore::new(1).with_durable(db.clone());
    let manager = SessionManager::new(transport, store, SessionOptions::default());
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    assert!(manager.start_measuring());

    let mut peer = peers.recv().await.unwrap();
    peer.write_all(b"Data2:20.90%\r\nData2:21.00%\r\n")
        .await
        .unwrap();
    for _ in 0..2 {
        next_event(&mut events).await;
    }

    // Eviction from the retention buffer keeps durable copies
    assert_eq!(manager.readings().len(), 1);
    assert_eq!(db.count().unwrap(), 2);
    assert_eq!(db.count_by_kind(ReadingKind::OxygenPercent).unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_consumer_sees_reconnect_in_progress() {
    let (transport, mut peers) = ScriptedTransport::new();
    let manager = manager(transport.clone());
    let mut events = manager.subscribe();

    assert!(manager.is_inactive());
    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    assert!(!manager.is_inactive());

    // Fall behind by more than the reconnect delay before handling the drop
    drop(peers.recv().await.unwrap());
    tokio::time::sleep(DEFAULT_RECONNECT_DELAY + Duration::from_millis(10)).await;

    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert!(!manager.is_reconnect_pending());
    assert!(!manager.is_inactive());
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.set_auto_reconnect(false);
    drop(peers.recv().await.unwrap());
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    assert!(manager.is_inactive());
}

#[tokio::test(start_paused = true)]
async fn test_connection_failed_is_inactive() {
    let (transport, _peers) = ScriptedTransport::new();
    transport.set_refuse(true);
    let manager = manager(transport);
    let mut events = manager.subscribe();

    manager.connect(ADDRESS);
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert!(!manager.is_inactive());
    assert_eq!(
        next_state(&mut events).await,
        ConnectionState::ConnectionFailed
    );
    assert!(manager.is_inactive());
}
