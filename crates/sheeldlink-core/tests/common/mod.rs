//! Mock platform collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sheeldlink_core::device::BoardInfo;
use sheeldlink_core::manager::{DiscoveredDevice, DiscoveryEvent, Scanner};
use sheeldlink_core::protocol::sysex::build_serial_data;
use sheeldlink_core::protocol::{ProtocolError, ShieldFrame};
use sheeldlink_core::transport::{Link, LinkFactory, TransportKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory board link. Tests inject inbound bytes and inspect writes.
pub struct MockLink {
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    closed: CancellationToken,
    refuse_connect: bool,
    fail_writes: AtomicBool,
    empty_reads: AtomicBool,
    reads: AtomicU32,
    sever_after: AtomicUsize,
    max_write: Option<usize>,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Self::build(false, None)
    }

    pub fn refusing() -> Arc<Self> {
        Self::build(true, None)
    }

    pub fn chunked(max_write: usize) -> Arc<Self> {
        Self::build(false, Some(max_write))
    }

    fn build(refuse_connect: bool, max_write: Option<usize>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            writes: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            refuse_connect,
            fail_writes: AtomicBool::new(false),
            empty_reads: AtomicBool::new(false),
            reads: AtomicU32::new(0),
            sever_after: AtomicUsize::new(0),
            max_write,
        })
    }

    /// Deliver bytes as if the board sent them
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.inbound_tx.send(bytes.to_vec());
    }

    /// Every write call, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, w)| w.clone())
            .collect()
    }

    /// Every write call with the time it happened
    pub fn timed_writes(&self) -> Vec<(Instant, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// All written bytes, concatenated
    pub fn written(&self) -> Vec<u8> {
        self.writes().concat()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Make future reads return no bytes without waiting
    pub fn return_empty_reads(&self) {
        self.empty_reads.store(true, Ordering::SeqCst);
    }

    /// Read calls made so far
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Sever the link as soon as `count` writes have gone through
    pub fn sever_after_writes(&self, count: usize) {
        self.sever_after.store(count, Ordering::SeqCst);
    }

    /// Make pending and future reads fail as if the radio dropped
    pub fn sever(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&self) -> Result<(), ProtocolError> {
        if self.refuse_connect {
            return Err(ProtocolError::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.empty_reads.load(Ordering::SeqCst) && !self.closed.is_cancelled() {
            return Ok(Vec::new());
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::Closed),
            bytes = rx.recv() => bytes.ok_or(ProtocolError::Closed),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ProtocolError::Transport("write failed".into()));
        }
        let written = {
            let mut writes = self.writes.lock().unwrap();
            writes.push((Instant::now(), data.to_vec()));
            writes.len()
        };
        let sever_after = self.sever_after.load(Ordering::SeqCst);
        if sever_after > 0 && written >= sever_after {
            self.closed.cancel();
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn max_write_len(&self) -> Option<usize> {
        self.max_write
    }
}

/// Builds mock links, refusing the first `refusals` connections
pub struct MockFactory {
    kind: TransportKind,
    refusals: AtomicU32,
    sever_after: usize,
    opened: Mutex<Vec<(String, Arc<MockLink>)>>,
}

impl MockFactory {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Self::refusing(kind, 0)
    }

    pub fn refusing(kind: TransportKind, refusals: u32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            refusals: AtomicU32::new(refusals),
            sever_after: 0,
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Links that drop right after `writes` writes, e.g. at the end of the handshake
    pub fn severing(kind: TransportKind, writes: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            refusals: AtomicU32::new(0),
            sever_after: writes,
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Most recent link opened for `address`
    pub fn link(&self, address: &str) -> Option<Arc<MockLink>> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(a, _)| a == address)
            .map(|(_, link)| link.clone())
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

impl LinkFactory for MockFactory {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(&self, board: &BoardInfo) -> Result<Arc<dyn Link>, ProtocolError> {
        let refuse = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let link = match (refuse, self.kind) {
            (true, _) => MockLink::refusing(),
            (false, TransportKind::Chunked) => MockLink::chunked(20),
            (false, TransportKind::Stream) => MockLink::new(),
        };
        link.sever_after_writes(self.sever_after);
        self.opened
            .lock()
            .unwrap()
            .push((board.address().to_string(), link.clone()));
        Ok(link)
    }
}

/// Reports a fixed list of devices, optionally followed by a finished signal
pub struct MockScanner {
    devices: Vec<DiscoveredDevice>,
    finish: bool,
    stops: AtomicU32,
    sender: Mutex<VecDeque<mpsc::UnboundedSender<DiscoveryEvent>>>,
}

impl MockScanner {
    pub fn new(devices: Vec<DiscoveredDevice>, finish: bool) -> Arc<Self> {
        Arc::new(Self {
            devices,
            finish,
            stops: AtomicU32::new(0),
            sender: Mutex::new(VecDeque::new()),
        })
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn start_discovery(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), ProtocolError> {
        for device in &self.devices {
            let _ = events.send(DiscoveryEvent::DeviceFound(device.clone()));
        }
        if self.finish {
            let _ = events.send(DiscoveryEvent::Finished);
        }
        // Keep the channel open until stopped
        self.sender.lock().unwrap().push_back(events);
        Ok(())
    }

    async fn stop_discovery(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().clear();
    }
}

pub fn found(address: &str, name: Option<&str>) -> DiscoveredDevice {
    DiscoveredDevice {
        name: name.map(str::to_string),
        address: address.to_string(),
        paired: false,
        kind: None,
    }
}

/// Bytes a board sends for `frame`: library version inserted after the start
/// marker, wrapped in SERIAL_DATA sysex messages
pub fn board_frame(frame: &ShieldFrame, library_version: u8) -> Vec<u8> {
    let mut bytes = frame.to_bytes();
    bytes.insert(1, library_version);
    build_serial_data(&bytes).concat()
}

/// Let background tasks run until they are idle (with a paused clock)
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Wait for the first event matching `pred`, skipping others
pub async fn expect_event<T, F>(events: &mut broadcast::Receiver<T>, pred: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: Fn(&T) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("timed out waiting for event")
}

/// Events already delivered, without waiting
pub fn drain<T: Clone>(events: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
