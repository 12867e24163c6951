//! Scan/connect state machine and connected-device registry
//!
//! The [`Manager`] is an explicit handle: build one per process (or per
//! test) with a [`Backend`] describing the platform, and pass clones of it
//! around. At most one manager-level operation, a scan or a connection
//! attempt, runs at a time. Conflicts are reported on the event channel and
//! never disturb the operation already running.

mod discovery;

pub use discovery::{is_board, DiscoveredDevice, DiscoveryEvent, Scanner};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::device::{BoardInfo, Device, DeviceEvent};
use crate::lock;
use crate::protocol::{OperationError, ProtocolError, ShieldFrame};
use crate::transport::{Connector, LinkFactory, TransportKind};

/// Manager-level operation state. Scanning and connecting never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No operation running
    #[default]
    Ready,
    /// Discovery running
    Scanning,
    /// Connection attempt running
    Connecting,
}

/// Notifications delivered to manager subscribers
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A scan began
    ScanStarted,
    /// A board was seen for the first time in this scan
    BoardFound(Device),
    /// The scan ended; every board seen during it, once each
    ScanFinished(Vec<Device>),
    /// A connection try failed and another is about to start
    ConnectionRetry { address: String, attempt: u32 },
    /// A board connected and joined the registry
    Connected(String),
    /// A connection attempt was cancelled
    ConnectionCancelled(String),
    /// A registered board disconnected
    Disconnected(String),
    /// A request was refused or an operation failed
    Error(OperationError),
}

/// Platform collaborators
#[derive(Clone, Default)]
pub struct Backend {
    /// Device discovery, if the platform supports it
    pub scanner: Option<Arc<dyn Scanner>>,
    /// Link construction strategies, tried in order per transport kind
    pub factories: Vec<Arc<dyn LinkFactory>>,
}

impl Backend {
    /// Backend with only link factories
    pub fn new(factories: Vec<Arc<dyn LinkFactory>>) -> Self {
        Self {
            scanner: None,
            factories,
        }
    }

    /// Add a scanner
    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }
}

struct Operation {
    state: ConnectionState,
    id: u64,
    cancel: CancellationToken,
}

struct Registered {
    device: Device,
    watcher: JoinHandle<()>,
}

struct ManagerInner {
    config: ManagerConfig,
    scanner: Option<Arc<dyn Scanner>>,
    connector: Connector,
    events: broadcast::Sender<ManagerEvent>,
    operation: Mutex<Operation>,
    registry: Mutex<HashMap<String, Registered>>,
    known: Mutex<HashMap<String, Device>>,
}

/// Handle to the driver. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager. Fails if the configuration is invalid or no link factory is installed.
    pub fn new(config: ManagerConfig, backend: Backend) -> Result<Self, ProtocolError> {
        config.validate()?;
        if backend.factories.is_empty() {
            return Err(ProtocolError::NotInitialized(
                "no link factory installed".to_string(),
            ));
        }

        let connector = Connector::new(backend.factories, config.retry.clone(), config.chunk.clone());
        let (events, _) = broadcast::channel(config.device.event_capacity);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                scanner: backend.scanner,
                connector,
                events,
                operation: Mutex::new(Operation {
                    state: ConnectionState::Ready,
                    id: 0,
                    cancel: CancellationToken::new(),
                }),
                registry: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Current operation state
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.operation).state
    }

    /// Receive manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Device handle for a board, shared with any earlier handle for the same address
    pub fn device(&self, info: BoardInfo) -> Device {
        self.inner.device_for(info)
    }

    /// Scan for the configured default duration
    pub fn scan(&self) -> Result<(), ProtocolError> {
        self.scan_for(self.inner.config.scan_timeout())
    }

    /// Scan for `timeout`, or until cancelled or the platform finishes.
    ///
    /// Returns an error only when no scanner is installed. A conflicting
    /// operation is reported as [`ManagerEvent::Error`].
    pub fn scan_for(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let scanner = self
            .inner
            .scanner
            .clone()
            .ok_or_else(|| ProtocolError::Unsupported("no scanner installed".to_string()))?;

        let (id, cancel) = match self.inner.begin(ConnectionState::Scanning) {
            Ok(started) => started,
            Err(conflict) => {
                tracing::debug!("scan refused: {}", conflict);
                self.inner.emit(ManagerEvent::Error(conflict));
                return Ok(());
            }
        };

        tracing::info!("scanning for {:?}", timeout);
        self.inner.emit(ManagerEvent::ScanStarted);
        tokio::spawn(run_scan(self.inner.clone(), scanner, id, cancel, timeout));
        Ok(())
    }

    /// Stop a running scan. No-op otherwise.
    pub fn cancel_scanning(&self) {
        self.inner.cancel(ConnectionState::Scanning);
    }

    /// Connect to a board.
    ///
    /// Returns an error only when no link factory handles the board's
    /// transport kind. Conflicts, capacity and failures are reported on the
    /// event channel. Once the request is accepted, `device` becomes the
    /// manager's handle for its address and is the one that connects.
    pub fn connect(&self, device: &Device) -> Result<(), ProtocolError> {
        let info = device.info();
        if !self.inner.connector.supports(info.kind) {
            return Err(ProtocolError::Unsupported(format!(
                "no link factory for {:?} transports",
                info.kind
            )));
        }
        let address = info.address().to_string();

        let started = {
            let mut operation = lock(&self.inner.operation);
            let registry = lock(&self.inner.registry);
            if let Some(conflict) = conflict_with(operation.state) {
                Err(conflict)
            } else if registry.contains_key(&address) {
                Err(OperationError::AlreadyConnected(address.clone()))
            } else if registry.len() >= self.inner.config.device_limit() {
                Err(OperationError::CapacityReached(self.inner.config.device_limit()))
            } else {
                Ok(operation.start(ConnectionState::Connecting))
            }
        };

        let (id, cancel) = match started {
            Ok(started) => started,
            Err(conflict) => {
                tracing::debug!("connection to {} refused: {}", address, conflict);
                self.inner.emit(ManagerEvent::Error(conflict));
                return Ok(());
            }
        };

        tracing::info!("connecting to {}", address);
        self.inner.adopt(device);
        tokio::spawn(run_connect(self.inner.clone(), device.clone(), id, cancel));
        Ok(())
    }

    /// Abandon a running connection attempt. No-op otherwise.
    pub fn cancel_connecting(&self) {
        self.inner.cancel(ConnectionState::Connecting);
    }

    /// Disconnect one board
    pub fn disconnect(&self, device: &Device) {
        let address = device.address();
        let registered = lock(&self.inner.registry)
            .get(&address)
            .map(|r| r.device.clone());
        match registered {
            Some(device) => device.disconnect(),
            None => self
                .inner
                .emit(ManagerEvent::Error(OperationError::NotConnected(address))),
        }
    }

    /// Disconnect every registered board
    pub fn disconnect_all(&self) {
        for device in self.connected_devices() {
            device.disconnect();
        }
    }

    /// Snapshot of the registered boards
    pub fn connected_devices(&self) -> Vec<Device> {
        lock(&self.inner.registry)
            .values()
            .map(|r| r.device.clone())
            .collect()
    }

    /// Whether a board with this address is registered
    pub fn is_connected(&self, address: &str) -> bool {
        lock(&self.inner.registry).contains_key(address)
    }

    /// Send a frame to every registered board except those listed.
    /// Returns how many boards it was sent to.
    pub fn broadcast_frame(&self, frame: &ShieldFrame, except: &[&str]) -> usize {
        let targets = self.inner.targets(except);
        for device in &targets {
            device.send_frame(frame.clone());
        }
        targets.len()
    }

    /// Send raw serial bytes to every registered board except those listed.
    /// Returns how many boards they were sent to.
    pub fn broadcast_serial_data(&self, data: &[u8], except: &[&str]) -> usize {
        let targets = self.inner.targets(except);
        for device in &targets {
            device.send_serial_data(data);
        }
        targets.len()
    }

    /// Cancel any operation and disconnect every board
    pub fn shutdown(&self) {
        self.inner.cancel(ConnectionState::Scanning);
        self.inner.cancel(ConnectionState::Connecting);

        let registered: Vec<(String, Registered)> = lock(&self.inner.registry).drain().collect();
        for (address, entry) in registered {
            entry.watcher.abort();
            entry.device.disconnect();
            self.inner.emit(ManagerEvent::Disconnected(address));
        }
        tracing::info!("manager shut down");
    }
}

fn conflict_with(state: ConnectionState) -> Option<OperationError> {
    match state {
        ConnectionState::Ready => None,
        ConnectionState::Scanning => Some(OperationError::ScanInProgress),
        ConnectionState::Connecting => Some(OperationError::ConnectInProgress),
    }
}

impl Operation {
    fn start(&mut self, state: ConnectionState) -> (u64, CancellationToken) {
        self.id += 1;
        self.state = state;
        self.cancel = CancellationToken::new();
        (self.id, self.cancel.clone())
    }
}

impl ManagerInner {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn begin(&self, state: ConnectionState) -> Result<(u64, CancellationToken), OperationError> {
        let mut operation = lock(&self.operation);
        if let Some(conflict) = conflict_with(operation.state) {
            return Err(conflict);
        }
        Ok(operation.start(state))
    }

    /// Return to Ready if operation `id` is still the current one
    fn finish(&self, id: u64) {
        let mut operation = lock(&self.operation);
        if operation.id == id {
            operation.state = ConnectionState::Ready;
        }
    }

    fn cancel(&self, state: ConnectionState) {
        let operation = lock(&self.operation);
        if operation.state == state {
            tracing::debug!("cancelling {:?}", state);
            operation.cancel.cancel();
        }
    }

    fn device_for(&self, info: BoardInfo) -> Device {
        lock(&self.known)
            .entry(info.address().to_string())
            .or_insert_with(|| Device::new(info, self.config.device.clone()))
            .clone()
    }

    /// Make a caller-built handle the known one for its address
    fn adopt(&self, device: &Device) {
        lock(&self.known).insert(device.address(), device.clone());
    }

    fn targets(&self, except: &[&str]) -> Vec<Device> {
        lock(&self.registry)
            .iter()
            .filter(|(address, _)| !except.contains(&address.as_str()))
            .map(|(_, r)| r.device.clone())
            .collect()
    }

    /// Turn a discovery report into a device handle, or `None` for non-boards
    fn classify(&self, found: DiscoveredDevice) -> Option<Device> {
        if !is_board(found.name.as_deref(), &self.config.board_name_markers) {
            tracing::trace!("ignoring {} ({:?})", found.address, found.name);
            return None;
        }
        let kind = found.kind.unwrap_or(TransportKind::Stream);
        let device = self.device_for(BoardInfo::new(found.address, kind));
        device.update_discovery(found.name, found.paired, Utc::now());
        Some(device)
    }

    /// Add a connected device and watch it for disconnection. The watcher
    /// holds off unregistering until the returned sender fires or drops, so
    /// `Connected` can be announced first.
    fn register(
        self: &Arc<Self>,
        device: Device,
        mut events: broadcast::Receiver<DeviceEvent>,
    ) -> oneshot::Sender<()> {
        let address = device.address();
        let (announced, wait_announced) = oneshot::channel::<()>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let watched = device.clone();
        let watched_address = address.clone();

        // Held across the spawn so the watcher cannot unregister before the insert
        let mut registry = lock(&self.registry);
        let watcher = tokio::spawn(async move {
            let mut live = false;
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Connected) => live = true,
                    Ok(DeviceEvent::Disconnected { .. }) if live => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("registry watcher missed {} events", missed);
                        if !watched.is_connected() {
                            break;
                        }
                        live = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = wait_announced.await;
            if let Some(inner) = weak.upgrade() {
                inner.unregister(&watched_address);
            }
        });

        registry.insert(address, Registered { device, watcher });
        announced
    }

    fn unregister(&self, address: &str) {
        if lock(&self.registry).remove(address).is_some() {
            tracing::info!("{} left the registry", address);
            self.emit(ManagerEvent::Disconnected(address.to_string()));
        }
    }
}

async fn run_scan(
    inner: Arc<ManagerInner>,
    scanner: Arc<dyn Scanner>,
    id: u64,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut boards: Vec<Device> = Vec::new();

    match scanner.start_discovery(tx).await {
        Ok(()) => {
            let mut seen = HashSet::new();
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("scan cancelled");
                        break;
                    }
                    _ = &mut deadline => {
                        tracing::debug!("scan timed out");
                        break;
                    }
                    event = rx.recv() => match event {
                        Some(DiscoveryEvent::DeviceFound(found)) => {
                            let Some(device) = inner.classify(found) else {
                                continue;
                            };
                            if seen.insert(device.address()) {
                                tracing::debug!("found board {}", device.address());
                                boards.push(device.clone());
                                inner.emit(ManagerEvent::BoardFound(device));
                            }
                        }
                        Some(DiscoveryEvent::Finished) | None => break,
                    }
                }
            }
            scanner.stop_discovery().await;
        }
        Err(e) => {
            tracing::warn!("discovery failed to start: {}", e);
            inner.emit(ManagerEvent::Error(OperationError::DiscoveryFailed(
                e.to_string(),
            )));
        }
    }

    inner.finish(id);
    tracing::info!("scan finished with {} boards", boards.len());
    inner.emit(ManagerEvent::ScanFinished(boards));
}

async fn run_connect(inner: Arc<ManagerInner>, device: Device, id: u64, cancel: CancellationToken) {
    let address = device.address();
    let info = device.info();
    let device_events = device.subscribe();

    let retries = inner.events.clone();
    let retry_address = address.clone();
    let attempt = async {
        let transport = inner
            .connector
            .establish(&info, move |attempt| {
                tracing::info!("retrying {} (attempt {})", retry_address, attempt);
                let _ = retries.send(ManagerEvent::ConnectionRetry {
                    address: retry_address.clone(),
                    attempt,
                });
            })
            .await?;
        device.attach(transport).await
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        result = attempt => Some(result),
    };

    match outcome {
        Some(Ok(())) => {
            let announced = inner.register(device.clone(), device_events);
            inner.finish(id);
            inner.emit(ManagerEvent::Connected(address));
            let _ = announced.send(());
        }
        Some(Err(e)) => {
            tracing::warn!("connection to {} failed: {}", address, e);
            device.disconnect();
            inner.finish(id);
            inner.emit(ManagerEvent::Error(OperationError::ConnectionFailed {
                address,
                reason: e.to_string(),
            }));
        }
        None => {
            tracing::info!("connection to {} cancelled", address);
            device.disconnect();
            inner.finish(id);
            inner.emit(ManagerEvent::ConnectionCancelled(address));
        }
    }
}
