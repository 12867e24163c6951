//! Per-board protocol engine
//!
//! A [`Device`] owns one board's session. Once a [`Transport`] is attached it
//! runs four background tasks:
//! - reader: drains inbound bytes from the transport into a queue
//! - decoder: runs the [`StreamDecoder`] and dispatches what it recovers
//! - writer: serializes every outbound message onto the transport
//! - drain: releases frames held back by the [`OutboundGate`]
//!
//! Any transport failure tears the session down and publishes
//! [`DeviceEvent::Disconnected`]. Public operations never block; answers
//! from the board arrive as [`DeviceEvent`]s.

mod events;
mod gate;
mod info;
mod pins;

pub use events::{DeviceEvent, DisconnectReason};
pub use gate::{GateRelease, OutboundGate};
pub use info::BoardInfo;
pub use pins::{validate_analog_pin, validate_pin, PinState, ANALOG_CHANNELS};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::config::DeviceConfig;
use crate::protocol::sysex::{
    analog_message, build_serial_data, digital_port_message, pin_mode_message,
    report_digital_message,
};
use crate::protocol::{
    build_sysex, config_shield, Command, DecodedEvent, InboundFrame, OperationError, PinMode,
    ProtocolError, ShieldFrame, StreamDecoder, SysexCommand, MAX_BOARD_NAME_LEN, PORT_COUNT,
    TOTAL_PINS,
};
use crate::lock;
use crate::timer::TimeoutTimer;
use crate::transport::Transport;

/// Bytes in a board testing challenge
pub const CHALLENGE_LEN: usize = 3;

/// Pause after a read that returned nothing
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(10);

/// Session state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// No session
    #[default]
    Disconnected,
    /// Transport attached, handshake running
    Handshaking,
    /// Handshake done
    Connected,
}

/// Shield frame as it travels to the board: split over SERIAL_DATA sysex messages
fn frame_message(frame: &ShieldFrame) -> Vec<u8> {
    build_serial_data(&frame.to_bytes()).concat()
}

/// Messages sent right after the transport comes up, in order
pub fn handshake_messages() -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut messages = Vec::with_capacity(PORT_COUNT + TOTAL_PINS as usize + 6);
    for port in 0..PORT_COUNT as u8 {
        messages.push(report_digital_message(port, true));
    }
    for pin in 0..TOTAL_PINS {
        messages.push(pin_mode_message(pin, PinMode::Input.byte()));
    }
    messages.push(build_sysex(SysexCommand::ReportInputPins, &[])?);
    messages.push(build_sysex(SysexCommand::IsAlive, &[])?);
    messages.push(vec![Command::ReportVersion.byte()]);
    messages.push(build_sysex(SysexCommand::MuteFirmata, &[0])?);
    messages.push(frame_message(&ShieldFrame::new(
        config_shield::SHIELD_ID,
        config_shield::HOST_CONNECTED,
    )));
    messages.push(frame_message(&ShieldFrame::new(
        config_shield::SHIELD_ID,
        config_shield::QUERY_LIBRARY_VERSION,
    )));
    Ok(messages)
}

/// Cut a name to what the board's Bluetooth module accepts, on a char boundary
pub fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_BOARD_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

enum Outgoing {
    Bytes(Vec<u8>),
    Barrier(oneshot::Sender<()>),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Reset,
}

struct TestingState {
    expected: [u8; CHALLENGE_LEN],
    firmware_answered: bool,
    library_answered: bool,
    _timer: TimeoutTimer,
}

struct RenamingState {
    name: String,
    attempt: u32,
    _timer: TimeoutTimer,
}

struct Session {
    id: u64,
    state: DeviceState,
    transport: Transport,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    gate: OutboundGate,
    gate_wake: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
    callback_watchdog: Option<TimeoutTimer>,
    testing: Option<TestingState>,
    renaming: Option<RenamingState>,
}

impl Session {
    fn push(&self, item: Outgoing) {
        if self.outgoing.send(item).is_err() {
            tracing::trace!("writer stopped, dropping outbound message");
        }
    }

    fn send(&self, bytes: Vec<u8>) {
        self.push(Outgoing::Bytes(bytes));
    }

    fn send_frame(&self, frame: &ShieldFrame) {
        self.send(frame_message(frame));
    }

    fn send_sysex(&self, command: SysexCommand, data: &[u8]) {
        match build_sysex(command, data) {
            Ok(message) => self.send(message),
            Err(e) => tracing::warn!("dropping {:?} sysex: {}", command, e),
        }
    }

    fn barrier(&self) -> oneshot::Receiver<()> {
        let (done, wait) = oneshot::channel();
        self.push(Outgoing::Barrier(done));
        wait
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.transport.mark_closed();
        let transport = self.transport.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { transport.close().await });
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Versions {
    firmware: Option<(u8, u8)>,
    library: Option<u8>,
}

struct DeviceInner {
    info: RwLock<BoardInfo>,
    config: DeviceConfig,
    events: broadcast::Sender<DeviceEvent>,
    session: Mutex<Option<Session>>,
    pins: Mutex<PinState>,
    versions: Mutex<Versions>,
    next_session: AtomicU64,
}

/// Handle to one board. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

impl Device {
    /// Create a disconnected device
    pub fn new(info: BoardInfo, config: DeviceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(DeviceInner {
                info: RwLock::new(info),
                config,
                events,
                session: Mutex::new(None),
                pins: Mutex::new(PinState::default()),
                versions: Mutex::new(Versions::default()),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of the board identity
    pub fn info(&self) -> BoardInfo {
        self.inner.info()
    }

    /// Stable transport address
    pub fn address(&self) -> String {
        self.inner.address()
    }

    /// Display name, falling back to the address
    pub fn name(&self) -> String {
        self.inner.info().display_name().to_string()
    }

    /// Current session state
    pub fn state(&self) -> DeviceState {
        lock(&self.inner.session)
            .as_ref()
            .map_or(DeviceState::Disconnected, |s| s.state)
    }

    /// Whether the handshake completed and the session is alive
    pub fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    /// Receive this device's events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Last reported firmware version
    pub fn firmware_version(&self) -> Option<(u8, u8)> {
        lock(&self.inner.versions).firmware
    }

    /// Last reported library version
    pub fn library_version(&self) -> Option<u8> {
        lock(&self.inner.versions).library
    }

    /// Record a discovery sighting
    pub(crate) fn update_discovery(&self, name: Option<String>, paired: bool, at: DateTime<Utc>) {
        let mut info = self.inner.info.write().unwrap_or_else(|e| e.into_inner());
        if name.is_some() {
            info.name = name;
        }
        info.paired = paired;
        info.discovered_at = Some(at);
    }

    /// Start a session over an established transport and run the handshake.
    ///
    /// Any previous session is torn down first. Resolves once every handshake
    /// message has been handed to the transport.
    pub async fn attach(&self, transport: Transport) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let messages = handshake_messages()?;
        if let Some(previous) = inner.session_id() {
            inner.teardown(previous, DisconnectReason::Requested);
        }

        let id = inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&inner.pins) = PinState::default();

        {
            let mut session = lock(&inner.session);
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let wake = Arc::new(Notify::new());
            let weak = Arc::downgrade(inner);

            let tasks = vec![
                tokio::spawn(read_loop(weak.clone(), id, transport.clone(), inbound_tx)),
                tokio::spawn(decode_loop(
                    weak.clone(),
                    id,
                    inbound_rx,
                    inner.config.frame_deadline(),
                )),
                tokio::spawn(write_loop(weak.clone(), id, transport.clone(), outgoing_rx)),
                tokio::spawn(drain_loop(weak, id, wake.clone())),
            ];

            *session = Some(Session {
                id,
                state: DeviceState::Handshaking,
                transport,
                outgoing: outgoing_tx,
                gate: OutboundGate::new(inner.config.quiet_interval()),
                gate_wake: wake,
                tasks,
                callback_watchdog: None,
                testing: None,
                renaming: None,
            });
        }

        tracing::debug!("handshaking with {} (session {})", inner.address(), id);
        let barrier = inner
            .with_session(id, |session| {
                for message in messages {
                    session.send(message);
                }
                session.barrier()
            })
            .ok_or_else(|| ProtocolError::ConnectionFailed("session ended before handshake".into()))?;

        barrier
            .await
            .map_err(|_| ProtocolError::ConnectionFailed("session ended during handshake".into()))?;

        inner
            .with_session(id, |session| session.state = DeviceState::Connected)
            .ok_or_else(|| ProtocolError::ConnectionFailed("session ended during handshake".into()))?;

        tracing::info!("connected to {}", inner.address());
        inner.emit(DeviceEvent::Connected);
        Ok(())
    }

    /// End the session, discarding queued frames and unflushed writes. No-op when disconnected.
    pub fn disconnect(&self) {
        if let Some(id) = self.inner.session_id() {
            self.inner.teardown(id, DisconnectReason::Requested);
        }
    }

    /// Set a pin's mode
    pub fn pin_mode(&self, pin: u8, mode: PinMode) -> Result<(), ProtocolError> {
        validate_pin(pin)?;
        self.inner
            .with_connected(|session| session.send(pin_mode_message(pin, mode.byte())));
        Ok(())
    }

    /// Drive an output pin. The whole port value is re-sent with one bit changed.
    pub fn digital_write(&self, pin: u8, high: bool) -> Result<(), ProtocolError> {
        validate_pin(pin)?;
        self.inner.with_connected(|session| {
            let (port, value) = lock(&self.inner.pins).set_output(pin, high);
            session.send(digital_port_message(port, value));
        });
        Ok(())
    }

    /// Last reported level of an input pin
    pub fn digital_read(&self, pin: u8) -> Result<bool, ProtocolError> {
        validate_pin(pin)?;
        Ok(lock(&self.inner.pins).input(pin))
    }

    /// Write a PWM duty cycle
    pub fn analog_write(&self, pin: u8, value: u8) -> Result<(), ProtocolError> {
        validate_analog_pin(pin)?;
        self.inner
            .with_connected(|session| session.send(analog_message(pin, value)));
        Ok(())
    }

    /// Send a frame to a shield, holding it back while the board is in its callback
    pub fn send_frame(&self, frame: ShieldFrame) {
        self.inner.with_connected(|session| match session.gate.submit(frame) {
            Some(frame) => session.send_frame(&frame),
            None => session.gate_wake.notify_one(),
        });
    }

    /// Send raw bytes through the serial passthrough
    pub fn send_serial_data(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.inner
            .with_connected(|session| session.send(build_serial_data(data).concat()));
    }

    /// Ask for the firmware version; the answer arrives as [`DeviceEvent::FirmwareVersion`]
    pub fn query_firmware_version(&self) {
        self.inner
            .with_connected(|session| session.send(vec![Command::ReportVersion.byte()]));
    }

    /// Ask for the library version; the answer arrives as [`DeviceEvent::LibraryVersion`]
    pub fn query_library_version(&self) {
        self.inner.with_connected(|session| {
            session.send_frame(&ShieldFrame::new(
                config_shield::SHIELD_ID,
                config_shield::QUERY_LIBRARY_VERSION,
            ))
        });
    }

    /// Challenge both firmware and library with a random value.
    ///
    /// Each answer fires its own result event; if either is missing when the
    /// testing timeout passes, [`DeviceEvent::TestingTimedOut`] fires.
    pub fn test_board(&self) {
        let challenge: [u8; CHALLENGE_LEN] = rand::thread_rng().gen();
        let expected = challenge.map(|b| 255 - b);
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.testing_timeout();

        self.inner.with_connected(|session| {
            let id = session.id;
            let timer = TimeoutTimer::start(timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_testing_timeout(id);
                }
            });
            session.testing = Some(TestingState {
                expected,
                firmware_answered: false,
                library_answered: false,
                _timer: timer,
            });

            session.send_sysex(SysexCommand::BoardTesting, &challenge);
            let mut frame = ShieldFrame::new(
                config_shield::SHIELD_ID,
                config_shield::LIBRARY_TESTING_CHALLENGE,
            );
            frame
                .add_str(config_shield::TESTING_REQUEST)
                .add_bytes(&challenge);
            session.send_frame(&frame);
        });
    }

    /// Rename the board. Unacknowledged requests are retransmitted until the
    /// retry budget runs out, then [`DeviceEvent::RenamingTimedOut`] fires.
    pub fn rename(&self, name: &str) {
        let name = truncate_name(name);
        self.inner.with_connected(|session| {
            session.send_sysex(SysexCommand::BoardRenaming, name.as_bytes());
            let timer = self.inner.rename_timer(session.id);
            session.renaming = Some(RenamingState {
                name,
                attempt: 1,
                _timer: timer,
            });
        });
    }
}

impl DeviceInner {
    fn info(&self) -> BoardInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn address(&self) -> String {
        self.info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .address()
            .to_string()
    }

    fn emit(&self, event: DeviceEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn session_id(&self) -> Option<u64> {
        lock(&self.session).as_ref().map(|s| s.id)
    }

    /// Run `f` against session `id` if it is still the current one
    fn with_session<R>(&self, id: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut guard = lock(&self.session);
        guard.as_mut().filter(|s| s.id == id).map(f)
    }

    /// Run `f` against a connected session, or report that there is none
    fn with_connected<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let result = {
            let mut guard = lock(&self.session);
            guard
                .as_mut()
                .filter(|s| s.state == DeviceState::Connected)
                .map(f)
        };
        if result.is_none() {
            self.emit(DeviceEvent::Error(OperationError::NotConnected(
                self.address(),
            )));
        }
        result
    }

    /// End session `id`. Later calls for the same session do nothing.
    fn teardown(&self, id: u64, reason: DisconnectReason) {
        let session = {
            let mut guard = lock(&self.session);
            match guard.as_ref() {
                Some(s) if s.id == id => guard.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };

        let dropped = session.gate.queued();
        drop(session);
        if dropped > 0 {
            tracing::debug!("discarded {} queued frames", dropped);
        }
        tracing::info!("{} disconnected: {:?}", self.address(), reason);
        self.emit(DeviceEvent::Disconnected { reason });
    }

    fn dispatch(self: &Arc<Self>, id: u64, event: DecodedEvent) -> Flow {
        match event {
            DecodedEvent::DigitalReport { port, value } => {
                let changed = lock(&self.pins).apply_report(port, value);
                for (pin, value) in changed {
                    self.emit(DeviceEvent::DigitalPinChanged { pin, value });
                }
                self.emit(DeviceEvent::DigitalPortReport { port, value });
            }
            DecodedEvent::FirmwareVersion { major, minor } => {
                lock(&self.versions).firmware = Some((major, minor));
                self.emit(DeviceEvent::FirmwareVersion { major, minor });
            }
            DecodedEvent::SerialData(data) => self.emit(DeviceEvent::SerialData(data)),
            DecodedEvent::Frame(inbound) => self.on_frame(id, inbound),
            DecodedEvent::Sysex { command, data } => match SysexCommand::from_byte(command) {
                Some(SysexCommand::BluetoothReset) => return Flow::Reset,
                Some(SysexCommand::IsAlive) => {
                    self.with_session(id, |s| s.send_sysex(SysexCommand::IsAlive, &[]));
                }
                Some(SysexCommand::BoardTesting) => self.on_firmware_answer(id, &data),
                Some(SysexCommand::BoardRenaming) => self.on_rename_ack(id),
                _ => self.emit(DeviceEvent::UnknownSysex { command, data }),
            },
        }
        Flow::Continue
    }

    fn on_frame(self: &Arc<Self>, id: u64, inbound: InboundFrame) {
        let InboundFrame {
            library_version,
            frame,
        } = inbound;
        if frame.shield_id != config_shield::SHIELD_ID {
            self.emit(DeviceEvent::Frame(frame));
            return;
        }

        match frame.function_id {
            config_shield::LIBRARY_VERSION => {
                let version = frame
                    .argument(0)
                    .and_then(|arg| arg.first().copied())
                    .unwrap_or(library_version);
                lock(&self.versions).library = Some(version);
                self.emit(DeviceEvent::LibraryVersion(version));
            }
            config_shield::CALLBACK_ENTERED => self.on_callback_entered(id),
            config_shield::CALLBACK_EXITED => self.on_callback_exited(id),
            config_shield::LIBRARY_TESTING_ANSWER => self.on_library_answer(id, &frame),
            other => tracing::debug!("unhandled configuration function {:#04x}", other),
        }
    }

    fn on_callback_entered(self: &Arc<Self>, id: u64) {
        let weak = Arc::downgrade(self);
        let watchdog = self.config.callback_watchdog();
        self.with_session(id, |s| {
            s.gate.enter_callback();
            if let Some(timer) = s.callback_watchdog.as_ref().filter(|t| t.is_alive()) {
                timer.reset();
            } else {
                s.callback_watchdog = Some(TimeoutTimer::start(watchdog, move || {
                    if let Some(inner) = weak.upgrade() {
                        tracing::debug!("no callback exit within {:?}, assuming one", watchdog);
                        inner.on_callback_exited(id);
                    }
                }));
            }
        });
    }

    fn on_callback_exited(&self, id: u64) {
        self.with_session(id, |s| {
            s.callback_watchdog = None;
            s.gate.exit_callback(Instant::now());
            s.gate_wake.notify_one();
        });
    }

    fn on_testing_timeout(&self, id: u64) {
        let event = self
            .with_session(id, |s| {
                s.testing.take().map(|t| DeviceEvent::TestingTimedOut {
                    firmware_answered: t.firmware_answered,
                    library_answered: t.library_answered,
                })
            })
            .flatten();
        if let Some(event) = event {
            tracing::warn!("board testing timed out on {}", self.address());
            self.emit(event);
        }
    }

    fn on_firmware_answer(&self, id: u64, answer: &[u8]) {
        let passed = self
            .with_session(id, |s| {
                let testing = s.testing.as_mut().filter(|t| !t.firmware_answered)?;
                testing.firmware_answered = true;
                let passed = answer == testing.expected;
                if testing.library_answered {
                    s.testing = None;
                }
                Some(passed)
            })
            .flatten();
        if let Some(passed) = passed {
            self.emit(DeviceEvent::FirmwareTestResult { passed });
        }
    }

    fn on_library_answer(&self, id: u64, frame: &ShieldFrame) {
        let passed = self
            .with_session(id, |s| {
                let testing = s.testing.as_mut().filter(|t| !t.library_answered)?;
                testing.library_answered = true;
                let passed = frame.argument_as_string(0).as_deref()
                    == Some(config_shield::TESTING_ANSWER)
                    && frame.argument(1) == Some(&testing.expected[..]);
                if testing.firmware_answered {
                    s.testing = None;
                }
                Some(passed)
            })
            .flatten();
        if let Some(passed) = passed {
            self.emit(DeviceEvent::LibraryTestResult { passed });
        }
    }

    fn rename_timer(self: &Arc<Self>, id: u64) -> TimeoutTimer {
        let weak = Arc::downgrade(self);
        TimeoutTimer::start(self.config.rename_timeout(), move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_rename_timeout(id);
            }
        })
    }

    fn on_rename_timeout(self: &Arc<Self>, id: u64) {
        let tries = self.config.rename_tries;
        let event = self
            .with_session(id, |s| {
                let renaming = s.renaming.as_mut()?;
                if renaming.attempt >= tries {
                    s.renaming = None;
                    return Some(DeviceEvent::RenamingTimedOut);
                }
                renaming.attempt += 1;
                renaming._timer = self.rename_timer(id);
                let attempt = renaming.attempt;
                let name = renaming.name.clone();
                s.send_sysex(SysexCommand::BoardRenaming, name.as_bytes());
                Some(DeviceEvent::RenamingRetry { attempt })
            })
            .flatten();

        match event {
            Some(DeviceEvent::RenamingTimedOut) => {
                tracing::warn!("renaming {} timed out after {} tries", self.address(), tries);
                self.emit(DeviceEvent::RenamingTimedOut);
            }
            Some(event) => self.emit(event),
            None => {}
        }
    }

    fn on_rename_ack(&self, id: u64) {
        let name = self
            .with_session(id, |s| s.renaming.take().map(|r| r.name))
            .flatten();
        let Some(name) = name else {
            tracing::debug!("renaming acknowledgment with no request pending");
            return;
        };
        self.info.write().unwrap_or_else(|e| e.into_inner()).name = Some(name.clone());
        self.emit(DeviceEvent::Renamed(name));
    }

    /// Answer a reset request, wait for the answer to reach the transport, then drop the session
    async fn on_reset_request(&self, id: u64) {
        let nonce: u8 = rand::thread_rng().gen();
        let written = self.with_session(id, |s| {
            s.send_sysex(SysexCommand::BluetoothReset, &[nonce, 255 - nonce]);
            s.barrier()
        });
        if let Some(written) = written {
            let _ = written.await;
        }
        self.teardown(id, DisconnectReason::BoardReset);
    }
}

async fn read_loop(
    device: Weak<DeviceInner>,
    id: u64,
    transport: Transport,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        match transport.read().await {
            Ok(bytes) if bytes.is_empty() => tokio::time::sleep(EMPTY_READ_BACKOFF).await,
            Ok(bytes) => {
                tracing::trace!("received {} bytes", bytes.len());
                if inbound.send(bytes).is_err() {
                    return;
                }
            }
            Err(e) => {
                if let Some(inner) = device.upgrade() {
                    tracing::warn!("read from {} failed: {}", inner.address(), e);
                    inner.teardown(id, DisconnectReason::TransportFailure(e.to_string()));
                }
                return;
            }
        }
    }
}

async fn decode_loop(
    device: Weak<DeviceInner>,
    id: u64,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    frame_deadline: Duration,
) {
    let mut decoder = StreamDecoder::new(frame_deadline);
    loop {
        let received = match decoder.frame_deadline() {
            Some(deadline) => match timeout_at(deadline, inbound.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!("partial frame expired after {:?}", frame_deadline);
                    decoder.expire_partial_frame();
                    continue;
                }
            },
            None => inbound.recv().await,
        };
        let Some(bytes) = received else {
            return;
        };
        let Some(inner) = device.upgrade() else {
            return;
        };

        for event in decoder.feed(&bytes, Instant::now()) {
            if inner.dispatch(id, event) == Flow::Reset {
                tracing::info!("{} requested a transport reset", inner.address());
                inner.on_reset_request(id).await;
                return;
            }
        }
    }
}

async fn write_loop(
    device: Weak<DeviceInner>,
    id: u64,
    transport: Transport,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Bytes(bytes) => {
                if let Err(e) = transport.write(&bytes).await {
                    if let Some(inner) = device.upgrade() {
                        tracing::warn!("write to {} failed: {}", inner.address(), e);
                        inner.teardown(id, DisconnectReason::TransportFailure(e.to_string()));
                    }
                    return;
                }
            }
            Outgoing::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn drain_loop(device: Weak<DeviceInner>, id: u64, wake: Arc<Notify>) {
    loop {
        let next = {
            let Some(inner) = device.upgrade() else {
                return;
            };
            let polled = inner.with_session(id, |s| {
                let release = s.gate.poll_release(Instant::now());
                if let GateRelease::Send(frame) = &release {
                    s.send_frame(frame);
                }
                release
            });
            match polled {
                Some(release) => release,
                None => return,
            }
        };

        match next {
            GateRelease::Send(frame) => {
                tracing::debug!(
                    "released queued frame for shield {:#04x} function {:#04x}",
                    frame.shield_id,
                    frame.function_id
                );
            }
            GateRelease::WaitUntil(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = wake.notified() => {}
                }
            }
            GateRelease::Blocked | GateRelease::Idle => wake.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_order() {
        let messages = handshake_messages().unwrap();
        assert_eq!(messages.len(), 3 + 20 + 6);
        assert_eq!(messages[0], vec![0xD0, 1]);
        assert_eq!(messages[2], vec![0xD2, 1]);
        assert_eq!(messages[3], vec![0xF4, 0, 0]);
        assert_eq!(messages[22], vec![0xF4, 19, 0]);
        assert_eq!(messages[23], vec![0xF0, 0x5F, 0xF7]);
        assert_eq!(messages[24], vec![0xF0, 0x62, 0xF7]);
        assert_eq!(messages[25], vec![0xF9]);
        assert_eq!(messages[26], vec![0xF0, 0x64, 0x00, 0x00, 0xF7]);
    }

    #[test]
    fn test_config_frames_wrapped_in_serial_data() {
        let messages = handshake_messages().unwrap();
        let host_connected = &messages[27];
        assert_eq!(host_connected[0], 0xF0);
        assert_eq!(host_connected[1], 0x66);
        assert_eq!(*host_connected.last().unwrap(), 0xF7);
        // FF 00 00 02 00 FF 00 as 7-bit pairs
        assert_eq!(
            &host_connected[2..host_connected.len() - 1],
            &[0x7F, 0x01, 0, 0, 0, 0, 0x02, 0, 0, 0, 0x7F, 0x01, 0, 0]
        );
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("1Sheeld"), "1Sheeld");
        assert_eq!(truncate_name("A very long board name"), "A very long bo");
        // Multi-byte char straddling the limit is dropped whole
        assert_eq!(truncate_name("ABCDEFGHIJKLMé"), "ABCDEFGHIJKLM");
    }

    #[tokio::test]
    async fn test_operations_refused_when_disconnected() {
        let device = Device::new(
            BoardInfo::new("AA:BB", crate::transport::TransportKind::Stream),
            DeviceConfig::default(),
        );
        let mut events = device.subscribe();

        device.digital_write(3, true).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent::Error(OperationError::NotConnected("AA:BB".into()))
        );
        assert!(matches!(
            device.pin_mode(25, PinMode::Output),
            Err(ProtocolError::PinOutOfRange { pin: 25, .. })
        ));
        assert_eq!(device.state(), DeviceState::Disconnected);
        device.disconnect();
        device.disconnect();
    }
}
