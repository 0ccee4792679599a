//! # Session Engine
//!
//! A [`Session`] wraps one TCP connection for its whole life: it queues
//! outbound packets, pumps inbound ones, keeps the link alive with pings and
//! tears it down when the peer goes quiet.
//!
//! ## Workers
//! Every physical connection gets two long-lived tasks:
//! - the **send worker** owns the write half, sleeps on a wake signal and runs
//!   one send pass per queued packet;
//! - the **receive worker** owns the read half and runs receive passes back to
//!   back until the connection goes away.
//!
//! Both passes are single-flight (guarded by a non-blocking flag) and both
//! re-check the running, stopping and connected flags at entry. A
//! [`Scheduler`] ticks [`Session::process`] for keepalive and client redials.
//!
//! ## Connect and disconnect
//! The connected flag only changes through one transition function. Whoever
//! flips it gets the transition event and dispatches the callbacks after the
//! lock is released, so each edge fires exactly once no matter how many tasks
//! race to disconnect.
//!
//! ## Example
//! ```rust,no_run
//! use socket_factory::session::{Session, SessionHandler};
//! use socket_factory::core::packet::Packet;
//! use socket_factory::config::ClientConfig;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl SessionHandler for Printer {
//!     fn on_read(&self, _session: &Session, packet: Packet) {
//!         println!("{packet:?}");
//!     }
//! }
//!
//! # async fn run() {
//! let session = Session::client(&ClientConfig::default(), Arc::new(Printer));
//! session.start();
//! session.enqueue_packet(Packet::text("hello"));
//! # }
//! ```

pub mod mode;
pub mod scheduler;

pub use mode::Mode;
pub use scheduler::Scheduler;

use crate::config::{SessionConfig, MAX_PAYLOAD_SIZE, MIN_TICK_INTERVAL};
use crate::core::codec::{decode_packet, encode_packet, read_frame, write_frame};
use crate::core::packet::{InternalPacket, Packet, StreamPacket};
use crate::crypto::Cipher;
use crate::error::{constants, Result, SessionError};
use crate::protocol::{Protocol, ProtocolFactory, ProtocolHost};
use crate::transfer::{receive_stream, send_stream};
use crate::utils::{lock, Metrics, MetricsSnapshot};
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// How long a protocol-driven receive pass waits for bytes before yielding
const PROTOCOL_READ_WINDOW: Duration = Duration::from_millis(100);

/// Scratch size for protocol-driven reads
const PROTOCOL_READ_CHUNK: usize = 8 * 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks a session makes into the application.
///
/// All methods default to no-ops. They run on the session's worker tasks and
/// must not block for long.
pub trait SessionHandler: Send + Sync + 'static {
    /// The session was started
    fn on_start(&self, _session: &Session) {}

    /// A physical connection came up
    fn on_connect(&self, _session: &Session) {}

    /// A physical connection went away; `message` describes how
    fn on_disconnect(&self, _session: &Session, _message: &str) {}

    /// Polled once per tick while connected
    fn while_connected(&self, _session: &Session) {}

    /// A non-internal packet arrived
    fn on_read(&self, _session: &Session, _packet: Packet) {}

    /// One chunk of an inbound stream transfer
    fn on_read_stream(&self, _session: &Session, _chunk: &[u8], _stream: &StreamPacket) {}

    /// An inbound stream transfer ended, successfully or not
    fn on_complete_stream_read(&self, _session: &Session, _stream: &StreamPacket) {}

    /// Every diagnostic the session logs is also routed here
    fn on_exception_log(&self, _source: &str, _message: &str) {}
}

/// Handler that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}

/// Called after the disconnect edge, before the handler sees it
pub type DisconnectDelegate = Arc<dyn Fn(&Session) + Send + Sync>;

/// Event produced by flipping the connected flag
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Connected,
    Disconnected { message: String },
}

/// The live socket behind a connected session
struct Link {
    /// Duplicate handle used only to shut the socket down from any task
    control: std::net::TcpStream,
    peer: Option<SocketAddr>,
}

struct ConnectionState {
    connected: bool,
    link: Option<Link>,
}

/// Result of one attempt to put the head packet on the wire
enum WriteOutcome {
    /// Written; pop it. Carries the byte count.
    Sent(usize),
    /// The protocol wants this packet offered again
    Retained,
    /// Could not be encoded or too large to frame; pop it without writing
    Dropped,
    /// Could not be encrypted; the session has been disconnected
    Abandoned,
}

enum ReceiveFlow {
    Continue,
    Exit,
}

struct Inner {
    id: u64,
    config: SessionConfig,
    mode: Mode,
    handler: Arc<dyn SessionHandler>,
    protocol: Option<Mutex<Box<dyn Protocol>>>,

    running: AtomicBool,
    stopping: AtomicBool,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,

    write_in_progress: AtomicBool,
    read_in_progress: AtomicBool,
    queue: Mutex<VecDeque<(u64, Packet)>>,
    next_seq: AtomicU64,
    send_wake: Notify,

    cipher: Mutex<Option<Cipher>>,
    last_received: Mutex<Instant>,
    last_ping_sent: Mutex<Option<Instant>>,

    scheduler: Mutex<Option<Scheduler>>,
    on_disconnect: Mutex<Option<DisconnectDelegate>>,
    metrics: Metrics,
}

/// Cloneable handle to one managed connection
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("client", &self.inner.mode.is_client())
            .field("running", &self.is_running())
            .field("connected", &self.is_connected())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Assembles a [`Session`] from a mode, a handler and options
pub struct SessionBuilder {
    mode: Mode,
    handler: Arc<dyn SessionHandler>,
    config: SessionConfig,
    protocol: Option<ProtocolFactory>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default framing with a protocol built by `factory`
    pub fn protocol(mut self, factory: ProtocolFactory) -> Self {
        self.protocol = Some(factory);
        self
    }

    pub fn build(self) -> Session {
        let protocol = self.protocol.map(|make| Mutex::new(make()));
        Session {
            inner: Arc::new(Inner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                config: self.config,
                mode: self.mode,
                handler: self.handler,
                protocol,
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                state: Mutex::new(ConnectionState {
                    connected: false,
                    link: None,
                }),
                generation: AtomicU64::new(0),
                write_in_progress: AtomicBool::new(false),
                read_in_progress: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                next_seq: AtomicU64::new(0),
                send_wake: Notify::new(),
                cipher: Mutex::new(None),
                last_received: Mutex::new(Instant::now()),
                last_ping_sent: Mutex::new(None),
                scheduler: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                metrics: Metrics::new(),
            }),
        }
    }
}

impl Session {
    pub fn builder(mode: Mode, handler: Arc<dyn SessionHandler>) -> SessionBuilder {
        SessionBuilder {
            mode,
            handler,
            config: SessionConfig::default(),
            protocol: None,
        }
    }

    /// Session for an accepted socket; an empty password disables encryption
    pub fn server(socket: TcpStream, password: &str, handler: Arc<dyn SessionHandler>) -> Self {
        Self::builder(Mode::server(socket, password), handler).build()
    }

    /// Session that dials `config`'s target and redials while running
    pub fn client(config: &crate::config::ClientConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self::builder(Mode::from_client_config(config), handler).build()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mode(&self) -> &Mode {
        &self.inner.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state).link.as_ref().and_then(|link| link.peer)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).connected
    }

    pub fn is_encrypted(&self) -> bool {
        lock(&self.inner.cipher).is_some()
    }

    pub fn has_protocol(&self) -> bool {
        self.inner.protocol.is_some()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Start the session.
    ///
    /// Returns `false` while a stop is in progress or when the start hook
    /// fails; returns `true` without doing anything when already running.
    pub fn start(&self) -> bool {
        if self.is_stopping() {
            return false;
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return true;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let scheduler = Scheduler::spawn(self.inner.config.tick_interval, move || {
            match weak.upgrade() {
                Some(inner) => {
                    let session = Session { inner };
                    if session.is_running() {
                        session.process();
                    }
                    true
                }
                None => false,
            }
        });
        *lock(&self.inner.scheduler) = Some(scheduler);

        if let Err(e) = self.inner.mode.on_start(self) {
            self.log_exception("Session", &format!("start failed: {e}"));
            if let Some(scheduler) = lock(&self.inner.scheduler).take() {
                scheduler.cancel();
            }
            self.inner.running.store(false, Ordering::Release);
            return false;
        }

        info!(session_id = self.id(), client = self.inner.mode.is_client(), "Session started");
        self.inner.handler.on_start(self);
        true
    }

    /// Start with a delegate that runs on every disconnect edge
    pub fn start_with(&self, on_disconnect: DisconnectDelegate) -> bool {
        *lock(&self.inner.on_disconnect) = Some(on_disconnect);
        self.start()
    }

    /// Ask the peer to shut down, wait for that to flush, then tear down
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        self.stop_with(true, true)
    }

    /// Stop the session.
    ///
    /// Ignored while a stop is already underway. The returned task finishes
    /// once teardown is complete.
    pub fn stop_with(&self, send_shutdown_request: bool, close_with_delay: bool) -> Option<JoinHandle<()>> {
        if self
            .inner
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        if send_shutdown_request && self.is_connected() {
            self.push(Packet::shutdown_request());
        }

        debug!(session_id = self.id(), send_shutdown_request, close_with_delay, "Stopping session");
        let session = self.clone();
        Some(tokio::spawn(async move {
            if close_with_delay {
                session.wait_for_drain().await;
            }
            session.teardown();
        }))
    }

    async fn wait_for_drain(&self) {
        let deadline = Instant::now() + self.inner.config.stop_grace_period;
        while Instant::now() < deadline && self.is_connected() && self.queue_len() > 0 {
            sleep(MIN_TICK_INTERVAL).await;
        }
    }

    fn teardown(&self) {
        if let Some(scheduler) = lock(&self.inner.scheduler).take() {
            scheduler.cancel();
        }
        self.force_disconnect();
        self.inner.mode.on_stop(self);
        self.release_queue();

        self.inner.stopping.store(false, Ordering::Release);
        self.inner.running.store(false, Ordering::Release);
        info!(session_id = self.id(), "Session stopped");
    }

    /// Queue a packet for sending.
    ///
    /// Returns `false` (and drops the packet) unless the session is running,
    /// connected and not stopping. A shutdown request first purges the queue.
    pub fn enqueue_packet<P: Into<Packet>>(&self, packet: P) -> bool {
        let packet = packet.into();
        if !self.is_running() || self.is_stopping() || !self.is_connected() {
            if let Some(stream) = packet.as_stream() {
                stream.release_source();
            }
            return false;
        }
        self.push(packet);
        true
    }

    fn push(&self, packet: Packet) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = lock(&self.inner.queue);
            if packet.is_shutdown_request() {
                for (_, purged) in queue.drain(..) {
                    if let Some(stream) = purged.as_stream() {
                        stream.release_source();
                    }
                }
            }
            queue.push_back((seq, packet));
        }
        self.inner.send_wake.notify_one();
    }

    fn peek(&self) -> Option<(u64, Packet)> {
        lock(&self.inner.queue).front().cloned()
    }

    /// Pop the head only if it is still the packet that was peeked
    fn pop(&self, seq: u64) {
        let mut queue = lock(&self.inner.queue);
        if queue.front().is_some_and(|(head, _)| *head == seq) {
            queue.pop_front();
        }
    }

    fn release_queue(&self) {
        for (_, packet) in lock(&self.inner.queue).drain(..) {
            if let Some(stream) = packet.as_stream() {
                stream.release_source();
            }
        }
    }

    /// One scheduler tick: mode hook, keepalive, then the handler's poll
    pub fn process(&self) {
        self.inner.mode.on_tick(self);

        if !self.is_connected() || self.is_stopping() {
            return;
        }

        let silent_for = lock(&self.inner.last_received).elapsed();
        if silent_for > self.inner.config.keepalive_timeout {
            self.log_exception(
                "Session",
                &format!("{} after {}ms", constants::ERR_PING_TIMEOUT, silent_for.as_millis()),
            );
            self.inner.metrics.fault();
            self.force_disconnect();
            return;
        }

        let ping_due = {
            let mut last_ping = lock(&self.inner.last_ping_sent);
            let due = last_ping.map_or(true, |at| at.elapsed() >= self.inner.config.ping_interval);
            if due {
                *last_ping = Some(Instant::now());
            }
            due
        };
        if ping_due && self.enqueue_packet(Packet::ping()) {
            trace!(session_id = self.id(), "Ping queued");
            self.inner.metrics.ping_sent();
        }

        self.inner.handler.while_connected(self);
    }

    /// Log through tracing and the handler's diagnostic callback
    pub fn log_exception(&self, source: &str, message: &str) {
        warn!(session_id = self.id(), source, "{message}");
        self.inner.handler.on_exception_log(source, message);
    }

    /// Bring up a new physical connection on `socket`.
    ///
    /// Derives the cipher from `password` (blank means plaintext), resets the
    /// queue and keepalive clocks, fires the connect callbacks and spawns the
    /// send and receive workers.
    #[instrument(skip(self, password, socket), fields(session_id = self.id()))]
    pub(crate) fn set_connected(&self, password: &str, socket: TcpStream) -> Result<()> {
        if !self.is_running() || self.is_stopping() {
            return Err(SessionError::NotConnected);
        }
        if self.is_connected() {
            self.force_disconnect();
        }

        let peer = socket.peer_addr().ok();
        let std_socket = socket.into_std()?;
        let control = std_socket.try_clone()?;
        let socket = TcpStream::from_std(std_socket)?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();

        *lock(&self.inner.cipher) = Cipher::from_password(password);
        self.release_queue();
        *lock(&self.inner.last_received) = Instant::now();
        *lock(&self.inner.last_ping_sent) = None;

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let transition = {
            let mut state = lock(&self.inner.state);
            state.link = Some(Link { control, peer });
            self.flip(&mut state, true)
        };

        tokio::spawn(self.clone().send_worker(generation, write_half));
        tokio::spawn(self.clone().receive_worker(generation, BufReader::new(read_half)));

        info!(
            session_id = self.id(),
            peer = ?peer,
            encrypted = self.is_encrypted(),
            "Session connected"
        );
        if let Some(transition) = transition {
            self.dispatch(transition);
        }
        Ok(())
    }

    /// Drop the connection now; callbacks fire only if it was up
    pub fn force_disconnect(&self) {
        let transition = {
            let mut state = lock(&self.inner.state);
            self.flip(&mut state, false)
        };
        if let Some(transition) = transition {
            self.dispatch(transition);
        }
    }

    /// Set the connected flag; must be called with the state lock held
    fn flip(&self, state: &mut ConnectionState, connected: bool) -> Option<Transition> {
        if state.connected == connected {
            return None;
        }
        state.connected = connected;
        if connected {
            return Some(Transition::Connected);
        }

        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let message = match state.link.take() {
            Some(link) => match link.control.shutdown(Shutdown::Both) {
                Ok(()) => constants::MSG_DISCONNECTED.to_string(),
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                    "Connection closed by peer.".to_string()
                }
                Err(e) => format!("Disconnect failed: {e}"),
            },
            None => constants::ERR_CONNECTION_CLOSED.to_string(),
        };
        Some(Transition::Disconnected { message })
    }

    fn dispatch(&self, transition: Transition) {
        match transition {
            Transition::Connected => {
                self.inner.metrics.connection_established();
                self.inner.handler.on_connect(self);
                if let Some(protocol) = &self.inner.protocol {
                    lock(protocol).on_connect(self);
                }
            }
            Transition::Disconnected { message } => {
                self.inner.metrics.connection_closed();
                self.inner.send_wake.notify_one();
                info!(session_id = self.id(), %message, "Session disconnected");

                let delegate = lock(&self.inner.on_disconnect).clone();
                if let Some(delegate) = delegate {
                    delegate(self);
                }
                self.inner.handler.on_disconnect(self, &message);
                if let Some(protocol) = &self.inner.protocol {
                    lock(protocol).on_disconnect(self);
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::Acquire) == generation
    }

    fn cipher(&self) -> Option<Cipher> {
        lock(&self.inner.cipher).clone()
    }

    async fn send_worker<W>(self, generation: u64, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        while self.is_current(generation) {
            if self.queue_len() == 0 {
                let _ = timeout(self.inner.config.tick_interval, self.inner.send_wake.notified()).await;
                continue;
            }
            if !self.send_pass(&mut writer).await {
                sleep(self.inner.config.retry_backoff).await;
            }
        }
        trace!(session_id = self.id(), generation, "Send worker exiting");
    }

    /// Try to write the head of the queue; `false` if another pass held the guard
    async fn send_pass<W>(&self, writer: &mut W) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        if self
            .inner
            .write_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some((seq, packet)) = self.peek() {
            let stream = packet.as_stream().cloned();
            let mut keep_source = false;

            match self.write_packet(writer, &packet).await {
                Ok(WriteOutcome::Sent(bytes)) => {
                    self.pop(seq);
                    self.inner.metrics.packet_sent(bytes as u64);
                    if let (Some(stream), false) = (&stream, self.has_protocol()) {
                        self.send_stream_body(writer, stream).await;
                    }
                }
                Ok(WriteOutcome::Retained) => {
                    keep_source = true;
                    sleep(self.inner.config.retry_backoff).await;
                }
                Ok(WriteOutcome::Dropped) => self.pop(seq),
                Ok(WriteOutcome::Abandoned) => {}
                Err(e) => {
                    if !self.is_stopping() {
                        self.log_exception("Send", &format!("{} packet failed: {e}", packet.kind_name()));
                    }
                    self.inner.metrics.fault();
                    self.force_disconnect();
                    self.pop(seq);
                }
            }

            if let (Some(stream), false) = (&stream, keep_source) {
                stream.release_source();
            }
        }

        self.inner.write_in_progress.store(false, Ordering::Release);
        true
    }

    async fn write_packet<W>(&self, writer: &mut W, packet: &Packet) -> Result<WriteOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(protocol) = &self.inner.protocol {
            let outcome = lock(protocol).on_send_packet(self, packet)?;
            let mut written = 0;
            if let Some(bytes) = outcome.write {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
                written = bytes.len();
            }
            return Ok(if outcome.remove_packet {
                WriteOutcome::Sent(written)
            } else {
                WriteOutcome::Retained
            });
        }

        let cipher = self.cipher();
        let frame = match encode_packet(packet, cipher.as_ref()) {
            Ok(frame) => frame,
            Err(e) if cipher.is_some() => {
                self.log_exception("Send", &format!("{}: {e}", constants::ERR_ENCRYPTION_FAILED));
                self.inner.metrics.fault();
                self.force_disconnect();
                return Ok(WriteOutcome::Abandoned);
            }
            Err(e) => {
                self.log_exception("Send", &format!("dropping {} packet: {e}", packet.kind_name()));
                return Ok(WriteOutcome::Dropped);
            }
        };

        // Dropped before any byte reaches the socket
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            let e = SessionError::OversizedPacket(frame.payload.len());
            self.log_exception("Send", &format!("dropping {} packet: {e}", packet.kind_name()));
            self.inner.metrics.fault();
            return Ok(WriteOutcome::Dropped);
        }

        let bytes = write_frame(writer, frame).await?;
        Ok(WriteOutcome::Sent(bytes))
    }

    async fn send_stream_body<W>(&self, writer: &mut W, stream: &StreamPacket)
    where
        W: AsyncWrite + Unpin,
    {
        let cipher = self.cipher();
        match send_stream(writer, stream, cipher.as_ref()).await {
            Ok(sent) => {
                debug!(session_id = self.id(), sent, "Stream sent");
                self.inner.metrics.stream_sent(sent);
            }
            Err(e) => {
                if !self.is_stopping() {
                    self.log_exception("Stream", &format!("stream send failed: {e}"));
                }
                self.inner.metrics.fault();
                self.force_disconnect();
            }
        }
    }

    async fn receive_worker<R>(self, generation: u64, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        while self.is_current(generation) {
            match self.receive_pass(&mut reader).await {
                ReceiveFlow::Continue => {}
                ReceiveFlow::Exit => break,
            }
        }
        trace!(session_id = self.id(), generation, "Receive worker exiting");
    }

    async fn receive_pass<R>(&self, reader: &mut R) -> ReceiveFlow
    where
        R: AsyncRead + Unpin,
    {
        if !self.is_running() || !self.is_connected() || self.is_stopping() {
            return ReceiveFlow::Exit;
        }
        if self
            .inner
            .read_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            sleep(self.inner.config.retry_backoff).await;
            return ReceiveFlow::Continue;
        }

        let result = self.read_packet(reader).await;
        self.inner.read_in_progress.store(false, Ordering::Release);

        let packet = match result {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                sleep(self.inner.config.retry_backoff).await;
                return ReceiveFlow::Continue;
            }
            Err(e) => {
                // Errors caused by our own teardown closing the socket are expected
                if !self.is_stopping() && self.is_connected() {
                    self.log_exception("Receive", &e.to_string());
                    self.inner.metrics.fault();
                    self.force_disconnect();
                }
                sleep(self.inner.config.retry_backoff).await;
                return ReceiveFlow::Continue;
            }
        };

        *lock(&self.inner.last_received) = Instant::now();

        match packet {
            Packet::Internal(InternalPacket::Ping) => {
                trace!(session_id = self.id(), "Ping received");
            }
            Packet::Internal(InternalPacket::Error(message)) => {
                self.log_exception("Remote", &message);
            }
            Packet::Internal(InternalPacket::RequestToShutdown) => {
                info!(session_id = self.id(), "Peer requested shutdown");
                let _ = self.stop_with(false, false);
                return ReceiveFlow::Exit;
            }
            packet => {
                self.inner.metrics.packet_received();
                self.inner.handler.on_read(self, packet);
            }
        }
        ReceiveFlow::Continue
    }

    async fn read_packet<R>(&self, reader: &mut R) -> Result<Option<Packet>>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(protocol) = &self.inner.protocol {
            // Drain anything the protocol already buffered before reading more
            let buffered = lock(protocol).on_receive_data(self, &[])?;
            if buffered.is_some() {
                return Ok(buffered);
            }

            let mut chunk = [0u8; PROTOCOL_READ_CHUNK];
            let n = match timeout(PROTOCOL_READ_WINDOW, reader.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(read) => read?,
            };
            if n == 0 {
                return Err(SessionError::ConnectionClosed);
            }
            self.inner.metrics.bytes_read(n as u64);
            let (packet, pending_write) = {
                let mut protocol = lock(protocol);
                let packet = protocol.on_receive_data(self, &chunk[..n]);
                (packet, protocol.has_pending_write())
            };
            // A send pass needs a queued packet to carry protocol bytes
            if pending_write && self.queue_len() == 0 && self.enqueue_packet(Packet::ping()) {
                trace!(session_id = self.id(), "Ping queued to flush protocol bytes");
            }
            return packet;
        }

        let cipher = self.cipher();
        let frame = read_frame(reader).await?;
        self.inner.metrics.bytes_read(frame.payload.len() as u64);
        let packet = decode_packet(frame, cipher.as_ref())?;

        if let Packet::Stream(stream) = &packet {
            self.receive_stream_body(reader, stream, cipher.as_ref()).await?;
        }
        Ok(Some(packet))
    }

    async fn receive_stream_body<R>(
        &self,
        reader: &mut R,
        stream: &StreamPacket,
        cipher: Option<&Cipher>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let handler = &self.inner.handler;
        let result = receive_stream(reader, stream.length(), cipher, |chunk| {
            handler.on_read_stream(self, chunk, stream);
        })
        .await;
        handler.on_complete_stream_read(self, stream);

        let received = result?;
        debug!(session_id = self.id(), received, "Stream received");
        self.inner.metrics.stream_received(received);
        Ok(())
    }
}

impl ProtocolHost for Session {
    fn session_id(&self) -> u64 {
        self.id()
    }

    fn log_exception(&self, message: &str) {
        Session::log_exception(self, "Protocol", message);
    }
}
