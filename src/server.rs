//! # Listener
//!
//! Accepts TCP connections and wraps each one in a server-mode [`Session`].
//!
//! An optional allow-list of [`AllowedUser`] entries maps peer IPs to the
//! password their session encrypts with. With an empty list every peer is
//! accepted in plaintext; otherwise unknown peers are turned away.

use crate::config::{ServerConfig, SessionConfig};
use crate::core::packet::Packet;
use crate::error::{constants, Result, SessionError};
use crate::protocol::ProtocolFactory;
use crate::session::{Mode, Session, SessionHandler};
use crate::utils::{lock, Metrics, MetricsSnapshot};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A peer allowed to connect, with the password its session uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedUser {
    pub ip: IpAddr,
    #[serde(default)]
    pub password: String,
}

impl AllowedUser {
    pub fn new<S: Into<String>>(ip: IpAddr, password: S) -> Self {
        Self {
            ip,
            password: password.into(),
        }
    }

    pub fn has_password(&self) -> bool {
        !self.password.trim().is_empty()
    }
}

struct Shared {
    sessions: Mutex<HashMap<u64, Session>>,
    metrics: Metrics,
}

/// TCP listener that hands every accepted socket to its own session
pub struct Server {
    config: ServerConfig,
    session_config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    protocol: Option<ProtocolFactory>,
    allowed: Arc<HashMap<IpAddr, String>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind", &self.config.bind_addr())
            .field("local_addr", &self.local_addr)
            .field("allowed", &self.allowed.len())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            config,
            session_config: SessionConfig::default(),
            handler,
            protocol: None,
            allowed: Arc::new(HashMap::new()),
            shared: Arc::new(Shared {
                sessions: Mutex::new(HashMap::new()),
                metrics: Metrics::new(),
            }),
            cancel: CancellationToken::new(),
            accept_task: None,
            local_addr: None,
        }
    }

    /// Settings applied to every accepted session
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Give every accepted session its own protocol instance
    pub fn with_protocol(mut self, factory: ProtocolFactory) -> Self {
        self.protocol = Some(factory);
        self
    }

    /// Restrict peers to `users`; the first entry for an IP wins
    pub fn with_allowed_users<I>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = AllowedUser>,
    {
        let mut allowed = HashMap::new();
        for user in users {
            if allowed.contains_key(&user.ip) {
                warn!(ip = %user.ip, "Duplicate allowed user ignored");
                continue;
            }
            allowed.insert(user.ip, user.password);
        }
        self.allowed = Arc::new(allowed);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Bind and start accepting.
    ///
    /// A bind failure is reported as a configuration error before anything
    /// is spawned.
    #[instrument(skip(self), fields(bind = %self.config.bind_addr()))]
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr.filter(|_| self.is_listening()) {
            return Ok(addr);
        }

        let errors = self.config.validate();
        if !errors.is_empty() {
            error!(?errors, "Invalid listener configuration");
            return Err(SessionError::ConfigError(errors.join("; ")));
        }

        let bind = self.config.bind_addr();
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            error!(%bind, error = %e, "Failed to bind listener");
            SessionError::ConfigError(format!("cannot bind {bind}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, allowed = self.allowed.len(), "Listening");

        self.cancel = CancellationToken::new();
        let acceptor = Acceptor {
            listener,
            cancel: self.cancel.clone(),
            session_config: self.session_config.clone(),
            handler: self.handler.clone(),
            protocol: self.protocol.clone(),
            allowed: self.allowed.clone(),
            shared: Arc::downgrade(&self.shared),
        };
        self.accept_task = Some(tokio::spawn(acceptor.run()));
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting and stop every live session
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let sessions: Vec<Session> = lock(&self.shared.sessions).drain().map(|(_, s)| s).collect();
        for _ in &sessions {
            self.shared.metrics.connection_closed();
        }
        let pending: Vec<_> = sessions.iter().filter_map(Session::stop).collect();
        join_all(pending).await;
        info!("Listener stopped");
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.shared.sessions).values().cloned().collect()
    }

    /// Queue `packet` on every session; returns how many accepted it.
    ///
    /// Stream packets are refused: their byte source can be read only once.
    pub fn broadcast(&self, packet: &Packet) -> usize {
        if rejects_fan_out(packet) {
            return 0;
        }
        self.sessions()
            .into_iter()
            .filter(|session| session.enqueue_packet(packet.clone()))
            .count()
    }

    /// Queue `packet` on the sessions whose peer is `ip`; stream packets are refused
    pub fn enqueue_to(&self, ip: IpAddr, packet: &Packet) -> usize {
        if rejects_fan_out(packet) {
            return 0;
        }
        self.sessions()
            .into_iter()
            .filter(|session| session.peer_addr().is_some_and(|peer| peer.ip() == ip))
            .filter(|session| session.enqueue_packet(packet.clone()))
            .count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn rejects_fan_out(packet: &Packet) -> bool {
    let Some(stream) = packet.as_stream() else {
        return false;
    };
    error!(
        length = stream.length(),
        label = ?stream.label(),
        "{}", constants::ERR_STREAM_FAN_OUT
    );
    true
}

/// State moved into the accept task
struct Acceptor {
    listener: TcpListener,
    cancel: CancellationToken,
    session_config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    protocol: Option<ProtocolFactory>,
    allowed: Arc<HashMap<IpAddr, String>>,
    shared: Weak<Shared>,
}

impl Acceptor {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.admit(socket, peer),
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        }
        debug!("Accept loop exiting");
    }

    /// Password for `ip`, or `None` when the peer is not allowed
    fn password_for(&self, ip: IpAddr) -> Option<String> {
        if self.allowed.is_empty() {
            return Some(String::new());
        }
        self.allowed.get(&ip).cloned()
    }

    fn admit(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(password) = self.password_for(peer.ip()) else {
            warn!(%peer, "Rejected connection from unknown peer");
            return;
        };

        let mut builder = Session::builder(Mode::server(socket, password), self.handler.clone())
            .config(self.session_config.clone());
        if let Some(factory) = &self.protocol {
            builder = builder.protocol(factory.clone());
        }
        let session = builder.build();
        lock(&shared.sessions).insert(session.id(), session.clone());
        shared.metrics.connection_established();

        let registry = Arc::downgrade(&shared);
        let started = session.start_with(Arc::new(move |session: &Session| {
            let _ = session.stop();
            if let Some(shared) = registry.upgrade() {
                if lock(&shared.sessions).remove(&session.id()).is_some() {
                    shared.metrics.connection_closed();
                }
            }
        }));

        if started {
            debug!(%peer, session_id = session.id(), "Session admitted");
        } else if lock(&shared.sessions).remove(&session.id()).is_some() {
            shared.metrics.connection_closed();
            shared.metrics.fault();
        }
    }
}
