//! Connection policy plugged into a [`Session`].
//!
//! A session is either handed an accepted socket (server mode) or dials out on
//! its own and keeps redialing while running (client mode). Everything else
//! about the session is shared.

use super::Session;
use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::utils::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

/// Server side: one accepted socket and the password resolved for its peer
#[derive(Debug)]
pub struct ServerMode {
    socket: Mutex<Option<TcpStream>>,
    password: String,
}

impl ServerMode {
    /// Take the accepted socket; `None` once the session has used it
    pub fn take_socket(&self) -> Option<TcpStream> {
        lock(&self.socket).take()
    }
}

/// Client side: where to connect and how often to retry
#[derive(Debug)]
pub struct ClientMode {
    target: Mutex<String>,
    password: String,
    reconnect_delay: Duration,
    last_attempt: Mutex<Option<Instant>>,
    connecting: AtomicBool,
}

#[derive(Debug)]
pub enum Mode {
    Server(ServerMode),
    Client(ClientMode),
}

impl Mode {
    pub fn server<S: Into<String>>(socket: TcpStream, password: S) -> Self {
        Mode::Server(ServerMode {
            socket: Mutex::new(Some(socket)),
            password: password.into(),
        })
    }

    pub fn client<T, P>(target: T, password: P, reconnect_delay: Duration) -> Self
    where
        T: Into<String>,
        P: Into<String>,
    {
        Mode::Client(ClientMode {
            target: Mutex::new(target.into()),
            password: password.into(),
            reconnect_delay,
            last_attempt: Mutex::new(None),
            connecting: AtomicBool::new(false),
        })
    }

    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self::client(
            config.target_addr(),
            config.password.clone(),
            config.reconnect_delay,
        )
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Mode::Client(_))
    }

    /// Change the address a client session dials; returns `false` in server mode
    pub fn set_target<S: Into<String>>(&self, target: S) -> bool {
        match self {
            Mode::Client(client) => {
                *lock(&client.target) = target.into();
                true
            }
            Mode::Server(_) => false,
        }
    }

    pub fn target(&self) -> Option<String> {
        match self {
            Mode::Client(client) => Some(lock(&client.target).clone()),
            Mode::Server(_) => None,
        }
    }

    /// Runs once when the session starts
    pub(crate) fn on_start(&self, session: &Session) -> Result<()> {
        match self {
            Mode::Server(server) => {
                let socket = server.take_socket().ok_or_else(|| {
                    SessionError::ConfigError("server session started without a socket".into())
                })?;
                session.set_connected(&server.password, socket)
            }
            Mode::Client(_) => Ok(()),
        }
    }

    /// Runs on every scheduler tick before the keepalive check
    pub(crate) fn on_tick(&self, session: &Session) {
        let Mode::Client(client) = self else {
            return;
        };
        if session.is_connected() || session.is_stopping() {
            return;
        }

        {
            let mut last = lock(&client.last_attempt);
            if last.is_some_and(|at| at.elapsed() < client.reconnect_delay) {
                return;
            }
            if client
                .connecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            *last = Some(Instant::now());
        }

        let target = lock(&client.target).clone();
        let password = client.password.clone();
        let session = session.clone();
        tokio::spawn(async move {
            debug!(session_id = session.id(), %target, "Connecting");
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    if let Err(e) = session.set_connected(&password, stream) {
                        session.log_exception("Client", &e.to_string());
                    }
                }
                Err(e) => {
                    session.log_exception("Client", &format!("connect to {target} failed: {e}"));
                }
            }
            if let Mode::Client(client) = session.mode() {
                client.connecting.store(false, Ordering::Release);
            }
        });
    }

    /// Runs once during teardown, after the socket has been closed
    pub(crate) fn on_stop(&self, session: &Session) {
        match self {
            Mode::Server(server) => {
                // A server session that never started still owns its socket
                if server.take_socket().is_some() {
                    info!(session_id = session.id(), "Dropped unused accepted socket");
                }
            }
            Mode::Client(client) => {
                *lock(&client.last_attempt) = None;
            }
        }
    }
}
