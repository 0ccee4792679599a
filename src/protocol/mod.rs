//! # Pluggable Wire Protocols
//!
//! A [`Protocol`] replaces the session's default framing. The session keeps
//! ownership of the socket and its send/receive workers; the protocol is a
//! state machine that turns queued packets into bytes and inbound bytes into
//! packets.
//!
//! - [`Protocol::on_send_packet`] runs once per send pass for the packet at the
//!   head of the queue and says whether that packet may now be popped.
//! - [`Protocol::on_receive_data`] runs once per receive pass with whatever bytes
//!   arrived since the last call (possibly none) and yields at most one packet.
//!
//! Protocols are built per session from a [`ProtocolFactory`].

pub mod websocket;

#[cfg(test)]
mod tests;

use crate::core::packet::Packet;
use crate::error::Result;
use std::sync::Arc;

pub use websocket::WebSocketProtocol;

/// What a protocol exposes back to the session that drives it
pub trait ProtocolHost {
    /// Identifier of the driving session, for logs
    fn session_id(&self) -> u64;

    /// Route a diagnostic through the session's exception log
    fn log_exception(&self, message: &str);
}

/// Result of one send pass handled by a protocol
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendOutcome {
    /// Bytes to write to the connection, verbatim
    pub write: Option<Vec<u8>>,
    /// Whether the head packet has been dealt with and may be popped
    pub remove_packet: bool,
}

impl SendOutcome {
    /// Nothing written; try the same packet again shortly
    pub fn retain() -> Self {
        Self {
            write: None,
            remove_packet: false,
        }
    }

    /// Nothing written; drop the packet
    pub fn remove() -> Self {
        Self {
            write: None,
            remove_packet: true,
        }
    }

    pub fn write_and_remove(bytes: Vec<u8>) -> Self {
        Self {
            write: Some(bytes),
            remove_packet: true,
        }
    }

    pub fn write_and_retain(bytes: Vec<u8>) -> Self {
        Self {
            write: Some(bytes),
            remove_packet: false,
        }
    }
}

/// Contract for framing that overrides the session's default path
pub trait Protocol: Send {
    /// Handle the packet at the head of the write queue
    fn on_send_packet(&mut self, host: &dyn ProtocolHost, packet: &Packet) -> Result<SendOutcome>;

    /// Absorb newly arrived bytes and return one decoded packet, if complete.
    ///
    /// Must not wait for more data than `incoming` plus what is already buffered.
    fn on_receive_data(&mut self, host: &dyn ProtocolHost, incoming: &[u8]) -> Result<Option<Packet>>;

    /// Protocol bytes are waiting on the next send pass, queued packet or not
    fn has_pending_write(&self) -> bool {
        false
    }

    fn on_connect(&mut self, _host: &dyn ProtocolHost) {}

    fn on_disconnect(&mut self, _host: &dyn ProtocolHost) {}
}

/// Builds one protocol instance per session
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn Protocol> + Send + Sync>;

/// Factory for any protocol with a `Default` constructor
pub fn factory<P>() -> ProtocolFactory
where
    P: Protocol + Default + 'static,
{
    Arc::new(|| Box::new(P::default()) as Box<dyn Protocol>)
}
