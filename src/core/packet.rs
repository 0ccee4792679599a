//! # Packet Model
//!
//! Tagged message units exchanged over a session.
//!
//! - [`Packet::Application`] carries an application-defined payload, tagged with
//!   a `kind` string so applications can register their own payload shapes.
//! - [`Packet::Text`] and [`Packet::Binary`] are the plain payloads web socket
//!   peers exchange.
//! - [`Packet::Internal`] is session housekeeping (ping, error, shutdown request).
//! - [`Packet::Stream`] announces a raw byte transfer that follows the packet
//!   on the wire.
//!
//! Packets are value objects. A [`StreamPacket`] also owns a handle to its byte
//! source; only the declared length and label are serialized.

use crate::error::{Result, SessionError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;

/// A message unit exchanged over a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    Application(ApplicationPacket),
    Text(String),
    Binary(Vec<u8>),
    Internal(InternalPacket),
    Stream(StreamPacket),
}

impl Packet {
    /// Keepalive ping
    pub fn ping() -> Self {
        Packet::Internal(InternalPacket::Ping)
    }

    /// Ask the peer to stop its session
    pub fn shutdown_request() -> Self {
        Packet::Internal(InternalPacket::RequestToShutdown)
    }

    /// Report an error to the peer
    pub fn error<S: Into<String>>(message: S) -> Self {
        Packet::Internal(InternalPacket::Error(message.into()))
    }

    pub fn text<S: Into<String>>(message: S) -> Self {
        Packet::Text(message.into())
    }

    pub fn binary<B: Into<Vec<u8>>>(buffer: B) -> Self {
        Packet::Binary(buffer.into())
    }

    #[inline]
    pub fn is_shutdown_request(&self) -> bool {
        matches!(self, Packet::Internal(InternalPacket::RequestToShutdown))
    }

    #[inline]
    pub fn is_ping(&self) -> bool {
        matches!(self, Packet::Internal(InternalPacket::Ping))
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, Packet::Internal(_))
    }

    /// The stream announcement, if this packet is one
    pub fn as_stream(&self) -> Option<&StreamPacket> {
        match self {
            Packet::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Short name used in logs
    pub fn kind_name(&self) -> &str {
        match self {
            Packet::Application(app) => &app.kind,
            Packet::Text(_) => "text",
            Packet::Binary(_) => "binary",
            Packet::Internal(InternalPacket::Ping) => "ping",
            Packet::Internal(InternalPacket::Error(_)) => "error",
            Packet::Internal(InternalPacket::RequestToShutdown) => "shutdown",
            Packet::Stream(_) => "stream",
        }
    }
}

/// Session housekeeping messages; never delivered to the collaborator's `on_read`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalPacket {
    Ping,
    Error(String),
    RequestToShutdown,
}

/// Application payload tagged with the shape it was encoded from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationPacket {
    pub kind: String,
    pub body: Vec<u8>,
}

impl ApplicationPacket {
    pub fn new<S: Into<String>>(kind: S, body: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            body,
        }
    }

    /// Encode a typed value under `kind`
    pub fn encode<T: Serialize>(kind: &str, value: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            body: bincode::serialize(value)?,
        })
    }

    /// Decode the body back into the shape registered for `kind`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.body)?)
    }

    /// Decode only when the kind matches
    pub fn decode_as<T: DeserializeOwned>(&self, kind: &str) -> Option<Result<T>> {
        (self.kind == kind).then(|| self.decode())
    }
}

impl From<ApplicationPacket> for Packet {
    fn from(app: ApplicationPacket) -> Self {
        Packet::Application(app)
    }
}

/// An owned byte source handed to the session for one stream send
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Shared handle to a stream's byte source.
///
/// Clones share the same source. Whoever calls [`StreamSource::take`] first owns it.
#[derive(Clone, Default)]
pub struct StreamSource(Arc<Mutex<Option<ByteSource>>>);

impl StreamSource {
    pub fn new(source: ByteSource) -> Self {
        Self(Arc::new(Mutex::new(Some(source))))
    }

    /// Take ownership of the source, leaving the handle empty
    pub fn take(&self) -> Option<ByteSource> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Drop the source if it is still present
    pub fn release(&self) {
        drop(self.take());
    }

    pub fn is_present(&self) -> bool {
        self.0.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("present", &self.is_present())
            .finish()
    }
}

/// Announces `length` raw bytes that follow this packet on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPacket {
    length: u64,
    label: Option<String>,
    #[serde(skip)]
    source: StreamSource,
}

impl StreamPacket {
    /// Wrap an arbitrary reader that will yield exactly `length` bytes
    pub fn new<R>(source: R, length: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            length,
            label: None,
            source: StreamSource::new(Box::new(source)),
        }
    }

    /// Stream an in-memory buffer
    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        let bytes = bytes.into();
        let length = bytes.len() as u64;
        Self::new(Cursor::new(bytes), length).with_label("bytes")
    }

    /// Stream a file, declaring its current size
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(file, length).with_label(label))
    }

    /// Attach descriptive metadata carried to the receiver
    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Take ownership of the byte source for sending
    pub fn take_source(&self) -> Result<ByteSource> {
        self.source.take().ok_or_else(|| {
            SessionError::StreamError(crate::error::constants::ERR_STREAM_SOURCE_MISSING.into())
        })
    }

    /// Close the byte source without sending it
    pub fn release_source(&self) {
        self.source.release();
    }

    pub fn has_source(&self) -> bool {
        self.source.is_present()
    }
}

impl PartialEq for StreamPacket {
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length && self.label == other.label
    }
}

impl From<StreamPacket> for Packet {
    fn from(stream: StreamPacket) -> Self {
        Packet::Stream(stream)
    }
}
