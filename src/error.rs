//! # Error Types
//!
//! Error handling for sessions, codecs, and wire protocols.
//!
//! This module defines all error variants that can occur while a session is
//! running, from low-level socket faults to protocol violations.
//!
//! ## Error Categories
//! - **Transport**: socket and stream I/O failures (force a local disconnect)
//! - **Codec**: serialization, encryption and decryption failures
//! - **Protocol**: handshake timeouts, oversized frames, unsupported opcodes
//! - **Configuration**: invalid settings or unusable bind addresses
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use socket_factory::error::{SessionError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{info, error};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(SessionError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(SessionError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("example.txt") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_PING_TIMEOUT: &str = "Ping timeout";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_ENVELOPE_MISMATCH: &str = "Frame encryption flag does not match session";

    /// Stream transfer errors
    pub const ERR_STREAM_SOURCE_MISSING: &str = "Stream packet has no byte source";
    pub const ERR_STREAM_SOURCE_SHORT: &str = "Stream source ended before declared length";
    pub const ERR_STREAM_FAN_OUT: &str = "Stream packets can only be queued on one session";

    /// WebSocket errors
    pub const ERR_FRAME_TOO_LONG: &str = "Frame length exceeds 16-bit extended length";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Disconnect messages handed to collaborators
    pub const MSG_DISCONNECTED: &str = "Successfully Disconnected.";
}

/// Primary error type for all session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Stream transfer failed: {0}")]
    StreamError(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Opcode not supported: {0}")]
    UnsupportedOpcode(u8),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl SessionError {
    /// Whether this error came from the codec layer rather than the socket
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            SessionError::Serialization(_)
                | SessionError::Json(_)
                | SessionError::EncryptionFailure(_)
                | SessionError::DecryptionFailure(_)
        )
    }
}

/// Type alias for Results using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;
