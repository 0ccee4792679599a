//! # Socket Factory
//!
//! Long-lived bidirectional TCP sessions.
//!
//! Each accepted or outbound socket becomes a [`Session`] that queues outbound
//! packets, pumps inbound ones, detects dead peers with a ping keepalive,
//! optionally encrypts traffic with a password-derived key and can hand its
//! framing to a pluggable [`Protocol`] such as [`WebSocketProtocol`].
//!
//! ## Layout
//! - [`core`]: packet model and default framing
//! - [`crypto`]: password-derived cipher for packets and streams
//! - [`transfer`]: raw byte transfers inline with framed packets
//! - [`protocol`]: protocol contract and the web socket implementation
//! - [`session`]: the session engine, its client/server modes and scheduler
//! - [`server`]: TCP listener with a per-IP allow-list
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Flags(1)] [Length(4)] [Payload(N)]
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;
pub mod utils;

pub use crate::config::FactoryConfig;
pub use crate::core::packet::{ApplicationPacket, InternalPacket, Packet, StreamPacket};
pub use crate::error::{Result, SessionError};
pub use crate::protocol::{Protocol, ProtocolFactory, WebSocketProtocol};
pub use crate::server::{AllowedUser, Server};
pub use crate::session::{Session, SessionHandler};
