//! # Core Components
//!
//! The packet model and the default framing used to put packets on the wire.
//!
//! ## Components
//! - **Packet**: application, text/binary, internal and stream variants
//! - **Codec**: self-delimiting frames for byte streams
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Flags(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod packet;
