//! Server side of the web socket protocol.
//!
//! ```text
//! None ──(upgrade request received)──▶ PreSend ──(101 response written)──▶ Sent ──(first frame decoded)──▶ Finished
//!   ▲                                                                                                    │
//!   └──────────────────────────────────────────── on_disconnect ◀────────────────────────────────────────┘
//! ```
//!
//! Frames written by this side are single, unfragmented and unmasked, and
//! anything that is not a ping or a binary buffer is sent as JSON text.
//! Inbound frames are unmasked with the client's key and text arrives as raw
//! UTF-8. Payloads above 65535 bytes and 64-bit extended lengths are not
//! supported. A close frame stops decoding of the buffered data; no close
//! frame is sent back.

use super::{Protocol, ProtocolHost, SendOutcome};
use crate::core::packet::{InternalPacket, Packet};
use crate::error::{constants, Result, SessionError};
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// GUID appended to the client key when computing the accept value
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Time allowed between sending the 101 response and the first client frame
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest payload one outgoing frame may carry
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;

/// Handshake progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    None,
    PreSend,
    Sent,
    Finished,
}

/// Outcome of trying to decode one frame from a buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A full frame was consumed from the buffer
    Packet(Packet),
    /// More bytes are needed; nothing consumed
    Incomplete,
    /// The peer sent a close frame
    Closed,
    /// The frame uses an opcode this side does not handle
    Unsupported(u8),
}

/// Web socket framing for sessions talking to browsers
#[derive(Debug)]
pub struct WebSocketProtocol {
    state: HandshakeState,
    inbound: Vec<u8>,
    pending_response: Option<Vec<u8>>,
    response_sent_at: Option<Instant>,
    handshake_timeout: Duration,
}

impl Default for WebSocketProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketProtocol {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::None,
            inbound: Vec::new(),
            pending_response: None,
            response_sent_at: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    fn reset(&mut self) {
        self.state = HandshakeState::None;
        self.inbound.clear();
        self.pending_response = None;
        self.response_sent_at = None;
    }

    fn handshake_expired(&self) -> bool {
        self.state == HandshakeState::Sent
            && self
                .response_sent_at
                .is_some_and(|sent| sent.elapsed() > self.handshake_timeout)
    }
}

impl Protocol for WebSocketProtocol {
    fn on_send_packet(&mut self, host: &dyn ProtocolHost, packet: &Packet) -> Result<SendOutcome> {
        match self.state {
            HandshakeState::None => Ok(SendOutcome::retain()),
            HandshakeState::PreSend => {
                let response = self.pending_response.take().unwrap_or_default();
                self.state = HandshakeState::Sent;
                self.response_sent_at = Some(Instant::now());
                debug!(session_id = host.session_id(), "Web socket upgrade response queued");
                Ok(SendOutcome::write_and_retain(response))
            }
            HandshakeState::Sent | HandshakeState::Finished => match encode_frame(packet) {
                Ok(frame) => Ok(SendOutcome::write_and_remove(frame)),
                Err(e) => {
                    host.log_exception(&format!(
                        "WebSocketProtocol: dropping {} packet: {e}",
                        packet.kind_name()
                    ));
                    Ok(SendOutcome::remove())
                }
            },
        }
    }

    fn on_receive_data(&mut self, host: &dyn ProtocolHost, incoming: &[u8]) -> Result<Option<Packet>> {
        self.inbound.extend_from_slice(incoming);

        let packet = match self.state {
            HandshakeState::None => {
                if let Some(response) = handshake_response(&self.inbound) {
                    self.pending_response = Some(response);
                    self.state = HandshakeState::PreSend;
                    self.inbound.clear();
                }
                None
            }
            HandshakeState::PreSend => None,
            HandshakeState::Sent | HandshakeState::Finished => match decode_frame(&mut self.inbound)? {
                Decoded::Packet(packet) => {
                    self.state = HandshakeState::Finished;
                    Some(packet)
                }
                Decoded::Incomplete => None,
                Decoded::Closed => {
                    debug!(session_id = host.session_id(), "Web socket close frame received");
                    self.inbound.clear();
                    None
                }
                Decoded::Unsupported(opcode) => {
                    self.inbound.clear();
                    host.log_exception(&SessionError::UnsupportedOpcode(opcode).to_string());
                    None
                }
            },
        };

        if packet.is_none() && self.handshake_expired() {
            warn!(session_id = host.session_id(), "Web socket handshake timed out");
            return Err(SessionError::HandshakeTimeout);
        }

        Ok(packet)
    }

    fn has_pending_write(&self) -> bool {
        self.state == HandshakeState::PreSend
    }

    fn on_disconnect(&mut self, _host: &dyn ProtocolHost) {
        self.reset();
    }
}

/// `base64(SHA1(key + GUID))`
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the 101 response once `buf` holds a complete upgrade request
pub fn handshake_response(buf: &[u8]) -> Option<Vec<u8>> {
    let request = std::str::from_utf8(buf).ok()?;
    if !request.starts_with("GET") || !request.ends_with("\r\n\r\n") {
        return None;
    }

    let key = request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("Sec-WebSocket-Key")
            .then(|| value.trim())
    })?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    Some(response.into_bytes())
}

/// Encode one packet as one unmasked frame.
///
/// Pings and binary buffers map to their own opcodes; every other packet,
/// text included, goes out as a text frame holding its JSON encoding.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let (opcode, data) = match packet {
        Packet::Internal(InternalPacket::Ping) => (OPCODE_PING, Vec::new()),
        Packet::Binary(buffer) => (OPCODE_BINARY, buffer.clone()),
        other => (OPCODE_TEXT, serde_json::to_vec(other)?),
    };
    build_frame(opcode, data, None)
}

/// Encode one packet as a masked frame, the way a browser client sends it.
///
/// Text is written as raw UTF-8, matching what [`decode_frame`] hands back.
pub fn encode_masked_frame(packet: &Packet, mask: [u8; 4]) -> Result<Vec<u8>> {
    let (opcode, data) = match packet {
        Packet::Internal(InternalPacket::Ping) => (OPCODE_PING, Vec::new()),
        Packet::Binary(buffer) => (OPCODE_BINARY, buffer.clone()),
        Packet::Text(message) => (OPCODE_TEXT, message.as_bytes().to_vec()),
        other => (OPCODE_TEXT, serde_json::to_vec(other)?),
    };
    build_frame(opcode, data, Some(mask))
}

fn build_frame(opcode: u8, mut data: Vec<u8>, mask: Option<[u8; 4]>) -> Result<Vec<u8>> {
    if data.len() > MAX_FRAME_PAYLOAD {
        return Err(SessionError::OversizedPacket(data.len()));
    }

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let mut frame = Vec::with_capacity(data.len() + 8);
    frame.push(FIN_BIT | opcode);
    if data.len() <= 125 {
        frame.push(mask_bit | data.len() as u8);
    } else {
        frame.push(mask_bit | LEN_16);
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    }

    if let Some(key) = mask {
        frame.extend_from_slice(&key);
        apply_mask(&mut data, key);
    }
    frame.extend_from_slice(&data);
    Ok(frame)
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decode at most one frame from the front of `buf`.
///
/// Only a fully decoded frame is consumed; partial frames leave `buf` untouched.
pub fn decode_frame(buf: &mut Vec<u8>) -> Result<Decoded> {
    if buf.is_empty() {
        return Ok(Decoded::Incomplete);
    }

    let opcode = buf[0] & 0x0F;
    match opcode {
        OPCODE_TEXT | OPCODE_BINARY | OPCODE_PING | OPCODE_PONG => {}
        OPCODE_CLOSE => return Ok(Decoded::Closed),
        other => return Ok(Decoded::Unsupported(other)),
    }

    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }

    let masked = buf[1] & MASK_BIT != 0;
    let len7 = buf[1] & 0x7F;
    let mut index = 2;

    let length = match len7 {
        0..=125 => len7 as usize,
        LEN_16 => {
            if buf.len() < index + 2 {
                return Ok(Decoded::Incomplete);
            }
            let len = u16::from_be_bytes([buf[index], buf[index + 1]]) as usize;
            index += 2;
            len
        }
        _ => {
            // LEN_64
            if buf.len() < index + 8 {
                return Ok(Decoded::Incomplete);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[index..index + 8]);
            let declared = u64::from_be_bytes(raw);
            warn!(length = declared, "{}", constants::ERR_FRAME_TOO_LONG);
            return Err(SessionError::OversizedPacket(
                usize::try_from(declared).unwrap_or(usize::MAX),
            ));
        }
    };

    let key = if masked {
        if buf.len() < index + 4 {
            return Ok(Decoded::Incomplete);
        }
        let key = [buf[index], buf[index + 1], buf[index + 2], buf[index + 3]];
        index += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < index + length {
        return Ok(Decoded::Incomplete);
    }

    let mut payload: Vec<u8> = buf.drain(..index + length).skip(index).collect();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    let packet = match opcode {
        OPCODE_TEXT => Packet::Text(String::from_utf8_lossy(&payload).into_owned()),
        OPCODE_BINARY => Packet::Binary(payload),
        _ => Packet::ping(),
    };
    Ok(Decoded::Packet(packet))
}
