//! # Packet Framing
//!
//! Default wire format used when no [`Protocol`](crate::protocol::Protocol) is installed.
//!
//! ```text
//! [Magic(4)] [Version(1)] [Flags(1)] [Length(4, BE)] [Payload(N)]
//! ```
//!
//! The payload is the bincode encoding of one [`Packet`], or, when the
//! `ENCRYPTED` flag is set, the ciphertext of an [`EncryptedEnvelope`].
//! Every frame is self-delimiting so raw stream bytes can follow a frame
//! directly on the same connection.

use crate::config::{FRAME_VERSION, MAGIC_BYTES, MAX_PAYLOAD_SIZE};
use crate::core::packet::Packet;
use crate::crypto::{Cipher, EncryptedEnvelope};
use crate::error::{constants, Result, SessionError};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Bytes preceding every payload
pub const HEADER_SIZE: usize = 10;

/// Frame flag bits
pub mod flags {
    /// Payload is an encrypted envelope
    pub const ENCRYPTED: u8 = 0x01;
}

/// One framed unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn plain(payload: Vec<u8>) -> Self {
        Self { flags: 0, payload }
    }

    pub fn encrypted(envelope: EncryptedEnvelope) -> Self {
        Self {
            flags: flags::ENCRYPTED,
            payload: envelope.into_inner(),
        }
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// Serialize header and payload into one buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.push(FRAME_VERSION);
        out.push(self.flags);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete frame from a byte slice
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(SessionError::InvalidHeader);
        }
        let (flags, len) = parse_header(&data[..HEADER_SIZE])?;
        if data.len() < HEADER_SIZE + len {
            return Err(SessionError::InvalidHeader);
        }
        Ok(Self {
            flags,
            payload: data[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
        })
    }
}

/// Validate a header, returning `(flags, payload_len)`
pub fn parse_header(header: &[u8]) -> Result<(u8, usize)> {
    if header.len() < HEADER_SIZE || header[0..4] != MAGIC_BYTES {
        return Err(SessionError::InvalidHeader);
    }

    let version = header[4];
    if version != FRAME_VERSION {
        return Err(SessionError::UnsupportedVersion(version));
    }

    let flags = header[5];
    let len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(SessionError::OversizedPacket(len));
    }

    Ok((flags, len))
}

/// Tokio codec for buffered framing
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (flags, len) = parse_header(&src[..HEADER_SIZE])?;
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).to_vec();
        Ok(Some(Frame { flags, payload }))
    }
}

impl Encoder<Frame> for PacketCodec {
    type Error = SessionError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SessionError::OversizedPacket(frame.payload.len()));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(frame.flags);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Read exactly one frame from `reader` without consuming anything past it
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;

    let (flags, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;

    Ok(Frame { flags, payload })
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: Frame) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    PacketCodec.encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(buf.len())
}

/// Serialize a packet, encrypting it when a cipher is active
pub fn encode_packet(packet: &Packet, cipher: Option<&Cipher>) -> Result<Frame> {
    match cipher {
        None => Ok(Frame::plain(bincode::serialize(packet)?)),
        Some(cipher) => Ok(Frame::encrypted(cipher.encrypt_packet(packet)?)),
    }
}

/// Inverse of [`encode_packet`]; the frame's flag must match the session's cipher state
pub fn decode_packet(frame: Frame, cipher: Option<&Cipher>) -> Result<Packet> {
    match (cipher, frame.is_encrypted()) {
        (None, false) => Ok(bincode::deserialize(&frame.payload)?),
        (Some(cipher), true) => cipher.decrypt_packet(&EncryptedEnvelope::new(frame.payload)),
        _ => Err(SessionError::DecryptionFailure(
            constants::ERR_ENVELOPE_MISMATCH.into(),
        )),
    }
}

fn eof_as_closed(e: std::io::Error) -> SessionError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SessionError::ConnectionClosed
    } else {
        SessionError::Io(e)
    }
}
