//! # Stream Transfer
//!
//! Raw byte transfers that ride inline with framed packets.
//!
//! A [`StreamPacket`] goes out as an ordinary frame carrying only its declared
//! length. The raw bytes follow immediately on the same connection:
//!
//! ```text
//! plaintext: [frame][N raw bytes][next frame]...
//! encrypted: [frame][CBC(N bytes ++ 64 KiB zeros), trailing partial block dropped][MARKER(16)][next frame]...
//! ```
//!
//! The zero-filled segment pushes the last real bytes out of the cipher's
//! block buffer. The receiver decrypts exactly the declared length, then slides
//! over the leftover filler ciphertext until it sees [`END_OF_STREAM_MARKER`],
//! which puts it back on a frame boundary.

use crate::config::BUFFER_SEGMENT_SIZE;
use crate::core::packet::StreamPacket;
use crate::crypto::{Cipher, DecryptingReader, EncryptingWriter};
use crate::error::{constants, Result, SessionError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Fixed 16-byte sequence written in the clear after an encrypted stream
pub const END_OF_STREAM_MARKER: [u8; 16] = [
    0x31, 0x8e, 0xf6, 0x90, 0x6f, 0x22, 0xb4, 0x87, 0x5c, 0x35, 0x9f, 0xd4, 0x48, 0xac, 0xce, 0x56,
];

/// Upper bound on bytes skipped while looking for the marker
const MAX_MARKER_SCAN: usize = 2 * BUFFER_SEGMENT_SIZE + 2 * END_OF_STREAM_MARKER.len();

enum Sink<'a, W> {
    Plain(&'a mut W),
    Encrypted(EncryptingWriter<'a, W>),
}

impl<W> Sink<'_, W>
where
    W: AsyncWrite + Unpin,
{
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Plain(writer) => writer.write_all(data).await?,
            Sink::Encrypted(writer) => writer.write_all(data).await?,
        }
        Ok(())
    }
}

/// Copy the stream packet's byte source onto `writer`.
///
/// The source is consumed and dropped whether or not the copy succeeds.
#[instrument(skip(writer, packet, cipher), fields(length = packet.length(), encrypted = cipher.is_some()))]
pub async fn send_stream<W>(writer: &mut W, packet: &StreamPacket, cipher: Option<&Cipher>) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut source = packet.take_source()?;
    let length = packet.length();
    let mut segment = vec![0u8; BUFFER_SEGMENT_SIZE];

    let mut sink = match cipher {
        None => Sink::Plain(&mut *writer),
        Some(cipher) => Sink::Encrypted(EncryptingWriter::new(&mut *writer, cipher)),
    };

    let mut sent = 0u64;
    while sent < length {
        let want = (length - sent).min(BUFFER_SEGMENT_SIZE as u64) as usize;
        let n = source.read(&mut segment[..want]).await?;
        if n == 0 {
            return Err(SessionError::StreamError(
                constants::ERR_STREAM_SOURCE_SHORT.into(),
            ));
        }
        sink.write_all(&segment[..n]).await?;
        sent += n as u64;
    }

    if let Sink::Encrypted(mut encrypting) = sink {
        segment.fill(0);
        encrypting.write_all(&segment).await?;
        debug!(discarded = encrypting.buffered(), "Filler segment pushed");
        drop(encrypting);
        writer.write_all(&END_OF_STREAM_MARKER).await?;
    }

    writer.flush().await?;
    Ok(sent)
}

/// Read `length` stream bytes from `reader`, handing each chunk to `on_chunk`.
///
/// With a cipher active, the filler and marker are consumed afterwards so the
/// reader is left on the next frame boundary.
#[instrument(skip(reader, cipher, on_chunk), fields(encrypted = cipher.is_some()))]
pub async fn receive_stream<R, F>(
    reader: &mut R,
    length: u64,
    cipher: Option<&Cipher>,
    mut on_chunk: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut scratch = vec![0u8; BUFFER_SEGMENT_SIZE];
    let mut received = 0u64;

    match cipher {
        None => {
            while received < length {
                let want = (length - received).min(BUFFER_SEGMENT_SIZE as u64) as usize;
                let n = reader.read(&mut scratch[..want]).await?;
                if n == 0 {
                    return Err(SessionError::ConnectionClosed);
                }
                on_chunk(&scratch[..n]);
                received += n as u64;
            }
        }
        Some(cipher) => {
            {
                let mut decrypting = DecryptingReader::new(&mut *reader, cipher);
                while received < length {
                    let want = (length - received).min(BUFFER_SEGMENT_SIZE as u64) as usize;
                    let n = decrypting.read(&mut scratch[..want]).await?;
                    on_chunk(&scratch[..n]);
                    received += n as u64;
                }
            }
            let skipped = skip_to_marker(reader).await?;
            debug!(skipped, "Resynchronized after encrypted stream");
        }
    }

    Ok(received)
}

/// Consume bytes until the last 16 read equal the end-of-stream marker
pub async fn skip_to_marker<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut window = [0u8; END_OF_STREAM_MARKER.len()];
    let mut seen = 0usize;

    loop {
        let byte = reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                SessionError::ConnectionClosed
            } else {
                SessionError::Io(e)
            }
        })?;
        window.copy_within(1.., 0);
        window[END_OF_STREAM_MARKER.len() - 1] = byte;
        seen += 1;

        if seen >= END_OF_STREAM_MARKER.len() && window == END_OF_STREAM_MARKER {
            return Ok(seen);
        }
        if seen > MAX_MARKER_SCAN {
            return Err(SessionError::StreamError(
                "end-of-stream marker not found".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn test_marker_found_after_noise() {
        let mut wire = vec![0xAAu8; 100];
        wire.extend_from_slice(&END_OF_STREAM_MARKER);
        wire.extend_from_slice(b"next");

        let mut reader = &wire[..];
        let skipped = skip_to_marker(&mut reader).await.unwrap();
        assert_eq!(skipped, 116);
        assert_eq!(reader, b"next");
    }

    #[tokio::test]
    async fn test_marker_missing_is_an_error() {
        let wire = vec![0u8; 40];
        let mut reader = &wire[..];
        assert!(matches!(
            skip_to_marker(&mut reader).await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_short_source_is_reported() {
        let packet = StreamPacket::new(std::io::Cursor::new(vec![1u8; 10]), 20);
        let mut wire = Vec::new();
        let result = send_stream(&mut wire, &packet, None).await;
        assert!(matches!(result, Err(SessionError::StreamError(_))));
        assert!(!packet.has_source());
    }

    #[tokio::test]
    async fn test_plain_stream_has_no_trailer() {
        let packet = StreamPacket::from_bytes(vec![3u8; 70_000]);
        let mut wire = Vec::new();
        let sent = send_stream(&mut wire, &packet, None).await.unwrap();
        assert_eq!(sent, 70_000);
        assert_eq!(wire.len(), 70_000);
    }

    #[tokio::test]
    async fn test_encrypted_stream_layout() {
        let cipher = Cipher::from_password("files").unwrap();
        let packet = StreamPacket::from_bytes(vec![3u8; 100]);
        let mut wire = Vec::new();
        send_stream(&mut wire, &packet, Some(&cipher)).await.unwrap();

        // floor((100 + 65536) / 16) blocks, then the marker
        assert_eq!(wire.len(), (100 + BUFFER_SEGMENT_SIZE) / 16 * 16 + 16);
        assert!(wire.ends_with(&END_OF_STREAM_MARKER));
    }
}
