#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for framing, envelopes, packets and idle sessions

use serde::{Deserialize, Serialize};
use socket_factory::config::{MAX_PAYLOAD_SIZE, SessionConfig};
use socket_factory::core::codec::{decode_packet, encode_packet, flags, read_frame, write_frame, Frame};
use socket_factory::core::packet::{ApplicationPacket, InternalPacket, Packet, StreamPacket};
use socket_factory::crypto::{Cipher, EncryptedEnvelope};
use socket_factory::error::SessionError;
use socket_factory::session::{Mode, NoopHandler, Session};
use socket_factory::utils::Metrics;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// FRAME EDGE CASES
// ============================================================================

#[test]
fn test_frame_empty_payload() {
    let bytes = Frame::plain(Vec::new()).to_bytes();
    let decoded = Frame::from_bytes(&bytes).expect("Should decode empty payload");
    assert!(decoded.payload.is_empty());
    assert!(!decoded.is_encrypted());
}

#[test]
fn test_frame_truncated_payload() {
    let mut bytes = Frame::plain(vec![1, 2, 3, 4]).to_bytes();
    bytes.truncate(bytes.len() - 1);
    assert!(matches!(Frame::from_bytes(&bytes), Err(SessionError::InvalidHeader)));
}

#[test]
fn test_frame_empty_buffer() {
    assert!(matches!(Frame::from_bytes(&[]), Err(SessionError::InvalidHeader)));
}

#[tokio::test]
async fn test_frame_exactly_max_payload() {
    let frame = Frame::plain(vec![0xAB; MAX_PAYLOAD_SIZE]);
    let mut wire = Vec::new();
    write_frame(&mut wire, frame).await.unwrap();

    let mut reader = &wire[..];
    let decoded = read_frame(&mut reader).await.unwrap();
    assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
}

#[tokio::test]
async fn test_frame_one_more_than_max_fails() {
    let frame = Frame::plain(vec![0; MAX_PAYLOAD_SIZE + 1]);
    let mut wire = Vec::new();
    assert!(matches!(
        write_frame(&mut wire, frame).await,
        Err(SessionError::OversizedPacket(_))
    ));
    assert!(wire.is_empty());
}

#[tokio::test]
async fn test_back_to_back_frames() {
    let mut wire = Vec::new();
    for text in ["one", "two", "three"] {
        write_frame(&mut wire, encode_packet(&Packet::text(text), None).unwrap())
            .await
            .unwrap();
    }

    let mut reader = &wire[..];
    for text in ["one", "two", "three"] {
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(decode_packet(frame, None).unwrap(), Packet::text(text));
    }
    assert!(matches!(read_frame(&mut reader).await, Err(SessionError::ConnectionClosed)));
}

// ============================================================================
// ENVELOPE EDGE CASES
// ============================================================================

#[test]
fn test_plain_frame_rejected_by_encrypted_session() {
    let cipher = Cipher::from_password("pw").unwrap();
    let frame = encode_packet(&Packet::text("clear"), None).unwrap();
    assert!(matches!(
        decode_packet(frame, Some(&cipher)),
        Err(SessionError::DecryptionFailure(_))
    ));
}

#[test]
fn test_corrupted_envelope_is_decryption_failure() {
    let cipher = Cipher::from_password("pw").unwrap();
    let mut frame = encode_packet(&Packet::binary(vec![5u8; 300]), Some(&cipher)).unwrap();
    let last = frame.payload.len() - 1;
    frame.payload[last] ^= 0xFF;

    let err = decode_packet(frame, Some(&cipher)).unwrap_err();
    assert!(err.is_codec());
}

#[test]
fn test_envelope_not_block_aligned() {
    let cipher = Cipher::from_password("pw").unwrap();
    let envelope = EncryptedEnvelope::new(vec![0u8; 17]);
    assert!(matches!(
        cipher.decrypt_packet(&envelope),
        Err(SessionError::DecryptionFailure(_))
    ));
}

#[test]
fn test_empty_envelope() {
    let cipher = Cipher::from_password("pw").unwrap();
    let envelope = EncryptedEnvelope::new(Vec::new());
    assert!(envelope.is_empty());
    assert!(cipher.decrypt_packet(&envelope).is_err());
}

#[test]
fn test_encrypted_flag_set_on_frame() {
    let cipher = Cipher::from_password("pw").unwrap();
    let frame = encode_packet(&Packet::ping(), Some(&cipher)).unwrap();
    assert_eq!(frame.flags & flags::ENCRYPTED, flags::ENCRYPTED);
}

#[test]
fn test_whitespace_password_means_plaintext() {
    assert!(Cipher::from_password("").is_none());
    assert!(Cipher::from_password(" \t ").is_none());
    assert!(Cipher::from_password(" x ").is_some());
}

// ============================================================================
// PACKET EDGE CASES
// ============================================================================

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Position {
    x: i32,
    y: i32,
}

#[test]
fn test_application_decode_as_other_kind() {
    let app = ApplicationPacket::encode("position", &Position { x: 3, y: -4 }).unwrap();
    assert!(app.decode_as::<Position>("velocity").is_none());
    assert_eq!(
        app.decode_as::<Position>("position").unwrap().unwrap(),
        Position { x: 3, y: -4 }
    );
}

#[test]
fn test_application_truncated_body() {
    let app = ApplicationPacket::new("position", vec![1, 2]);
    assert!(app.decode::<Position>().is_err());
}

#[test]
fn test_unicode_text_roundtrip() {
    let packet = Packet::text("héllo wörld 🌍 \u{0}");
    let frame = encode_packet(&packet, None).unwrap();
    assert_eq!(decode_packet(frame, None).unwrap(), packet);
}

#[test]
fn test_internal_error_packet() {
    let packet = Packet::error("boom");
    assert!(packet.is_internal());
    assert!(!packet.is_ping());
    assert_eq!(packet, Packet::Internal(InternalPacket::Error("boom".into())));
}

#[test]
fn test_stream_packet_equality_ignores_source() {
    let a = StreamPacket::from_bytes(vec![1, 2, 3]);
    let b = StreamPacket::from_bytes(vec![9, 9, 9]);
    assert_eq!(a, b);
    b.release_source();
    assert_eq!(a, b);
    assert!(a.has_source());
    assert!(!b.has_source());
}

// ============================================================================
// IDLE SESSION EDGE CASES
// ============================================================================

fn idle_client() -> Session {
    Session::builder(
        Mode::client("127.0.0.1:1", "", Duration::from_secs(60)),
        Arc::new(NoopHandler),
    )
    .config(SessionConfig::default())
    .build()
}

#[tokio::test]
async fn test_enqueue_on_unconnected_session_releases_stream() {
    let session = idle_client();
    let stream = StreamPacket::from_bytes(vec![0u8; 10]);

    assert!(!session.enqueue_packet(stream.clone()));
    assert!(!stream.has_source());
    assert_eq!(session.queue_len(), 0);
}

#[tokio::test]
async fn test_stop_without_start_is_harmless() {
    let session = idle_client();
    if let Some(handle) = session.stop_with(false, false) {
        handle.await.unwrap();
    }
    assert!(!session.is_running());
    assert!(!session.is_stopping());
    session.force_disconnect();
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_session_ids_are_unique() {
    let a = idle_client();
    let b = idle_client();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.id(), a.clone().id());
}

#[tokio::test]
async fn test_set_target_only_for_clients() {
    let session = idle_client();
    assert!(session.mode().set_target("127.0.0.1:2"));
    assert_eq!(session.mode().target().as_deref(), Some("127.0.0.1:2"));
}

// ============================================================================
// METRICS EDGE CASES
// ============================================================================

#[test]
fn test_connection_gauge_never_underflows() {
    let metrics = Metrics::new();
    metrics.connection_closed();
    metrics.connection_closed();
    assert_eq!(metrics.snapshot().connections_active, 0);

    metrics.connection_established();
    metrics.connection_closed();
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.connections_active, 0);
    assert_eq!(snapshot.connections_total, 1);
}
