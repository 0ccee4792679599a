// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::packet::Packet;
use crate::error::SessionError;
use crate::protocol::websocket::*;
use crate::protocol::{factory, Protocol, ProtocolHost, SendOutcome};
use std::sync::Mutex;
use std::time::Duration;

const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
Host: example\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

#[derive(Default)]
struct RecordingHost {
    logged: Mutex<Vec<String>>,
}

impl RecordingHost {
    fn logged(&self) -> Vec<String> {
        self.logged.lock().unwrap().clone()
    }
}

impl ProtocolHost for RecordingHost {
    fn session_id(&self) -> u64 {
        7
    }

    fn log_exception(&self, message: &str) {
        self.logged.lock().unwrap().push(message.to_string());
    }
}

/// Drive a fresh protocol through the upgrade so frames flow both ways
fn upgraded(host: &RecordingHost) -> WebSocketProtocol {
    let mut ws = WebSocketProtocol::new();
    assert!(ws.on_receive_data(host, UPGRADE_REQUEST.as_bytes()).unwrap().is_none());
    let outcome = ws.on_send_packet(host, &Packet::ping()).unwrap();
    assert!(outcome.write.is_some());
    assert_eq!(ws.state(), HandshakeState::Sent);
    ws
}

#[test]
fn test_accept_key_known_value() {
    assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[test]
fn test_upgrade_handshake_flow() {
    let host = RecordingHost::default();
    let mut ws = WebSocketProtocol::new();

    // Nothing is written before the upgrade request arrives
    let before = ws.on_send_packet(&host, &Packet::text("early")).unwrap();
    assert_eq!(before, SendOutcome::retain());

    assert!(ws.on_receive_data(&host, UPGRADE_REQUEST.as_bytes()).unwrap().is_none());
    assert_eq!(ws.state(), HandshakeState::PreSend);

    let outcome = ws.on_send_packet(&host, &Packet::text("early")).unwrap();
    assert!(!outcome.remove_packet, "queued packet must survive the handshake write");
    let response = String::from_utf8(outcome.write.unwrap()).unwrap();
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
    assert_eq!(ws.state(), HandshakeState::Sent);

    // The retained packet now goes out as a text frame
    let outcome = ws.on_send_packet(&host, &Packet::text("early")).unwrap();
    assert!(outcome.remove_packet);
    assert_eq!(outcome.write.unwrap(), encode_frame(&Packet::text("early")).unwrap());

    let frame = encode_masked_frame(&Packet::text("hi"), [1, 2, 3, 4]).unwrap();
    let received = ws.on_receive_data(&host, &frame).unwrap();
    assert_eq!(received, Some(Packet::text("hi")));
    assert_eq!(ws.state(), HandshakeState::Finished);
}

#[test]
fn test_upgrade_request_split_across_reads() {
    let host = RecordingHost::default();
    let mut ws = WebSocketProtocol::new();
    let (head, tail) = UPGRADE_REQUEST.split_at(20);

    assert!(ws.on_receive_data(&host, head.as_bytes()).unwrap().is_none());
    assert_eq!(ws.state(), HandshakeState::None);
    assert!(ws.on_receive_data(&host, tail.as_bytes()).unwrap().is_none());
    assert_eq!(ws.state(), HandshakeState::PreSend);
}

#[test]
fn test_header_name_is_case_insensitive() {
    let request = "GET / HTTP/1.1\r\nsec-websocket-key:   dGhlIHNhbXBsZSBub25jZQ==  \r\n\r\n";
    let response = String::from_utf8(handshake_response(request.as_bytes()).unwrap()).unwrap();
    assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
}

#[test]
fn test_non_get_request_is_ignored() {
    let request = "POST / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n";
    assert!(handshake_response(request.as_bytes()).is_none());
    assert!(handshake_response(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_none());
}

#[test]
fn test_frame_lengths_round_trip() {
    for size in [0usize, 1, 125, 126, 65535] {
        let packet = Packet::binary(vec![0xAB; size]);

        let mut plain = encode_frame(&packet).unwrap();
        let header = if size <= 125 { 2 } else { 4 };
        assert_eq!(plain.len(), header + size, "size {size}");
        assert_eq!(plain[0], 0x80 | OPCODE_BINARY);
        assert_eq!(decode_frame(&mut plain).unwrap(), Decoded::Packet(packet.clone()));
        assert!(plain.is_empty());

        let mut masked = encode_masked_frame(&packet, [9, 8, 7, 6]).unwrap();
        assert_eq!(masked.len(), header + 4 + size);
        assert_eq!(decode_frame(&mut masked).unwrap(), Decoded::Packet(packet));
    }
}

#[test]
fn test_payload_over_limit_is_rejected() {
    let err = encode_frame(&Packet::binary(vec![0; 65536])).unwrap_err();
    assert!(matches!(err, SessionError::OversizedPacket(65536)));
}

#[test]
fn test_oversized_send_drops_packet_and_logs() {
    let host = RecordingHost::default();
    let mut ws = upgraded(&host);

    let outcome = ws.on_send_packet(&host, &Packet::binary(vec![0; 70_000])).unwrap();
    assert_eq!(outcome, SendOutcome::remove());
    assert_eq!(host.logged().len(), 1);
}

#[test]
fn test_ping_frame_has_empty_payload() {
    let frame = encode_frame(&Packet::ping()).unwrap();
    assert_eq!(frame, vec![0x80 | OPCODE_PING, 0]);
}

#[test]
fn test_pong_decodes_as_ping() {
    let mut buf = vec![0x80 | OPCODE_PONG, 0];
    assert_eq!(decode_frame(&mut buf).unwrap(), Decoded::Packet(Packet::ping()));
}

#[test]
fn test_partial_frame_is_not_consumed() {
    let full = encode_masked_frame(&Packet::text("partial frame"), [1, 1, 1, 1]).unwrap();
    let mut buf = full[..full.len() - 3].to_vec();
    let snapshot = buf.clone();

    assert_eq!(decode_frame(&mut buf).unwrap(), Decoded::Incomplete);
    assert_eq!(buf, snapshot);

    buf.extend_from_slice(&full[full.len() - 3..]);
    assert_eq!(decode_frame(&mut buf).unwrap(), Decoded::Packet(Packet::text("partial frame")));
}

#[test]
fn test_two_frames_in_one_read_decode_one_at_a_time() {
    let host = RecordingHost::default();
    let mut ws = upgraded(&host);

    let mut bytes = encode_masked_frame(&Packet::text("one"), [5, 5, 5, 5]).unwrap();
    bytes.extend(encode_masked_frame(&Packet::text("two"), [6, 6, 6, 6]).unwrap());

    assert_eq!(ws.on_receive_data(&host, &bytes).unwrap(), Some(Packet::text("one")));
    assert_eq!(ws.on_receive_data(&host, &[]).unwrap(), Some(Packet::text("two")));
    assert_eq!(ws.on_receive_data(&host, &[]).unwrap(), None);
}

#[test]
fn test_close_frame_stops_decoding() {
    let host = RecordingHost::default();
    let mut ws = upgraded(&host);

    let mut bytes = vec![0x80 | OPCODE_CLOSE, 0];
    bytes.extend(encode_frame(&Packet::text("after close")).unwrap());

    assert_eq!(ws.on_receive_data(&host, &bytes).unwrap(), None);
    assert_eq!(ws.buffered(), 0);
}

#[test]
fn test_unsupported_opcode_is_logged_and_discarded() {
    let host = RecordingHost::default();
    let mut ws = upgraded(&host);

    assert_eq!(ws.on_receive_data(&host, &[0x83, 0]).unwrap(), None);
    assert_eq!(ws.buffered(), 0);
    assert_eq!(host.logged(), vec!["Opcode not supported: 3".to_string()]);
}

#[test]
fn test_64_bit_length_is_an_error() {
    let mut buf = vec![0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0];
    assert!(matches!(
        decode_frame(&mut buf),
        Err(SessionError::OversizedPacket(65536))
    ));
}

#[test]
fn test_handshake_timeout_without_client_frame() {
    let host = RecordingHost::default();
    let mut ws = WebSocketProtocol::new().with_handshake_timeout(Duration::from_millis(10));
    ws.on_receive_data(&host, UPGRADE_REQUEST.as_bytes()).unwrap();
    ws.on_send_packet(&host, &Packet::ping()).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert!(matches!(
        ws.on_receive_data(&host, &[]),
        Err(SessionError::HandshakeTimeout)
    ));
}

#[test]
fn test_disconnect_resets_state() {
    let host = RecordingHost::default();
    let mut ws = upgraded(&host);
    ws.on_receive_data(&host, &[0x81]).unwrap();
    assert_eq!(ws.buffered(), 1);

    ws.on_disconnect(&host);
    assert_eq!(ws.state(), HandshakeState::None);
    assert_eq!(ws.buffered(), 0);
}

#[test]
fn test_non_text_packets_are_sent_as_json() {
    let packet = Packet::error("bad things");
    let mut frame = encode_frame(&packet).unwrap();
    assert_eq!(frame[0], 0x80 | OPCODE_TEXT);

    match decode_frame(&mut frame).unwrap() {
        Decoded::Packet(Packet::Text(json)) => {
            let back: Packet = serde_json::from_str(&json).unwrap();
            assert_eq!(back, packet);
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[test]
fn test_text_packets_are_sent_as_json() {
    let mut frame = encode_frame(&Packet::text("hello")).unwrap();
    assert_eq!(frame[0], 0x80 | OPCODE_TEXT);

    match decode_frame(&mut frame).unwrap() {
        Decoded::Packet(Packet::Text(json)) => {
            assert_ne!(json, "hello");
            let back: Packet = serde_json::from_str(&json).unwrap();
            assert_eq!(back, Packet::text("hello"));
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[test]
fn test_client_text_arrives_raw() {
    let mut frame = encode_masked_frame(&Packet::text("hello"), [3, 1, 4, 1]).unwrap();
    assert_eq!(decode_frame(&mut frame).unwrap(), Decoded::Packet(Packet::text("hello")));
}

#[test]
fn test_pending_write_only_while_response_waits() {
    let host = RecordingHost::default();
    let mut ws = WebSocketProtocol::new();
    assert!(!ws.has_pending_write());

    ws.on_receive_data(&host, UPGRADE_REQUEST.as_bytes()).unwrap();
    assert!(ws.has_pending_write());

    ws.on_send_packet(&host, &Packet::ping()).unwrap();
    assert!(!ws.has_pending_write());
}

#[test]
fn test_factory_builds_independent_instances() {
    let make = factory::<WebSocketProtocol>();
    let host = RecordingHost::default();

    let mut first = make();
    first.on_receive_data(&host, UPGRADE_REQUEST.as_bytes()).unwrap();
    let mut second = make();

    assert_eq!(second.on_send_packet(&host, &Packet::ping()).unwrap(), SendOutcome::retain());
    assert!(first.on_send_packet(&host, &Packet::ping()).unwrap().write.is_some());
}
