#![no_main]

use libfuzzer_sys::fuzz_target;
use socket_factory::protocol::websocket::{decode_frame, handshake_response, Decoded};

fuzz_target!(|data: &[u8]| {
    let _ = handshake_response(data);

    let mut buf = data.to_vec();
    // keep decoding until the buffer stops shrinking
    while let Ok(Decoded::Packet(_)) = decode_frame(&mut buf) {}
});
