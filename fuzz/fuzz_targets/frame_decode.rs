#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use socket_factory::core::codec::{decode_packet, Frame, PacketCodec};
use socket_factory::crypto::Cipher;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let _ = Frame::from_bytes(data);

    let mut buf = BytesMut::from(data);
    if let Ok(Some(frame)) = PacketCodec.decode(&mut buf) {
        let _ = decode_packet(frame.clone(), None);
        if let Some(cipher) = Cipher::from_password("fuzz") {
            let _ = decode_packet(frame, Some(&cipher));
        }
    }
});
