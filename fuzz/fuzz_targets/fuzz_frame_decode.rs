#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use msgpipe::core::codec::{decode_frame, FrameCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary peer bytes: must never panic or over-allocate
    let _ = decode_frame(data, 64 * 1024);

    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
