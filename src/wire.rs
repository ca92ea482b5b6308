//! Line-oriented text protocol spoken by speedtest.net measurement servers.
//!
//! ```text
//! client -> server   PING <unix-nanos>\n
//! server -> client   short acknowledgement, read as up to 40 raw bytes
//!
//! client -> server   DOWNLOAD <frame-size>\n
//! server -> client   up to <frame-size> bytes of payload
//!
//! client -> server   UPLOAD <frame-size> 0\n111...1\n   (exactly <frame-size> bytes)
//! server -> client   OK <acked-bytes> <server-ts>\n
//! ```

use bytes::Bytes;

/// Payload bytes carried by one full-size Ethernet TCP segment.
pub const SEGMENT_PAYLOAD: u64 = 1460;

/// Ethernet (14) + IPv4 (20) + TCP (20) header bytes per segment.
pub const SEGMENT_OVERHEAD: u64 = 54;

/// Bytes read for one ping acknowledgement.
pub const PING_REPLY_LEN: usize = 40;

/// Buffer size for one upload acknowledgement line.
pub const UPLOAD_REPLY_LEN: usize = 64;

/// Smallest frame that still fits the upload header and trailing newline.
pub const MIN_FRAME_SIZE: usize = 64;

/// Link-layer bytes not visible in a payload count of `payload` bytes.
///
/// One overhead unit per full or partial 1460-byte segment.
pub fn framing_overhead(payload: u64) -> u64 {
    payload.div_ceil(SEGMENT_PAYLOAD) * SEGMENT_OVERHEAD
}

pub fn ping_line(unix_nanos: u128) -> String {
    format!("PING {}\n", unix_nanos)
}

pub fn download_request(frame_size: usize) -> String {
    format!("DOWNLOAD {}\n", frame_size)
}

/// Build one upload frame of exactly `frame_size` bytes.
///
/// `frame_size` must be at least [`MIN_FRAME_SIZE`]; smaller values produce
/// a frame holding just the header line.
pub fn upload_frame(frame_size: usize) -> Bytes {
    let header = format!("UPLOAD {} 0\n", frame_size);
    let filler = frame_size.saturating_sub(header.len() + 1);

    let mut frame = Vec::with_capacity(header.len() + filler + 1);
    frame.extend_from_slice(header.as_bytes());
    frame.resize(header.len() + filler, b'1');
    frame.push(b'\n');
    Bytes::from(frame)
}

/// Byte count the server acknowledged: the second whitespace-separated token.
///
/// Returns `None` for anything that does not carry an integer there.
pub fn parse_upload_ack(reply: &[u8]) -> Option<u64> {
    std::str::from_utf8(reply)
        .ok()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
