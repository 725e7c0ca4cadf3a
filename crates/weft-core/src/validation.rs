//! Payload size validation.

use crate::frame::{FRAME_HEADER_SIZE, FRAME_LENGTH_MASK, METADATA_LENGTH_SIZE};
use crate::payload::Payload;

pub const PAYLOAD_TOO_LARGE_MESSAGE: &str =
    "payload exceeds the 16,777,215 byte single-frame limit and fragmentation is disabled";

/// Whether a payload may be submitted for the given MTU.
///
/// With `mtu == 0` fragmentation is disabled and the payload must fit a
/// single frame: data plus metadata (plus its length prefix when present)
/// plus the frame header within the 24-bit frame length. With `mtu > 0` the
/// payload is always accepted; oversized frames are split downstream.
pub fn is_valid(mtu: usize, payload: &Payload) -> bool {
    if mtu > 0 {
        return true;
    }
    let metadata_len = match payload.metadata() {
        Some(md) => METADATA_LENGTH_SIZE + md.len(),
        None => 0,
    };
    FRAME_HEADER_SIZE + metadata_len + payload.data().len() <= FRAME_LENGTH_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn small_payload_is_valid() {
        assert!(is_valid(0, &Payload::with_metadata("d", "md")));
        assert!(is_valid(0, &Payload::empty()));
    }

    #[test]
    fn boundary_fit() {
        let data = Bytes::from(vec![0u8; FRAME_LENGTH_MASK - FRAME_HEADER_SIZE]);
        assert!(is_valid(0, &Payload::new(data.clone())));

        let over = Bytes::from(vec![0u8; FRAME_LENGTH_MASK - FRAME_HEADER_SIZE + 1]);
        assert!(!is_valid(0, &Payload::new(over)));
    }

    #[test]
    fn metadata_and_its_length_prefix_count() {
        let data = Bytes::from(vec![0u8; FRAME_LENGTH_MASK - FRAME_HEADER_SIZE]);
        // same data with any metadata overflows because of the 3-byte prefix
        assert!(!is_valid(0, &Payload::with_metadata(data, "")));
    }

    #[test]
    fn any_payload_is_valid_with_fragmentation() {
        let data = Bytes::from(vec![0u8; FRAME_LENGTH_MASK + 1]);
        assert!(is_valid(64, &Payload::new(data)));
    }
}
