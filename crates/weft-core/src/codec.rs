//! Frame encoders and field accessors.
//!
//! Encoders build complete frames (header plus body) into a single owned
//! buffer. Encoders that take a [`Payload`] consume it: the payload's buffers
//! are copied into the frame and released on every path, success or failure.
//! Accessors return sub-slices of the frame buffer (refcount bumps, no copy)
//! and never move an observable cursor.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, Error};
use crate::frame::{
    Flags, FrameType, FRAME_HEADER_SIZE, FRAME_LENGTH_MASK, FRAME_LENGTH_SIZE, MAX_STREAM_ID,
    METADATA_LENGTH_SIZE,
};
use crate::payload::Payload;

/// A decoded or freshly encoded frame backed by one contiguous buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    buf: Bytes,
    ty: FrameType,
}

fn put_u24(buf: &mut BytesMut, value: usize) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

fn get_u24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
}

/// Demand is carried as a signed 32-bit field; anything at or above
/// `i32::MAX` means unbounded.
pub(crate) fn clamp_request_n(n: u64) -> u32 {
    n.min(i32::MAX as u64) as u32
}

fn saturate_request_n(raw: u32) -> u64 {
    if raw >= i32::MAX as u32 {
        u64::MAX
    } else {
        u64::from(raw)
    }
}

/// Bytes between the header and the metadata/data section, per type.
fn body_prefix_len(ty: FrameType) -> usize {
    match ty {
        FrameType::RequestStream | FrameType::RequestChannel => 4,
        FrameType::RequestN | FrameType::Error => 4,
        FrameType::Keepalive | FrameType::Lease => 8,
        _ => 0,
    }
}

/// Types whose metadata section carries a 24-bit length prefix.
/// METADATA_PUSH and LEASE metadata span the remainder of the frame instead.
fn metadata_is_length_prefixed(ty: FrameType) -> bool {
    matches!(
        ty,
        FrameType::RequestResponse
            | FrameType::RequestFnf
            | FrameType::RequestStream
            | FrameType::RequestChannel
            | FrameType::Payload
    )
}

fn header(stream_id: u32, ty: FrameType, flags: Flags, body_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body_len);
    buf.put_u32(stream_id & MAX_STREAM_ID);
    buf.put_u16((u16::from(ty.encoded()) << 10) | flags.bits());
    buf
}

fn encode_with_payload(
    stream_id: u32,
    ty: FrameType,
    base_flags: Flags,
    initial_request_n: Option<u32>,
    payload: Payload,
) -> Frame {
    let (data, metadata) = payload.into_parts();
    let mut flags = base_flags;
    let mut body_len = initial_request_n.map_or(0, |_| 4) + data.len();
    if let Some(md) = &metadata {
        flags |= Flags::METADATA;
        body_len += METADATA_LENGTH_SIZE + md.len();
    }
    let mut buf = header(stream_id, ty, flags, body_len);
    if let Some(n) = initial_request_n {
        buf.put_u32(n);
    }
    if let Some(md) = metadata {
        put_u24(&mut buf, md.len());
        buf.put_slice(&md);
    }
    buf.put_slice(&data);
    Frame {
        buf: buf.freeze(),
        ty,
    }
}

pub fn encode_request_response(stream_id: u32, payload: Payload) -> Frame {
    encode_with_payload(
        stream_id,
        FrameType::RequestResponse,
        Flags::empty(),
        None,
        payload,
    )
}

pub fn encode_request_fnf(stream_id: u32, payload: Payload) -> Frame {
    encode_with_payload(
        stream_id,
        FrameType::RequestFnf,
        Flags::empty(),
        None,
        payload,
    )
}

pub fn encode_request_stream(stream_id: u32, initial_request_n: u64, payload: Payload) -> Frame {
    encode_with_payload(
        stream_id,
        FrameType::RequestStream,
        Flags::empty(),
        Some(clamp_request_n(initial_request_n)),
        payload,
    )
}

pub fn encode_request_channel(stream_id: u32, initial_request_n: u64, payload: Payload) -> Frame {
    encode_with_payload(
        stream_id,
        FrameType::RequestChannel,
        Flags::empty(),
        Some(clamp_request_n(initial_request_n)),
        payload,
    )
}

pub fn encode_payload_next(stream_id: u32, payload: Payload) -> Frame {
    encode_with_payload(stream_id, FrameType::Payload, Flags::NEXT, None, payload)
}

pub fn encode_payload_next_complete(stream_id: u32, payload: Payload) -> Frame {
    encode_with_payload(
        stream_id,
        FrameType::Payload,
        Flags::NEXT | Flags::COMPLETE,
        None,
        payload,
    )
}

pub fn encode_payload_complete(stream_id: u32) -> Frame {
    let buf = header(stream_id, FrameType::Payload, Flags::COMPLETE, 0);
    Frame {
        buf: buf.freeze(),
        ty: FrameType::Payload,
    }
}

pub fn encode_request_n(stream_id: u32, n: u64) -> Frame {
    let mut buf = header(stream_id, FrameType::RequestN, Flags::empty(), 4);
    buf.put_u32(clamp_request_n(n));
    Frame {
        buf: buf.freeze(),
        ty: FrameType::RequestN,
    }
}

pub fn encode_cancel(stream_id: u32) -> Frame {
    let buf = header(stream_id, FrameType::Cancel, Flags::empty(), 0);
    Frame {
        buf: buf.freeze(),
        ty: FrameType::Cancel,
    }
}

pub fn encode_error(stream_id: u32, error: &Error) -> Frame {
    let message = error.wire_message();
    let mut buf = header(
        stream_id,
        FrameType::Error,
        Flags::empty(),
        4 + message.len(),
    );
    buf.put_u32(error.error_code());
    buf.put_slice(message.as_bytes());
    Frame {
        buf: buf.freeze(),
        ty: FrameType::Error,
    }
}

/// METADATA_PUSH: the metadata spans the remainder of the frame, no length
/// prefix, always on stream 0.
pub fn encode_metadata_push(metadata: Bytes) -> Frame {
    let mut buf = header(0, FrameType::MetadataPush, Flags::METADATA, metadata.len());
    buf.put_slice(&metadata);
    Frame {
        buf: buf.freeze(),
        ty: FrameType::MetadataPush,
    }
}

pub fn encode_keepalive(respond: bool, last_received_position: u64, data: Bytes) -> Frame {
    let flags = if respond {
        Flags::RESPOND
    } else {
        Flags::empty()
    };
    let mut buf = header(0, FrameType::Keepalive, flags, 8 + data.len());
    buf.put_u64(last_received_position);
    buf.put_slice(&data);
    Frame {
        buf: buf.freeze(),
        ty: FrameType::Keepalive,
    }
}

pub fn encode_lease(ttl_millis: u32, number_of_requests: u32, metadata: Option<Bytes>) -> Frame {
    let mut flags = Flags::empty();
    let md_len = metadata.as_ref().map_or(0, Bytes::len);
    if metadata.is_some() {
        flags |= Flags::METADATA;
    }
    let mut buf = header(0, FrameType::Lease, flags, 8 + md_len);
    buf.put_u32(ttl_millis);
    buf.put_u32(number_of_requests);
    if let Some(md) = metadata {
        buf.put_slice(&md);
    }
    Frame {
        buf: buf.freeze(),
        ty: FrameType::Lease,
    }
}

impl Frame {
    /// Parse a complete frame (no length prefix). Validates the header and
    /// the per-type body bounds so that accessors never fall off the buffer.
    pub fn parse(buf: Bytes) -> Result<Frame, DecodeError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof {
                needed: FRAME_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let word = u16::from_be_bytes([buf[4], buf[5]]);
        let raw_type = (word >> 10) as u8;
        let ty = FrameType::from_encoded(raw_type).ok_or(DecodeError::UnknownFrameType(raw_type))?;
        let min_len = FRAME_HEADER_SIZE + body_prefix_len(ty);
        if buf.len() < min_len {
            return Err(DecodeError::UnexpectedEof {
                needed: min_len,
                available: buf.len(),
            });
        }
        let frame = Frame { buf, ty };
        if frame.flags().contains(Flags::METADATA) && metadata_is_length_prefixed(ty) {
            let off = min_len;
            if frame.buf.len() < off + METADATA_LENGTH_SIZE {
                return Err(DecodeError::UnexpectedEof {
                    needed: off + METADATA_LENGTH_SIZE,
                    available: frame.buf.len(),
                });
            }
            let md_len = get_u24(&frame.buf[off..]);
            if frame.buf.len() < off + METADATA_LENGTH_SIZE + md_len {
                return Err(DecodeError::UnexpectedEof {
                    needed: off + METADATA_LENGTH_SIZE + md_len,
                    available: frame.buf.len(),
                });
            }
        }
        Ok(frame)
    }

    pub fn stream_id(&self) -> u32 {
        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) & MAX_STREAM_ID
    }

    pub fn frame_type(&self) -> FrameType {
        self.ty
    }

    pub fn flags(&self) -> Flags {
        let word = u16::from_be_bytes([self.buf[4], self.buf[5]]);
        Flags::from_bits_truncate(word & 0x3FF)
    }

    pub fn has_metadata(&self) -> bool {
        self.flags().contains(Flags::METADATA)
    }

    /// Offset of the metadata/data section.
    fn payload_section(&self) -> usize {
        FRAME_HEADER_SIZE + body_prefix_len(self.ty)
    }

    /// The metadata section, if the METADATA flag is set. An empty slice is
    /// a present-but-empty metadata section, distinct from `None`.
    pub fn metadata(&self) -> Option<Bytes> {
        if !self.has_metadata() || !self.ty.supports_metadata() {
            return None;
        }
        if !metadata_is_length_prefixed(self.ty) {
            return Some(self.buf.slice(self.payload_section()..));
        }
        let off = self.payload_section();
        let len = get_u24(&self.buf[off..]);
        Some(self.buf.slice(off + METADATA_LENGTH_SIZE..off + METADATA_LENGTH_SIZE + len))
    }

    /// The data section (everything after the metadata, if any).
    pub fn data(&self) -> Bytes {
        if self.ty == FrameType::MetadataPush {
            return Bytes::new();
        }
        let mut off = self.payload_section();
        if self.has_metadata() && metadata_is_length_prefixed(self.ty) {
            off += METADATA_LENGTH_SIZE + get_u24(&self.buf[off..]);
        }
        self.buf.slice(off.min(self.buf.len())..)
    }

    /// Rebuild a payload from a payload-carrying frame.
    pub fn decode_payload(&self) -> Payload {
        match self.metadata() {
            Some(md) => Payload::with_metadata(self.data(), md),
            None => Payload::new(self.data()),
        }
    }

    /// REQUEST_STREAM / REQUEST_CHANNEL initial demand, saturating to
    /// `u64::MAX` when the wire value is `i32::MAX`.
    pub fn initial_request_n(&self) -> u64 {
        self.request_n()
    }

    /// REQUEST_N demand, with the same saturation rule.
    pub fn request_n(&self) -> u64 {
        let b = &self.buf[FRAME_HEADER_SIZE..];
        saturate_request_n(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn error_code(&self) -> u32 {
        let b = &self.buf[FRAME_HEADER_SIZE..];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.buf[FRAME_HEADER_SIZE + 4..]).into_owned()
    }

    pub fn decode_error(&self) -> Error {
        Error::from_wire(self.error_code(), self.error_message())
    }

    pub fn keepalive_respond(&self) -> bool {
        self.flags().contains(Flags::RESPOND)
    }

    pub fn keepalive_last_position(&self) -> u64 {
        let b = &self.buf[FRAME_HEADER_SIZE..];
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn lease_ttl_millis(&self) -> u32 {
        let b = &self.buf[FRAME_HEADER_SIZE..];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn lease_number_of_requests(&self) -> u32 {
        let b = &self.buf[FRAME_HEADER_SIZE + 4..];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf
    }
}

/// Prefix a frame with its 24-bit length, for byte-stream transports.
pub fn encode_length_prefixed(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_LENGTH_SIZE + frame.len());
    put_u24(&mut buf, frame.len() & FRAME_LENGTH_MASK);
    buf.put_slice(frame.as_bytes());
    buf.freeze()
}

/// Incrementally split one length-prefixed frame off a read buffer.
/// Returns `Ok(None)` until a complete frame is buffered.
pub fn decode_length_prefixed(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
    if buf.len() < FRAME_LENGTH_SIZE {
        return Ok(None);
    }
    let frame_len = get_u24(buf);
    if buf.len() < FRAME_LENGTH_SIZE + frame_len {
        return Ok(None);
    }
    let mut chunk = buf.split_to(FRAME_LENGTH_SIZE + frame_len);
    let frame = chunk.split_off(FRAME_LENGTH_SIZE);
    Frame::parse(frame.freeze()).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn request_stream_wire_bytes() {
        let frame = encode_request_stream(1, 1, Payload::with_metadata("d", "md"));
        assert_eq!(
            hex(&encode_length_prefixed(&frame)),
            "000010000000011900000000010000026d6464"
        );
    }

    #[test]
    fn request_stream_wire_bytes_empty_metadata() {
        let frame = encode_request_stream(1, 1, Payload::with_metadata("d", ""));
        assert_eq!(
            hex(&encode_length_prefixed(&frame)),
            "00000e0000000119000000000100000064"
        );
    }

    #[test]
    fn request_stream_wire_bytes_no_metadata() {
        let frame = encode_request_stream(1, 1, Payload::new("d"));
        assert_eq!(
            hex(&encode_length_prefixed(&frame)),
            "00000b0000000118000000000164"
        );
    }

    #[test]
    fn request_response_data_and_metadata() {
        let frame = encode_request_response(1, Payload::with_metadata("d", "md"));
        assert!(frame.has_metadata());
        assert_eq!(frame.data().as_ref(), b"d");
        assert_eq!(frame.metadata().as_deref(), Some(b"md".as_ref()));
    }

    #[test]
    fn request_response_data_only() {
        let frame = encode_request_response(1, Payload::new("d"));
        assert!(!frame.has_metadata());
        assert_eq!(frame.data().as_ref(), b"d");
        assert_eq!(frame.metadata(), None);
    }

    #[test]
    fn request_response_metadata_only() {
        let frame = encode_request_response(1, Payload::with_metadata("", "md"));
        assert!(frame.has_metadata());
        assert!(frame.data().is_empty());
        assert_eq!(frame.metadata().as_deref(), Some(b"md".as_ref()));
    }

    #[test]
    fn fnf_round_trip() {
        let frame = encode_request_fnf(3, Payload::with_metadata("d", "md"));
        assert_eq!(frame.frame_type(), FrameType::RequestFnf);
        assert_eq!(frame.stream_id(), 3);
        let payload = frame.decode_payload();
        assert_eq!(payload.data().as_ref(), b"d");
        assert_eq!(payload.metadata().map(|m| m.as_ref()), Some(b"md".as_ref()));
    }

    #[test]
    fn initial_request_n_saturates() {
        let frame = encode_request_stream(1, i32::MAX as u64 + 1, Payload::new("d"));
        assert_eq!(frame.initial_request_n(), u64::MAX);

        let frame = encode_request_stream(1, 42, Payload::new("d"));
        assert_eq!(frame.initial_request_n(), 42);
    }

    #[test]
    fn request_channel_carries_initial_n() {
        let frame = encode_request_channel(5, 7, Payload::with_metadata("d", "md"));
        assert_eq!(frame.frame_type(), FrameType::RequestChannel);
        assert_eq!(frame.initial_request_n(), 7);
        assert_eq!(frame.data().as_ref(), b"d");
        assert_eq!(frame.metadata().as_deref(), Some(b"md".as_ref()));
    }

    #[test]
    fn request_n_round_trip() {
        let frame = encode_request_n(9, 128);
        assert_eq!(frame.frame_type(), FrameType::RequestN);
        assert_eq!(frame.request_n(), 128);

        let unbounded = encode_request_n(9, u64::MAX);
        assert_eq!(unbounded.request_n(), u64::MAX);
    }

    #[test]
    fn error_round_trip() {
        let frame = encode_error(7, &Error::Application("boom".into()));
        assert_eq!(frame.stream_id(), 7);
        assert_eq!(frame.error_code(), crate::error::code::APPLICATION_ERROR);
        assert!(matches!(frame.decode_error(), Error::Application(m) if m == "boom"));

        let frame = encode_error(
            7,
            &Error::Custom {
                code: 0x501,
                message: "custom".into(),
            },
        );
        assert!(
            matches!(frame.decode_error(), Error::Custom { code, message } if code == 0x501 && message == "custom")
        );
    }

    #[test]
    fn cancel_is_header_only() {
        let frame = encode_cancel(11);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE);
        assert_eq!(frame.frame_type(), FrameType::Cancel);
        assert_eq!(frame.stream_id(), 11);
    }

    #[test]
    fn metadata_push_spans_remainder() {
        let frame = encode_metadata_push(Bytes::from_static(b"md"));
        assert_eq!(frame.stream_id(), 0);
        assert_eq!(frame.metadata().as_deref(), Some(b"md".as_ref()));
        assert!(frame.data().is_empty());
        let payload = frame.decode_payload();
        assert!(payload.data().is_empty());
        assert_eq!(payload.metadata().map(|m| m.as_ref()), Some(b"md".as_ref()));
    }

    #[test]
    fn keepalive_round_trip() {
        let frame = encode_keepalive(true, 42, Bytes::from_static(b"ka"));
        assert!(frame.keepalive_respond());
        assert_eq!(frame.keepalive_last_position(), 42);
        assert_eq!(frame.data().as_ref(), b"ka");

        let frame = encode_keepalive(false, 0, Bytes::new());
        assert!(!frame.keepalive_respond());
    }

    #[test]
    fn lease_round_trip() {
        let frame = encode_lease(30_000, 5, None);
        assert_eq!(frame.lease_ttl_millis(), 30_000);
        assert_eq!(frame.lease_number_of_requests(), 5);
        assert_eq!(frame.metadata(), None);
    }

    #[test]
    fn parse_rejects_truncated_and_unknown() {
        assert!(matches!(
            Frame::parse(Bytes::from_static(&[0, 0, 0, 1])),
            Err(DecodeError::UnexpectedEof { .. })
        ));
        // type bits 0x3E is unassigned
        let buf = Bytes::from_static(&[0, 0, 0, 1, 0xF8, 0x00]);
        assert!(matches!(
            Frame::parse(buf),
            Err(DecodeError::UnknownFrameType(0x3E))
        ));
        // REQUEST_N with a truncated body
        let buf = Bytes::from_static(&[0, 0, 0, 1, 0x20, 0x00, 0, 0]);
        assert!(matches!(
            Frame::parse(buf),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn parse_round_trips_encoded_frames() {
        let original = encode_request_channel(21, 3, Payload::with_metadata("data", "meta"));
        let parsed = Frame::parse(original.clone().into_bytes()).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.initial_request_n(), 3);
        assert_eq!(parsed.data().as_ref(), b"data");
    }

    #[test]
    fn length_prefixed_incremental_decode() {
        let frame = encode_payload_next(1, Payload::new("abc"));
        let wire = encode_length_prefixed(&frame);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..4]);
        assert_eq!(decode_length_prefixed(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[4..]);
        let decoded = decode_length_prefixed(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn payload_terminal_flags() {
        let next = encode_payload_next(1, Payload::new("x"));
        assert!(next.flags().contains(Flags::NEXT));
        assert!(!next.flags().contains(Flags::COMPLETE));

        let complete = encode_payload_complete(1);
        assert!(complete.flags().contains(Flags::COMPLETE));
        assert!(!complete.flags().contains(Flags::NEXT));

        let both = encode_payload_next_complete(1, Payload::new("x"));
        assert!(both.flags().contains(Flags::NEXT | Flags::COMPLETE));
    }
}
