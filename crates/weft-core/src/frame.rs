//! Frame header layout: stream id, frame type, flags.
//!
//! A frame is a 6-byte header followed by a type-specific body:
//!
//! ```text
//! 0               4       6
//! +---------------+-------+----------------------+
//! | stream id u31 | T | F | body...              |
//! +---------------+-------+----------------------+
//! ```
//!
//! The second word packs the 6-bit frame type and 10 flag bits as
//! `type << 10 | flags`. Byte-stream transports additionally prefix each
//! frame with a 24-bit big-endian length (see [`crate::codec`]).

use bitflags::bitflags;

/// Size of the frame-length prefix used by byte-stream transports.
pub const FRAME_LENGTH_SIZE: usize = 3;
/// Largest encodable frame (24-bit length).
pub const FRAME_LENGTH_MASK: usize = 0xFF_FFFF;
/// Size of the frame header (stream id + type/flags).
pub const FRAME_HEADER_SIZE: usize = 6;
/// Size of the metadata length prefix.
pub const METADATA_LENGTH_SIZE: usize = 3;
/// Largest valid stream id (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

bitflags! {
    /// The 10 flag bits of the frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u16 {
        /// Receiver may ignore the frame if the type is not understood.
        const IGNORE   = 0b10_0000_0000;
        /// A metadata section is present.
        const METADATA = 0b01_0000_0000;
        /// More fragments follow this frame.
        const FOLLOWS  = 0b00_1000_0000;
        /// PAYLOAD: terminal completion of the stream.
        const COMPLETE = 0b00_0100_0000;
        /// PAYLOAD: a payload value is present.
        const NEXT     = 0b00_0010_0000;
        /// KEEPALIVE: the receiver must answer with a keepalive of its own.
        const RESPOND  = 0b00_1000_0000;
    }
}

/// The 6-bit frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl FrameType {
    pub fn from_encoded(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Setup,
            0x02 => Self::Lease,
            0x03 => Self::Keepalive,
            0x04 => Self::RequestResponse,
            0x05 => Self::RequestFnf,
            0x06 => Self::RequestStream,
            0x07 => Self::RequestChannel,
            0x08 => Self::RequestN,
            0x09 => Self::Cancel,
            0x0A => Self::Payload,
            0x0B => Self::Error,
            0x0C => Self::MetadataPush,
            0x0D => Self::Resume,
            0x0E => Self::ResumeOk,
            0x3F => Self::Ext,
            _ => return None,
        })
    }

    pub fn encoded(self) -> u8 {
        self as u8
    }

    /// True for the four frame types that open a new stream.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestResponse | Self::RequestFnf | Self::RequestStream | Self::RequestChannel
        )
    }

    /// True for types whose body starts with a 32-bit `initial_request_n`.
    pub fn has_initial_request_n(self) -> bool {
        matches!(self, Self::RequestStream | Self::RequestChannel)
    }

    /// True for types that may carry a length-prefixed metadata section.
    pub(crate) fn supports_metadata(self) -> bool {
        matches!(
            self,
            Self::Setup
                | Self::Lease
                | Self::RequestResponse
                | Self::RequestFnf
                | Self::RequestStream
                | Self::RequestChannel
                | Self::Payload
                | Self::MetadataPush
                | Self::Ext
        )
    }
}
