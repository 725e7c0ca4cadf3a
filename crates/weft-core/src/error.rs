//! Error codes and error types.

use core::fmt;
use std::sync::Arc;

/// Wire error codes.
///
/// Codes below `0x00000300` are defined by the protocol; the inclusive range
/// `MIN_CUSTOM..=MAX_CUSTOM` is reserved for application-defined codes that
/// are preserved verbatim across the connection.
pub mod code {
    pub const INVALID_SETUP: u32 = 0x0000_0001;
    pub const UNSUPPORTED_SETUP: u32 = 0x0000_0002;
    pub const REJECTED_SETUP: u32 = 0x0000_0003;
    pub const REJECTED_RESUME: u32 = 0x0000_0004;
    pub const CONNECTION_ERROR: u32 = 0x0000_0101;
    pub const CONNECTION_CLOSE: u32 = 0x0000_0102;
    pub const APPLICATION_ERROR: u32 = 0x0000_0201;
    pub const REJECTED: u32 = 0x0000_0202;
    pub const CANCELED: u32 = 0x0000_0203;
    pub const INVALID: u32 = 0x0000_0204;
    pub const MIN_CUSTOM: u32 = 0x0000_0301;
    pub const MAX_CUSTOM: u32 = 0xFFFF_FFFE;
}

/// Errors surfaced on the interaction APIs and carried in ERROR frames.
#[derive(Debug, Clone)]
pub enum Error {
    /// Business-level failure raised by a handler (`APPLICATION_ERROR`).
    Application(String),
    /// Application-defined wire code in the custom range.
    Custom { code: u32, message: String },
    /// The request was rejected before processing (`REJECTED`).
    Rejected(String),
    /// The stream was cancelled (`CANCELED`).
    Canceled(String),
    /// The request was invalid (`INVALID`).
    Invalid(String),
    /// The peer rejected the connection setup (`REJECTED_SETUP`).
    RejectedSetup(String),
    /// Protocol violation observed locally: unexpected frame kind, frame on a
    /// bad stream id, duplicate stream id.
    IllegalState(String),
    /// The payload does not fit a single frame and fragmentation is disabled.
    PayloadTooLarge,
    /// The connection closed before the stream reached a terminal state.
    ClosedChannel,
    /// The underlying transport failed.
    Transport(Arc<TransportError>),
}

impl Error {
    /// The code this error carries in an ERROR frame.
    ///
    /// Kinds without a protocol code of their own are sent as
    /// `APPLICATION_ERROR` with the display message.
    pub fn error_code(&self) -> u32 {
        match self {
            Error::Application(_) | Error::IllegalState(_) => code::APPLICATION_ERROR,
            Error::Custom { code, .. } => *code,
            Error::Rejected(_) => code::REJECTED,
            Error::Canceled(_) => code::CANCELED,
            Error::Invalid(_) | Error::PayloadTooLarge => code::INVALID,
            Error::RejectedSetup(_) => code::REJECTED_SETUP,
            Error::ClosedChannel | Error::Transport(_) => code::CONNECTION_ERROR,
        }
    }

    /// The message carried in the ERROR frame data field.
    pub fn wire_message(&self) -> String {
        match self {
            Error::Application(m)
            | Error::Custom { message: m, .. }
            | Error::Rejected(m)
            | Error::Canceled(m)
            | Error::Invalid(m)
            | Error::RejectedSetup(m)
            | Error::IllegalState(m) => m.clone(),
            Error::PayloadTooLarge => crate::validation::PAYLOAD_TOO_LARGE_MESSAGE.to_string(),
            Error::ClosedChannel => "connection closed".to_string(),
            Error::Transport(e) => e.to_string(),
        }
    }

    /// Rebuild a typed error from a received ERROR frame.
    pub fn from_wire(code: u32, message: String) -> Self {
        match code {
            code::APPLICATION_ERROR => Error::Application(message),
            code::REJECTED => Error::Rejected(message),
            code::CANCELED => Error::Canceled(message),
            code::INVALID => Error::Invalid(message),
            code::REJECTED_SETUP => Error::RejectedSetup(message),
            code::CONNECTION_ERROR | code::CONNECTION_CLOSE => Error::ClosedChannel,
            c if (code::MIN_CUSTOM..=code::MAX_CUSTOM).contains(&c) => {
                Error::Custom { code: c, message }
            }
            c => Error::IllegalState(format!("error frame with code 0x{c:08x}: {message}")),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Application(m) => write!(f, "application error: {m}"),
            Error::Custom { code, message } => write!(f, "custom error (0x{code:x}): {message}"),
            Error::Rejected(m) => write!(f, "rejected: {m}"),
            Error::Canceled(m) => write!(f, "canceled: {m}"),
            Error::Invalid(m) => write!(f, "invalid: {m}"),
            Error::RejectedSetup(m) => write!(f, "setup rejected: {m}"),
            Error::IllegalState(m) => write!(f, "illegal state: {m}"),
            Error::PayloadTooLarge => f.write_str(crate::validation::PAYLOAD_TOO_LARGE_MESSAGE),
            Error::ClosedChannel => f.write_str("connection closed"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof { needed: usize, available: usize },
    UnknownFrameType(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { needed, available } => {
                write!(f, "frame truncated: need {needed} bytes, have {available}")
            }
            Self::UnknownFrameType(t) => write!(f, "unknown frame type 0x{t:02x}"),
        }
    }
}

impl std::error::Error for DecodeError {}
