//! Reference-counted payloads.
//!
//! A [`Payload`] owns its data and optional metadata as [`Bytes`] handles.
//! Cloning a payload is a refcount increment; dropping it releases the last
//! reference. Every API in this crate that accepts a `Payload` by value takes
//! ownership and accounts for it on all exit paths, so a payload handed to
//! the engine is released exactly once.

use bytes::Bytes;

/// An application payload: data plus optional metadata.
///
/// `metadata == None` is distinct from `metadata == Some(empty)`: an empty
/// metadata buffer still sets the METADATA flag on the wire, an absent one
/// does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    data: Bytes,
    metadata: Option<Bytes>,
}

impl Payload {
    /// Create a payload with data only.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: None,
        }
    }

    /// Create a payload with data and metadata.
    pub fn with_metadata(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: Some(metadata.into()),
        }
    }

    /// Create an empty payload (no data, no metadata).
    pub fn empty() -> Self {
        Self {
            data: Bytes::new(),
            metadata: None,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Total number of payload bytes (data plus metadata, excluding framing).
    pub fn size(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    /// Consume the payload, yielding its buffers.
    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.data, self.metadata)
    }
}
