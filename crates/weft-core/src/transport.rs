//! Transport trait.

use std::future::Future;

use bytes::Bytes;

use crate::error::TransportError;

/// A transport moves whole frames between two peers.
///
/// Transports are responsible for framing bytes on the wire (for byte
/// streams, the 24-bit length prefix; see [`crate::codec`]) and for
/// delivering frames in order. They know nothing about stream ids,
/// interaction models or demand.
///
/// Invariant: a transport may buffer internally, but must not reorder
/// frames.
pub trait Transport: Send + Sync + 'static {
    /// Send one encoded frame to the peer.
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame from the peer. `Ok(None)` means the peer
    /// closed the connection cleanly.
    fn recv(&self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Tear the transport down. Idempotent; pending and subsequent calls
    /// observe closure.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
