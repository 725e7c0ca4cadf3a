//! Lease admission.
//!
//! The engine does not compute leases; it consults a [`LeaseHandler`] before
//! admitting each request and reports the handler's error when admission is
//! refused. A responder-side implementation issues LEASE frames through the
//! send multiplexer's priority lane (see
//! [`Requester::send_lease`](crate::Requester::send_lease)); the requester
//! side is fed received LEASE frames through [`LeaseHandler::receive`].

use crate::error::Error;

pub trait LeaseHandler: Send + Sync + 'static {
    /// Try to consume one lease slot for a request. Returning false rejects
    /// the request with [`LeaseHandler::lease_error`].
    fn use_lease(&self) -> bool;

    /// The error surfaced when `use_lease` refused a request.
    fn lease_error(&self) -> Error;

    /// A LEASE frame arrived from the peer.
    fn receive(&self, ttl_millis: u32, number_of_requests: u32) {
        let _ = (ttl_millis, number_of_requests);
    }
}

/// Admits everything; the default when leasing is not negotiated.
#[derive(Debug, Default)]
pub struct NoLease;

impl LeaseHandler for NoLease {
    fn use_lease(&self) -> bool {
        true
    }

    fn lease_error(&self) -> Error {
        Error::Rejected("lease is not enabled".into())
    }
}
