//! weft-core: a multiplexed interaction-stream connection engine.
//!
//! One connection carries many concurrent streams over a single
//! bidirectional frame transport. Each peer is symmetric: its [`Requester`]
//! initiates streams (fire-and-forget, request-response, request-stream,
//! request-channel, metadata-push) and its [`Handler`] serves the streams
//! the peer initiates.
//!
//! This crate defines:
//! - Payloads and frames ([`Payload`], [`Frame`], [`FrameType`], [`Flags`])
//! - The frame codec ([`codec` encoders and accessors](crate::encode_request_response))
//! - The transport seam ([`Transport`])
//! - The send multiplexer ([`FrameSender`], [`FramePump`])
//! - Stream id allocation and the stream table ([`StreamIdSupplier`],
//!   [`StreamRegistry`])
//! - The connection driver and interaction state machines ([`Connection`],
//!   [`Requester`], [`Handler`], [`ChannelPayloads`])

#![forbid(unsafe_code)]

mod codec;
mod connection;
mod error;
mod frame;
mod handler;
mod lease;
mod payload;
mod registry;
mod requester;
mod responder;
mod send_queue;
mod stream_id;
mod transport;
mod validation;

pub use codec::*;
pub use connection::*;
pub use error::*;
pub use frame::*;
pub use handler::{DefaultHandler, Handler, PayloadResult};
pub use lease::*;
pub use payload::*;
pub use registry::*;
pub use requester::{PayloadStream, Requester};
pub use responder::ChannelPayloads;
pub use send_queue::*;
pub use stream_id::StreamIdSupplier;
pub use transport::*;
pub use validation::*;

// Re-export StreamExt so handler implementations can build response streams
// without naming futures directly.
pub use futures::StreamExt;
