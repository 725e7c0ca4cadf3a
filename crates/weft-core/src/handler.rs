//! The user-supplied request handler.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Error;
use crate::payload::Payload;
use crate::responder::ChannelPayloads;

pub type PayloadResult = Result<Payload, Error>;

/// Serves the requests a peer initiates on this connection.
///
/// Every method has a default that rejects the interaction, so a handler
/// implements only what it serves. Methods take payload ownership; returning
/// an error releases it.
pub trait Handler: Send + Sync + 'static {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, Result<(), Error>> {
        drop(payload);
        Box::pin(async { Err(Error::Application("fire-and-forget not implemented".into())) })
    }

    fn request_response(
        &self,
        payload: Payload,
    ) -> BoxFuture<'static, Result<Option<Payload>, Error>> {
        drop(payload);
        Box::pin(async { Err(Error::Application("request-response not implemented".into())) })
    }

    fn request_stream(&self, payload: Payload) -> BoxStream<'static, PayloadResult> {
        drop(payload);
        error_stream(Error::Application("request-stream not implemented".into()))
    }

    fn request_channel(&self, payloads: ChannelPayloads) -> BoxStream<'static, PayloadResult> {
        drop(payloads);
        error_stream(Error::Application("request-channel not implemented".into()))
    }

    fn metadata_push(&self, payload: Payload) -> BoxFuture<'static, Result<(), Error>> {
        drop(payload);
        Box::pin(async { Err(Error::Application("metadata-push not implemented".into())) })
    }
}

/// A handler that accepts nothing; for connections that only make requests.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}

/// A one-element stream carrying an error.
pub(crate) fn error_stream(error: Error) -> BoxStream<'static, PayloadResult> {
    futures::stream::iter([Err(error)]).boxed()
}

/// Pull the next item from an optional boxed stream; a `None` slot never
/// resolves (callers guard on `is_some` in `select!`).
pub(crate) async fn next_item<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}
