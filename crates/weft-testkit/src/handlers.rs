//! Canned handlers for engine tests.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use weft_core::{ChannelPayloads, Error, Handler, Payload, PayloadResult};

/// Echoes request-response, produces a fixed-length stream, echoes channels.
pub struct EchoHandler {
    pub stream_len: usize,
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self { stream_len: 10 }
    }
}

impl Handler for EchoHandler {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, Result<(), Error>> {
        drop(payload);
        Box::pin(async { Ok(()) })
    }

    fn request_response(
        &self,
        payload: Payload,
    ) -> BoxFuture<'static, Result<Option<Payload>, Error>> {
        Box::pin(async move { Ok(Some(payload)) })
    }

    fn request_stream(&self, payload: Payload) -> BoxStream<'static, PayloadResult> {
        let text = String::from_utf8_lossy(payload.data()).into_owned();
        futures::stream::iter(
            (0..self.stream_len)
                .map(move |_| Ok(Payload::new(format!("server got -> [{text}]"))))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    fn request_channel(&self, mut payloads: ChannelPayloads) -> BoxStream<'static, PayloadResult> {
        Box::pin(async_stream::stream! {
            payloads.request(u64::MAX);
            while let Some(item) = payloads.recv().await {
                yield item;
            }
        })
    }

    fn metadata_push(&self, payload: Payload) -> BoxFuture<'static, Result<(), Error>> {
        drop(payload);
        Box::pin(async { Ok(()) })
    }
}

/// Fails every interaction with a fixed error.
pub struct FailingHandler {
    pub error: Error,
}

impl FailingHandler {
    pub fn new(error: Error) -> Self {
        Self { error }
    }
}

impl Handler for FailingHandler {
    fn request_response(
        &self,
        payload: Payload,
    ) -> BoxFuture<'static, Result<Option<Payload>, Error>> {
        drop(payload);
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }

    fn request_stream(&self, payload: Payload) -> BoxStream<'static, PayloadResult> {
        drop(payload);
        futures::stream::iter([Err(self.error.clone())]).boxed()
    }

    fn request_channel(&self, payloads: ChannelPayloads) -> BoxStream<'static, PayloadResult> {
        drop(payloads);
        futures::stream::iter([Err(self.error.clone())]).boxed()
    }
}

/// Accepts request-response but never answers; for cancellation and
/// teardown tests.
pub struct NeverHandler;

impl Handler for NeverHandler {
    fn request_response(
        &self,
        payload: Payload,
    ) -> BoxFuture<'static, Result<Option<Payload>, Error>> {
        drop(payload);
        Box::pin(std::future::pending())
    }
}

/// Forwards fire-and-forget and metadata-push payloads to the test body.
pub struct CollectingHandler {
    tx: mpsc::UnboundedSender<Payload>,
}

impl CollectingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Handler for CollectingHandler {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, Result<(), Error>> {
        let _ = self.tx.send(payload);
        Box::pin(async { Ok(()) })
    }

    fn metadata_push(&self, payload: Payload) -> BoxFuture<'static, Result<(), Error>> {
        let _ = self.tx.send(payload);
        Box::pin(async { Ok(()) })
    }
}

/// A channel handler wired to the test body on both legs: inbound payloads
/// are forwarded to a receiver the test holds, outbound payloads are fed
/// from a sender the test holds (dropping the sender completes the
/// responder's outbound leg).
pub struct ChannelResponder {
    inbound_tx: mpsc::UnboundedSender<PayloadResult>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<PayloadResult>>>,
    demand: u64,
}

pub struct ChannelResponderRig {
    pub handler: Arc<ChannelResponder>,
    /// What the responder-side consumer observed, in order. Closed when the
    /// inbound leg terminates.
    pub inbound: mpsc::UnboundedReceiver<PayloadResult>,
    /// Feeds the responder's outbound leg; drop to complete it.
    pub outbound: mpsc::UnboundedSender<PayloadResult>,
}

impl ChannelResponder {
    /// Unbounded inbound demand.
    pub fn rig() -> ChannelResponderRig {
        Self::rig_with_demand(u64::MAX)
    }

    /// The responder-side consumer issues exactly one `request(demand)`.
    pub fn rig_with_demand(demand: u64) -> ChannelResponderRig {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        ChannelResponderRig {
            handler: Arc::new(ChannelResponder {
                inbound_tx,
                outbound: Mutex::new(Some(outbound_rx)),
                demand,
            }),
            inbound: inbound_rx,
            outbound: outbound_tx,
        }
    }
}

impl Handler for ChannelResponder {
    fn request_channel(&self, mut payloads: ChannelPayloads) -> BoxStream<'static, PayloadResult> {
        let tx = self.inbound_tx.clone();
        let demand = self.demand;
        tokio::spawn(async move {
            payloads.request(demand);
            while let Some(item) = payloads.recv().await {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        match self.outbound.lock().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::iter([Err(Error::IllegalState(
                "channel responder accepts a single channel".into(),
            ))])
            .boxed(),
        }
    }
}
