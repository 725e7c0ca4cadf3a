//! Responder-side interaction state machines.
//!
//! Each accepted request runs as its own task: it drives the handler's
//! future or stream, obeys the peer's credit (REQUEST_N) and cancellation
//! (CANCEL) through a mailbox registered in the sending table, and enqueues
//! response frames on the send multiplexer. Request-channel additionally
//! keeps an inbound processor in the channel table that the driver feeds
//! with the peer's payloads.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::codec::{self, Frame};
use crate::connection::{EventReceiver, Shared, StreamEvent};
use crate::error::Error;
use crate::handler::{error_stream, next_item, PayloadResult};
use crate::payload::Payload;
use crate::send_queue::FrameSender;
use crate::validation;

/// Entry point from the driver: an initiator frame with a non-zero id.
pub(crate) fn accept(shared: &Arc<Shared>, frame: Frame) {
    use crate::frame::FrameType;
    let stream_id = frame.stream_id();
    match frame.frame_type() {
        FrameType::RequestFnf => accept_fnf(shared, stream_id, frame),
        FrameType::RequestResponse => accept_request_response(shared, stream_id, frame),
        FrameType::RequestStream => accept_request_stream(shared, stream_id, frame),
        FrameType::RequestChannel => accept_request_channel(shared, stream_id, frame),
        _ => {}
    }
}

/// Register a fresh responder stream mailbox, or report the duplicate id.
/// The frame's decoded payload must already be owned by the caller so it is
/// released when the duplicate path drops it.
fn register_stream(shared: &Arc<Shared>, stream_id: u32) -> Option<EventReceiver> {
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    if shared.sending.register(stream_id, ev_tx) {
        Some(ev_rx)
    } else {
        shared.handle_stream_error(
            stream_id,
            Error::IllegalState(format!("stream {stream_id} is already in use")),
        );
        None
    }
}

/// Wait for a CANCEL (or teardown) on the stream mailbox.
async fn cancelled(ev_rx: &mut EventReceiver) {
    loop {
        match ev_rx.recv().await {
            Some(StreamEvent::Cancel) | None => return,
            Some(_) => {}
        }
    }
}

fn accept_fnf(shared: &Arc<Shared>, stream_id: u32, frame: Frame) {
    let payload = frame.decode_payload();
    let Some(mut ev_rx) = register_stream(shared, stream_id) else {
        return;
    };
    let fut: BoxFuture<'static, Result<(), Error>> = match shared.use_lease() {
        Ok(()) => shared.handler.fire_and_forget(payload),
        Err(error) => {
            drop(payload);
            Box::pin(async move { Err(error) })
        }
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            result = fut => Some(result),
            _ = cancelled(&mut ev_rx) => None,
        };
        // Fire-and-forget has no response path; handler errors still
        // surface on the error sink.
        if let Some(Err(error)) = outcome {
            (shared.on_error)(error);
        }
        shared.sending.remove(stream_id);
    });
}

fn accept_request_response(shared: &Arc<Shared>, stream_id: u32, frame: Frame) {
    let payload = frame.decode_payload();
    let Some(mut ev_rx) = register_stream(shared, stream_id) else {
        return;
    };
    let fut: BoxFuture<'static, Result<Option<Payload>, Error>> = match shared.use_lease() {
        Ok(()) => shared.handler.request_response(payload),
        Err(error) => {
            drop(payload);
            Box::pin(async move { Err(error) })
        }
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            result = fut => Some(result),
            _ = cancelled(&mut ev_rx) => None,
        };
        match outcome {
            Some(Ok(Some(payload))) => {
                if !validation::is_valid(shared.mtu, &payload) {
                    drop(payload);
                    shared.handle_stream_error(stream_id, Error::PayloadTooLarge);
                } else {
                    shared
                        .sender
                        .send(codec::encode_payload_next_complete(stream_id, payload));
                }
            }
            Some(Ok(None)) => {
                shared.sender.send(codec::encode_payload_complete(stream_id));
            }
            Some(Err(error)) => shared.handle_stream_error(stream_id, error),
            // Peer cancelled: the handler future was dropped, no frame.
            None => {}
        }
        shared.sending.remove(stream_id);
    });
}

fn accept_request_stream(shared: &Arc<Shared>, stream_id: u32, frame: Frame) {
    let initial_request_n = frame.initial_request_n();
    let payload = frame.decode_payload();
    let Some(ev_rx) = register_stream(shared, stream_id) else {
        return;
    };
    let stream = match shared.use_lease() {
        Ok(()) => shared.handler.request_stream(payload),
        Err(error) => {
            drop(payload);
            error_stream(error)
        }
    };
    run_outbound(shared, stream_id, stream, initial_request_n, ev_rx, false);
}

fn accept_request_channel(shared: &Arc<Shared>, stream_id: u32, frame: Frame) {
    let initial_request_n = frame.initial_request_n();
    let payload = frame.decode_payload();
    let Some(ev_rx) = register_stream(shared, stream_id) else {
        return;
    };

    let (proc_tx, proc_rx) = mpsc::unbounded_channel();
    if !shared.channels.register(stream_id, proc_tx.clone()) {
        shared.sending.remove(stream_id);
        shared.handle_stream_error(
            stream_id,
            Error::IllegalState(format!("channel {stream_id} is already in use")),
        );
        return;
    }
    // The initial payload is enqueued before the handler ever sees the
    // processor, so it is the first thing the handler receives.
    let _ = proc_tx.send(StreamEvent::Next(payload));
    let incoming = ChannelPayloads::new(stream_id, proc_rx, shared.sender.clone());

    let stream = match shared.use_lease() {
        Ok(()) => shared.handler.request_channel(incoming),
        Err(error) => {
            drop(incoming);
            error_stream(error)
        }
    };
    run_outbound(shared, stream_id, stream, initial_request_n, ev_rx, true);
}

/// Drive a handler-produced stream toward the peer under credit control.
/// Shared by request-stream and the outbound leg of request-channel
/// (`channel == true` also tears down the inbound processor on terminal
/// failures and cancellation).
///
/// Completion and errors consume no credit: the stream is polled one item
/// ahead of demand so a producer that yields exactly `credit` payloads
/// still reaches its terminal frame. At most one payload is held back
/// waiting for credit; only NEXT emission spends it.
fn run_outbound(
    shared: &Arc<Shared>,
    stream_id: u32,
    stream: BoxStream<'static, PayloadResult>,
    initial_credit: u64,
    mut ev_rx: EventReceiver,
    channel: bool,
) {
    let shared = shared.clone();
    tokio::spawn(async move {
        let mut outbound = Some(stream);
        let mut credit = initial_credit;
        let mut pending: Option<Payload> = None;
        loop {
            tokio::select! {
                ev = ev_rx.recv() => match ev {
                    Some(StreamEvent::RequestN(n)) => credit = credit.saturating_add(n),
                    Some(StreamEvent::Cancel) | None => {
                        // Dropping the stream cancels the handler; the
                        // processor (if any) and any held-back payload go
                        // with it. No frame: the peer initiated this
                        // teardown.
                        if channel {
                            shared.channels.remove(stream_id);
                        }
                        break;
                    }
                    Some(_) => {}
                },
                item = next_item(&mut outbound), if outbound.is_some() && pending.is_none() => match item {
                    Some(Ok(payload)) => pending = Some(payload),
                    Some(Err(error)) => {
                        if channel {
                            shared.channels.remove(stream_id);
                        }
                        shared.handle_stream_error(stream_id, error);
                        break;
                    }
                    None => {
                        shared.sender.send(codec::encode_payload_complete(stream_id));
                        break;
                    }
                },
            }
            if credit > 0 {
                if let Some(payload) = pending.take() {
                    if !validation::is_valid(shared.mtu, &payload) {
                        drop(payload);
                        if channel {
                            shared.channels.remove(stream_id);
                        }
                        shared.handle_stream_error(stream_id, Error::PayloadTooLarge);
                        break;
                    }
                    if credit != u64::MAX {
                        credit -= 1;
                    }
                    shared.sender.send(codec::encode_payload_next(stream_id, payload));
                }
            }
        }
        shared.sending.remove(stream_id);
    });
}

/// The inbound half of a peer-initiated channel, handed to
/// [`Handler::request_channel`](crate::Handler::request_channel).
///
/// The initial request payload is already queued when the handler receives
/// this, delivered implicitly: the first [`request`](Self::request) is
/// therefore forwarded to the peer as `n - 1`.
pub struct ChannelPayloads {
    stream_id: u32,
    events: EventReceiver,
    sender: FrameSender,
    first_request: bool,
    finished: bool,
}

impl ChannelPayloads {
    fn new(stream_id: u32, events: EventReceiver, sender: FrameSender) -> Self {
        Self {
            stream_id,
            events,
            sender,
            first_request: true,
            finished: false,
        }
    }

    /// Signal demand for `n` more payloads from the peer.
    pub fn request(&mut self, n: u64) {
        let on_wire = if self.first_request {
            self.first_request = false;
            n.saturating_sub(1)
        } else {
            n
        };
        if on_wire > 0 {
            self.sender
                .send(codec::encode_request_n(self.stream_id, on_wire));
        }
    }

    /// Next inbound payload; `None` once the peer completed (or the
    /// processor was disposed). After an error the stream is finished.
    pub async fn recv(&mut self) -> Option<Result<Payload, Error>> {
        if self.finished {
            return None;
        }
        loop {
            match self.events.recv().await {
                Some(StreamEvent::Next(payload)) => return Some(Ok(payload)),
                Some(StreamEvent::Complete) | None => {
                    self.finished = true;
                    return None;
                }
                Some(StreamEvent::Error(error)) => {
                    self.finished = true;
                    return Some(Err(error));
                }
                Some(_) => {}
            }
        }
    }
}
