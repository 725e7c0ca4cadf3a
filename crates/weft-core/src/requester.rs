//! Requester-side interaction state machines.
//!
//! Each outbound interaction is an actor: a task owns the interaction's
//! state, receives routed frames through its registry mailbox, receives
//! local demand and cancellation through a control channel, and forwards
//! payloads to the consumer. Per-stream transitions are thereby serialized
//! even though handlers and consumers run on arbitrary tasks.
//!
//! Laziness contract: no operation emits a frame before it is driven.
//! `fire_and_forget`/`request_response` send on first poll of the future;
//! `request_stream`/`request_channel` send on the first positive demand
//! signalled through [`PayloadStream::request`].

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::codec;
use crate::connection::{EventReceiver, Shared, StreamEvent};
use crate::error::Error;
use crate::handler::next_item;
use crate::payload::Payload;
use crate::validation;

/// Local signals from a [`PayloadStream`] handle to its stream task.
#[derive(Debug)]
enum LocalCtl {
    Request(u64),
    Cancel,
}

/// The requester half of a connection. Cloneable; all clones share the
/// connection's streams.
#[derive(Clone)]
pub struct Requester {
    shared: Arc<Shared>,
}

impl Requester {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Send one payload and expect nothing back. No stream table entry is
    /// kept: the stream id is burned and the frame is fire-and-forget.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), Error> {
        let shared = &self.shared;
        if let Some(error) = shared.terminal_error() {
            return Err(error);
        }
        shared.use_lease()?;
        if !validation::is_valid(shared.mtu, &payload) {
            return Err(Error::PayloadTooLarge);
        }
        let stream_id = shared.requests.next_id();
        tracing::debug!(stream_id, "fire-and-forget");
        shared.sender.send(codec::encode_request_fnf(stream_id, payload));
        Ok(())
    }

    /// Send one payload, await at most one in return.
    ///
    /// Resolves with `Some(payload)` on the first NEXT (completion may ride
    /// on the same frame or follow), `None` on a bare COMPLETE, and the
    /// decoded error on ERROR. Dropping the future before a terminal emits
    /// CANCEL and removes the stream; a racing inbound terminal is consumed
    /// without being delivered.
    pub async fn request_response(&self, payload: Payload) -> Result<Option<Payload>, Error> {
        let shared = &self.shared;
        if let Some(error) = shared.terminal_error() {
            return Err(error);
        }
        shared.use_lease()?;
        if !validation::is_valid(shared.mtu, &payload) {
            return Err(Error::PayloadTooLarge);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream_id = shared.requests.allocate(tx);
        tracing::debug!(stream_id, "request-response");
        shared
            .sender
            .send(codec::encode_request_response(stream_id, payload));

        let mut guard = CancelOnDrop {
            shared,
            stream_id,
            armed: true,
        };
        loop {
            match rx.recv().await {
                Some(StreamEvent::Next(payload)) => {
                    guard.disarm();
                    shared.requests.remove(stream_id);
                    return Ok(Some(payload));
                }
                Some(StreamEvent::Complete) => {
                    guard.disarm();
                    shared.requests.remove(stream_id);
                    return Ok(None);
                }
                Some(StreamEvent::Error(error)) => {
                    guard.disarm();
                    shared.requests.remove(stream_id);
                    return Err(error);
                }
                Some(StreamEvent::Cancel | StreamEvent::RequestN(_)) => continue,
                None => {
                    guard.disarm();
                    return Err(Error::ClosedChannel);
                }
            }
        }
    }

    /// Open a stream of payloads from the peer.
    ///
    /// Returns a lazy handle: nothing reaches the wire until the first
    /// positive [`PayloadStream::request`], which carries the accumulated
    /// demand as `initial_request_n`. Later demand becomes REQUEST_N deltas.
    pub fn request_stream(&self, payload: Payload) -> PayloadStream {
        let shared = self.shared.clone();
        let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let Some(demand) = await_first_demand(&mut ctl_rx).await else {
                return;
            };
            let Some((stream_id, mut ev_rx)) =
                open_stream(&shared, payload, &out_tx, |shared, id, payload| {
                    shared
                        .sender
                        .send(codec::encode_request_stream(id, demand, payload));
                    tracing::debug!(stream_id = id, initial_request_n = demand, "request-stream");
                })
            else {
                return;
            };

            loop {
                tokio::select! {
                    ctl = ctl_rx.recv() => match ctl {
                        Some(LocalCtl::Request(n)) => {
                            shared.sender.send(codec::encode_request_n(stream_id, n));
                        }
                        Some(LocalCtl::Cancel) | None => {
                            cancel_stream(&shared, stream_id);
                            return;
                        }
                    },
                    ev = ev_rx.recv() => match ev {
                        Some(StreamEvent::Next(payload)) => {
                            if out_tx.send(Ok(payload)).is_err() {
                                cancel_stream(&shared, stream_id);
                                return;
                            }
                        }
                        Some(StreamEvent::Complete) => {
                            shared.requests.remove(stream_id);
                            return;
                        }
                        Some(StreamEvent::Error(error)) => {
                            shared.requests.remove(stream_id);
                            let _ = out_tx.send(Err(error));
                            return;
                        }
                        Some(StreamEvent::Cancel | StreamEvent::RequestN(_)) => {}
                        None => return,
                    },
                }
            }
        });

        PayloadStream::new(ctl_tx, out_rx)
    }

    /// Open a full-duplex channel: `outbound` feeds the peer, the returned
    /// stream yields what the peer sends back.
    ///
    /// The channel opens on the first positive local demand *and* the first
    /// outbound payload: REQUEST_CHANNEL carries both. The outbound and
    /// inbound legs half-close independently; the stream ends when both
    /// legs are closed, or at once on either side's ERROR or CANCEL.
    pub fn request_channel<S>(&self, outbound: S) -> PayloadStream
    where
        S: Stream<Item = Result<Payload, Error>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut outbound: Option<BoxStream<'static, Result<Payload, Error>>> =
                Some(outbound.boxed());
            let Some(mut demand) = await_first_demand(&mut ctl_rx).await else {
                return;
            };

            // Pull the first outbound payload; REQUEST_CHANNEL needs it.
            // Demand keeps accumulating while we wait; local cancel before
            // the first payload means nothing ever reaches the wire.
            let first = loop {
                tokio::select! {
                    item = next_item(&mut outbound) => break item,
                    ctl = ctl_rx.recv() => match ctl {
                        Some(LocalCtl::Request(n)) => demand = demand.saturating_add(n),
                        Some(LocalCtl::Cancel) | None => return,
                    },
                }
            };
            let first = match first {
                Some(Ok(payload)) => payload,
                Some(Err(error)) => {
                    let _ = out_tx.send(Err(error));
                    return;
                }
                // Outbound finished without a payload: complete locally.
                None => return,
            };

            let Some((stream_id, mut ev_rx)) =
                open_stream(&shared, first, &out_tx, |shared, id, payload| {
                    shared
                        .sender
                        .send(codec::encode_request_channel(id, demand, payload));
                    tracing::debug!(stream_id = id, initial_request_n = demand, "request-channel");
                })
            else {
                return;
            };

            // The producer is polled one item ahead of peer demand so its
            // completion or error surfaces without spending credit; only
            // the NEXT emission below consumes it.
            let mut out_tx = Some(out_tx);
            let mut credit: u64 = 0;
            let mut pending: Option<Payload> = None;
            let mut inbound_open = true;
            loop {
                tokio::select! {
                    ctl = ctl_rx.recv() => match ctl {
                        Some(LocalCtl::Request(n)) => {
                            shared.sender.send(codec::encode_request_n(stream_id, n));
                        }
                        Some(LocalCtl::Cancel) | None => {
                            // Cancels the response subscription, the peer
                            // (via the frame) and our own producer (dropped
                            // with the task).
                            cancel_stream(&shared, stream_id);
                            return;
                        }
                    },
                    ev = ev_rx.recv() => match ev {
                        Some(StreamEvent::Next(payload)) => match &out_tx {
                            Some(tx) => {
                                if tx.send(Ok(payload)).is_err() {
                                    cancel_stream(&shared, stream_id);
                                    return;
                                }
                            }
                            // Inbound leg already closed; late payloads are
                            // dropped and released.
                            None => drop(payload),
                        },
                        Some(StreamEvent::Complete) => {
                            inbound_open = false;
                            out_tx = None;
                            if outbound.is_none() {
                                shared.requests.remove(stream_id);
                                return;
                            }
                        }
                        Some(StreamEvent::Error(error)) => {
                            shared.requests.remove(stream_id);
                            if let Some(tx) = &out_tx {
                                let _ = tx.send(Err(error));
                            }
                            return;
                        }
                        Some(StreamEvent::Cancel) => {
                            // Peer half-closed our outbound leg; drop the
                            // producer and any held-back payload, keep
                            // receiving until the inbound terminal.
                            outbound = None;
                            pending = None;
                            if !inbound_open {
                                shared.requests.remove(stream_id);
                                return;
                            }
                        }
                        Some(StreamEvent::RequestN(n)) => credit = credit.saturating_add(n),
                        None => return,
                    },
                    item = next_item(&mut outbound), if outbound.is_some() && pending.is_none() => match item {
                        Some(Ok(payload)) => pending = Some(payload),
                        Some(Err(error)) => {
                            shared.requests.remove(stream_id);
                            shared.sender.send(codec::encode_error(stream_id, &error));
                            if let Some(tx) = &out_tx {
                                let _ = tx.send(Err(error));
                            }
                            return;
                        }
                        None => {
                            outbound = None;
                            shared.sender.send(codec::encode_payload_complete(stream_id));
                            if !inbound_open {
                                shared.requests.remove(stream_id);
                                return;
                            }
                        }
                    },
                }
                if credit > 0 {
                    if let Some(payload) = pending.take() {
                        if !validation::is_valid(shared.mtu, &payload) {
                            drop(payload);
                            shared.requests.remove(stream_id);
                            shared.sender.send(codec::encode_cancel(stream_id));
                            if let Some(tx) = &out_tx {
                                let _ = tx.send(Err(Error::PayloadTooLarge));
                            }
                            return;
                        }
                        if credit != u64::MAX {
                            credit -= 1;
                        }
                        shared.sender.send(codec::encode_payload_next(stream_id, payload));
                    }
                }
            }
        });

        PayloadStream::new(ctl_tx, out_rx)
    }

    /// Push connection-level metadata; the payload's data section is
    /// discarded per the frame layout.
    pub async fn metadata_push(&self, payload: Payload) -> Result<(), Error> {
        let shared = &self.shared;
        if let Some(error) = shared.terminal_error() {
            return Err(error);
        }
        if !validation::is_valid(shared.mtu, &payload) {
            return Err(Error::PayloadTooLarge);
        }
        let (_data, metadata) = payload.into_parts();
        shared
            .sender
            .send(codec::encode_metadata_push(metadata.unwrap_or_else(Bytes::new)));
        Ok(())
    }

    /// Issue a LEASE frame to the peer on the priority lane. Responder-side
    /// lease handlers grant admission budgets with this.
    pub fn send_lease(&self, ttl_millis: u32, number_of_requests: u32, metadata: Option<Bytes>) {
        self.shared
            .sender
            .send_prioritized(codec::encode_lease(ttl_millis, number_of_requests, metadata));
    }

    /// Terminate the connection locally. Idempotent.
    pub fn dispose(&self) {
        self.shared
            .try_terminate(Error::Canceled("disposed".into()));
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.terminal_error().is_some()
    }

    /// Resolves when the connection reaches its terminal state.
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Number of live streams across all tables. Diagnostics.
    pub fn active_streams(&self) -> usize {
        self.shared.requests.len() + self.shared.sending.len() + self.shared.channels.len()
    }

    /// Ids of locally initiated streams still in flight, sorted. Diagnostics.
    pub fn pending_stream_ids(&self) -> Vec<u32> {
        self.shared.requests.ids()
    }
}

/// Accumulate control signals until demand turns positive. `None` means the
/// handle was cancelled or dropped first.
async fn await_first_demand(ctl_rx: &mut mpsc::UnboundedReceiver<LocalCtl>) -> Option<u64> {
    let mut demand: u64 = 0;
    loop {
        match ctl_rx.recv().await {
            Some(LocalCtl::Request(n)) => {
                demand = demand.saturating_add(n);
                if demand > 0 {
                    return Some(demand);
                }
            }
            Some(LocalCtl::Cancel) | None => return None,
        }
    }
}

/// Common open path: terminal/lease/validity gates, then allocate the id,
/// insert the stream's mailbox (one critical section) and emit the initiator
/// frame. Returns `None` when a gate failed (the consumer has been told).
fn open_stream(
    shared: &Arc<Shared>,
    payload: Payload,
    out_tx: &mpsc::UnboundedSender<Result<Payload, Error>>,
    emit: impl FnOnce(&Arc<Shared>, u32, Payload),
) -> Option<(u32, EventReceiver)> {
    if let Some(error) = shared.terminal_error() {
        let _ = out_tx.send(Err(error));
        return None;
    }
    if let Err(error) = shared.use_lease() {
        let _ = out_tx.send(Err(error));
        return None;
    }
    if !validation::is_valid(shared.mtu, &payload) {
        let _ = out_tx.send(Err(Error::PayloadTooLarge));
        return None;
    }
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let stream_id = shared.requests.allocate(ev_tx);
    emit(shared, stream_id, payload);
    Some((stream_id, ev_rx))
}

/// Local cancel: emit CANCEL iff we removed the entry (so a racing inbound
/// terminal, which also removes, suppresses the frame and the table sees
/// exactly one removal).
fn cancel_stream(shared: &Arc<Shared>, stream_id: u32) {
    if shared.requests.remove(stream_id).is_some() {
        shared.sender.send(codec::encode_cancel(stream_id));
    }
}

struct CancelOnDrop<'a> {
    shared: &'a Arc<Shared>,
    stream_id: u32,
    armed: bool,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            cancel_stream(self.shared, self.stream_id);
        }
    }
}

/// Consumer handle for `request_stream` / `request_channel` responses.
///
/// Demand is explicit: the peer owes only as many payloads as were
/// [`request`](Self::request)ed. Dropping the handle cancels the stream.
pub struct PayloadStream {
    ctl: mpsc::UnboundedSender<LocalCtl>,
    events: mpsc::UnboundedReceiver<Result<Payload, Error>>,
    finished: bool,
}

impl PayloadStream {
    fn new(
        ctl: mpsc::UnboundedSender<LocalCtl>,
        events: mpsc::UnboundedReceiver<Result<Payload, Error>>,
    ) -> Self {
        Self {
            ctl,
            events,
            finished: false,
        }
    }

    /// Signal demand for `n` more payloads. Requesting zero is a no-op.
    pub fn request(&self, n: u64) {
        if n > 0 {
            let _ = self.ctl.send(LocalCtl::Request(n));
        }
    }

    /// Next payload or error; `None` once the stream completed. After an
    /// error the stream is finished.
    pub async fn recv(&mut self) -> Option<Result<Payload, Error>> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(Ok(payload)) => Some(Ok(payload)),
            Some(Err(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Cancel the stream. At most one CANCEL frame reaches the peer.
    pub fn cancel(&self) {
        let _ = self.ctl.send(LocalCtl::Cancel);
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        let _ = self.ctl.send(LocalCtl::Cancel);
    }
}
