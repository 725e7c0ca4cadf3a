//! The connection driver.
//!
//! A [`Connection`] wires a transport to the engine: one demux loop pumps
//! inbound frames and dispatches them by stream id and type; a send pump
//! (see [`crate::send_queue`]) serializes outbound frames. The demux loop is
//! the only caller of [`Transport::recv`]; all routing happens through
//! per-stream mailboxes, so no other code ever competes for inbound frames.
//!
//! ```text
//!                    ┌──────────────────────────────────┐
//!                    │            Connection            │
//!                    ├──────────────────────────────────┤
//!                    │  requests: id → stream mailbox   │
//!                    │  sending:  id → responder stream │
//!                    │  channels: id → processor sink   │
//!                    └───────────────┬──────────────────┘
//!                                    │
//!                               demux loop
//!                                    │
//!        ┌───────────────────────────┼───────────────────────────┐
//!        │                           │                           │
//!  stream id 0?                REQUEST_* ?              everything else
//!        │                           │                           │
//!  ┌─────▼──────┐        ┌───────────▼──────────┐   ┌────────────▼───────────┐
//!  │ keepalive, │        │ accept a responder   │   │ route to the stream's  │
//!  │ error,     │        │ stream, dispatch to  │   │ mailbox; unknown id is │
//!  │ lease, ... │        │ the handler          │   │ dropped (and released) │
//!  └────────────┘        └──────────────────────┘   └────────────────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::codec::{self, Frame};
use crate::error::Error;
use crate::frame::{Flags, FrameType};
use crate::handler::Handler;
use crate::lease::LeaseHandler;
use crate::payload::Payload;
use crate::registry::StreamRegistry;
use crate::requester::Requester;
use crate::responder;
use crate::send_queue::{frame_queue, FramePump, FrameSender};
use crate::stream_id::StreamIdSupplier;
use crate::transport::Transport;

/// A signal routed to one stream's mailbox.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// PAYLOAD with NEXT: one payload value.
    Next(Payload),
    /// PAYLOAD with COMPLETE: graceful terminal for the inbound leg.
    Complete,
    /// ERROR frame, or the connection's terminal error at teardown.
    Error(Error),
    /// CANCEL frame: the peer is no longer interested in our outbound leg.
    Cancel,
    /// REQUEST_N frame: credit toward our outbound leg.
    RequestN(u64),
}

pub(crate) type EventSender = mpsc::UnboundedSender<StreamEvent>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

pub(crate) type ErrorSink = Arc<dyn Fn(Error) + Send + Sync>;

/// Connection state shared by the driver, the requester handle and every
/// per-stream task.
pub(crate) struct Shared {
    pub(crate) sender: FrameSender,
    pub(crate) mtu: usize,
    /// Locally initiated streams, keyed by ids of our parity.
    pub(crate) requests: StreamRegistry<EventSender>,
    /// Responder streams serving peer requests, keyed by peer-parity ids.
    pub(crate) sending: StreamRegistry<EventSender>,
    /// Inbound processors for peer-initiated request-channel streams.
    pub(crate) channels: StreamRegistry<EventSender>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) lease: Option<Arc<dyn LeaseHandler>>,
    pub(crate) on_error: ErrorSink,
    terminal: Mutex<Option<Error>>,
    closed: Notify,
}

impl Shared {
    /// Admit one request through the lease, if leasing is enabled.
    pub(crate) fn use_lease(&self) -> Result<(), Error> {
        match &self.lease {
            Some(lease) if !lease.use_lease() => Err(lease.lease_error()),
            _ => Ok(()),
        }
    }

    pub(crate) fn terminal_error(&self) -> Option<Error> {
        self.terminal.lock().clone()
    }

    /// Set the terminal error; first caller wins and runs cleanup.
    pub(crate) fn try_terminate(&self, error: Error) {
        {
            let mut terminal = self.terminal.lock();
            if terminal.is_some() {
                return;
            }
            *terminal = Some(error.clone());
        }
        tracing::debug!(error = %error, "connection terminating");
        // Fail every live stream with the terminal error; the registries are
        // left empty and the stream tasks unwind, releasing their buffers.
        for (_, tx) in self.requests.take_all() {
            let _ = tx.send(StreamEvent::Error(error.clone()));
        }
        for (_, tx) in self.sending.take_all() {
            let _ = tx.send(StreamEvent::Cancel);
        }
        for (_, tx) in self.channels.take_all() {
            let _ = tx.send(StreamEvent::Error(error.clone()));
        }
        // Detach the queue: new sends are dropped, already-enqueued frames
        // (terminal ERRORs among them) are still flushed by the pump before
        // the driver closes the transport.
        self.sender.close();
        self.closed.notify_waiters();
    }

    /// Resolves once the connection has a terminal error.
    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.terminal_error().is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Report a stream-level failure: the error sink observes it and the
    /// peer receives an ERROR frame. Emits the ERROR alone, never a CANCEL
    /// alongside it.
    pub(crate) fn handle_stream_error(&self, stream_id: u32, error: Error) {
        (self.on_error)(error.clone());
        self.sender.send(codec::encode_error(stream_id, &error));
    }
}

/// A connection under construction. Configure it, then [`Connection::start`]
/// it to obtain the requester handle and the driver task.
pub struct Connection<T: Transport> {
    transport: Arc<T>,
    handler: Arc<dyn Handler>,
    ids: StreamIdSupplier,
    mtu: usize,
    lease: Option<Arc<dyn LeaseHandler>>,
    on_error: ErrorSink,
}

impl<T: Transport> Connection<T> {
    /// A client-role connection: allocates odd stream ids.
    pub fn client(transport: T, handler: Arc<dyn Handler>) -> Self {
        Self::new(transport, handler, StreamIdSupplier::client())
    }

    /// A server-role connection: allocates even stream ids.
    pub fn server(transport: T, handler: Arc<dyn Handler>) -> Self {
        Self::new(transport, handler, StreamIdSupplier::server())
    }

    fn new(transport: T, handler: Arc<dyn Handler>, ids: StreamIdSupplier) -> Self {
        Self {
            transport: Arc::new(transport),
            handler,
            ids,
            mtu: 0,
            lease: None,
            on_error: Arc::new(|error| {
                tracing::warn!(error = %error, "unhandled connection error");
            }),
        }
    }

    /// Maximum transmission unit. Zero (the default) disables fragmentation
    /// and enforces the single-frame payload limit.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Enable lease admission for requests in both roles.
    pub fn lease(mut self, lease: impl LeaseHandler) -> Self {
        self.lease = Some(Arc::new(lease));
        self
    }

    /// Install the error sink: the side channel for errors that have no
    /// stream to surface on (dropped frames, handler hooks).
    pub fn on_error(mut self, sink: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(sink);
        self
    }

    /// Build the engine: returns the requester handle and the driver task.
    /// Nothing moves until the task is spawned.
    pub fn start(self) -> (Requester, ConnectionTask<T>) {
        let (sender, pump) = frame_queue();
        let transport = self.transport;
        let shared = Arc::new(Shared {
            sender,
            mtu: self.mtu,
            requests: StreamRegistry::new(self.ids),
            sending: StreamRegistry::new(StreamIdSupplier::server()),
            channels: StreamRegistry::new(StreamIdSupplier::server()),
            handler: self.handler,
            lease: self.lease,
            on_error: self.on_error,
            terminal: Mutex::new(None),
            closed: Notify::new(),
        });
        let requester = Requester::new(shared.clone());
        let task = ConnectionTask {
            shared,
            transport,
            pump,
        };
        (requester, task)
    }
}

/// The driver: owns the demux loop. Spawn `run()` on the runtime.
pub struct ConnectionTask<T: Transport> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    pump: FramePump,
}

impl<T: Transport> ConnectionTask<T> {
    /// Pump inbound frames until the connection terminates.
    ///
    /// Returns `Ok(())` on clean closure (peer close or local dispose) and
    /// the terminal error otherwise. Cleanup has already run by the time
    /// this returns: the stream tables are empty, queued outbound buffers
    /// are released and the transport is closed.
    pub async fn run(self) -> Result<(), Error> {
        let ConnectionTask {
            shared,
            transport,
            pump,
        } = self;
        let mut pump_task = tokio::spawn(pump.run(transport.clone()));
        let mut pump_done = false;
        let mut result = Ok(());

        while shared.terminal_error().is_none() {
            tokio::select! {
                _ = shared.wait_closed() => {}
                received = transport.recv() => match received {
                    Ok(Some(buf)) => dispatch(&shared, buf),
                    Ok(None) => shared.try_terminate(Error::ClosedChannel),
                    Err(e) => {
                        let error = Error::Transport(Arc::new(e));
                        shared.try_terminate(error.clone());
                        result = Err(error);
                    }
                },
                pumped = &mut pump_task, if !pump_done => {
                    pump_done = true;
                    match pumped {
                        Ok(Ok(())) => shared.try_terminate(Error::ClosedChannel),
                        Ok(Err(e)) => {
                            let error = Error::Transport(Arc::new(e));
                            shared.try_terminate(error.clone());
                            result = Err(error);
                        }
                        Err(e) => {
                            let error = Error::IllegalState(format!("send pump failed: {e}"));
                            shared.try_terminate(error.clone());
                            result = Err(error);
                        }
                    }
                }
            }
        }

        if !pump_done {
            // The queue senders were detached by cleanup; the pump flushes
            // what was already enqueued and exits.
            let _ = pump_task.await;
        }
        transport.close();
        result
    }
}

/// Route one inbound frame. Synchronous: every branch either hands the frame
/// to a mailbox or drops it, releasing its buffers.
fn dispatch(shared: &Arc<Shared>, buf: Bytes) {
    let frame = match Frame::parse(buf) {
        Ok(frame) => frame,
        Err(e) => {
            shared.try_terminate(Error::IllegalState(format!("malformed frame: {e}")));
            return;
        }
    };
    let stream_id = frame.stream_id();
    let frame_type = frame.frame_type();
    tracing::trace!(stream_id, ?frame_type, len = frame.len(), "inbound frame");

    if stream_id == 0 {
        handle_stream_zero(shared, frame);
        return;
    }
    if frame_type.is_request() {
        responder::accept(shared, frame);
        return;
    }

    match frame_type {
        FrameType::Payload => {
            if let Some(tx) = shared.requests.get(stream_id) {
                deliver_payload(&tx, &frame);
            } else if let Some(tx) = shared.channels.get(stream_id) {
                deliver_payload(&tx, &frame);
                // COMPLETE is the processor's terminal; its table entry goes
                // with it (the responder's outbound leg has its own entry).
                if frame.flags().contains(Flags::COMPLETE) {
                    shared.channels.remove(stream_id);
                }
            } else {
                tracing::debug!(stream_id, "payload frame for unknown stream, dropping");
            }
        }
        FrameType::Error => {
            let error = frame.decode_error();
            if let Some(tx) = shared.requests.get(stream_id) {
                let _ = tx.send(StreamEvent::Error(error));
            } else if let Some(tx) = shared.channels.remove(stream_id) {
                let _ = tx.send(StreamEvent::Error(error));
            } else {
                tracing::debug!(stream_id, "error frame for unknown stream, dropping");
            }
        }
        FrameType::Cancel => {
            let mut handled = false;
            if let Some(tx) = shared.sending.remove(stream_id) {
                let _ = tx.send(StreamEvent::Cancel);
                handled = true;
            }
            if shared.channels.remove(stream_id).is_some() {
                handled = true;
            }
            if !handled {
                if let Some(tx) = shared.requests.get(stream_id) {
                    let _ = tx.send(StreamEvent::Cancel);
                }
            }
        }
        FrameType::RequestN => {
            let n = frame.request_n();
            if let Some(tx) = shared.sending.get(stream_id) {
                let _ = tx.send(StreamEvent::RequestN(n));
            } else if let Some(tx) = shared.requests.get(stream_id) {
                let _ = tx.send(StreamEvent::RequestN(n));
            }
            // Unknown stream id: ignored without protest.
        }
        other => {
            shared.handle_stream_error(
                stream_id,
                Error::IllegalState(format!(
                    "unexpected frame type {other:?} on stream {stream_id}"
                )),
            );
        }
    }
}

fn deliver_payload(tx: &EventSender, frame: &Frame) {
    let flags = frame.flags();
    if flags.contains(Flags::NEXT) {
        let _ = tx.send(StreamEvent::Next(frame.decode_payload()));
    }
    if flags.contains(Flags::COMPLETE) {
        let _ = tx.send(StreamEvent::Complete);
    }
}

fn handle_stream_zero(shared: &Arc<Shared>, frame: Frame) {
    match frame.frame_type() {
        FrameType::Keepalive => {
            if frame.keepalive_respond() {
                shared
                    .sender
                    .send_prioritized(codec::encode_keepalive(false, 0, frame.data()));
            }
        }
        FrameType::Error => {
            let error = frame.decode_error();
            (shared.on_error)(error.clone());
            shared.try_terminate(error);
        }
        FrameType::MetadataPush => {
            let payload = frame.decode_payload();
            let handler = shared.handler.clone();
            let on_error = shared.on_error.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.metadata_push(payload).await {
                    on_error(e);
                }
            });
        }
        FrameType::Lease => match &shared.lease {
            Some(lease) => {
                lease.receive(frame.lease_ttl_millis(), frame.lease_number_of_requests());
            }
            None => connection_violation(shared, "lease frame received but lease is not enabled"),
        },
        other => {
            connection_violation(shared, &format!("unexpected frame type {other:?} on stream 0"));
        }
    }
}

/// A protocol violation on stream 0 is fatal: report it, tell the peer, and
/// terminate the connection.
fn connection_violation(shared: &Arc<Shared>, message: &str) {
    let error = Error::IllegalState(message.to_string());
    (shared.on_error)(error.clone());
    shared.sender.send(codec::encode_error(0, &error));
    shared.try_terminate(error);
}
