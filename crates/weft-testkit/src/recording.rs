//! A transport that records what the engine sends and lets tests inject
//! inbound frames, for frame-level assertions against a single connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use weft_core::{Frame, Transport, TransportError};

#[derive(Clone)]
pub struct RecordingTransport {
    inner: Arc<RecordingInner>,
}

struct RecordingInner {
    sent: Mutex<Vec<Bytes>>,
    sent_signal: Notify,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RecordingInner {
                sent: Mutex::new(Vec::new()),
                sent_signal: Notify::new(),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Feed a frame to the connection as if the peer had sent it.
    pub fn inject(&self, frame: Frame) {
        let _ = self.inner.inbound_tx.send(frame.into_bytes());
    }

    /// Feed raw bytes; for frames the codec has no encoder for.
    pub fn inject_bytes(&self, bytes: Bytes) {
        let _ = self.inner.inbound_tx.send(bytes);
    }

    /// Everything the connection has sent so far, decoded.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner
            .sent
            .lock()
            .iter()
            .map(|buf| Frame::parse(buf.clone()).expect("recorded frame must parse"))
            .collect()
    }

    /// Wait until at least `count` frames were sent, then return them all.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<Frame> {
        loop {
            let notified = self.inner.sent_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.sent.lock().len() >= count {
                return self.sent_frames();
            }
            notified.await;
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner.sent.lock().push(frame);
        self.inner.sent_signal.notify_waiters();
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        if self.is_closed() {
            return Ok(None);
        }
        let frame = {
            let mut rx = self.inner.inbound_rx.lock().await;
            rx.recv().await
        };
        Ok(frame)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
