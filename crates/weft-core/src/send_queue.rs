//! The outbound frame multiplexer.
//!
//! Many producers (requester streams, responder streams, the driver itself)
//! enqueue frames concurrently; one pump task owns the transport's send half
//! and writes them out. Two unbounded lanes: the priority lane carries
//! keepalive and lease frames and is always drained first; the normal lane
//! preserves per-producer FIFO order, which is what guarantees that a
//! stream's initial request frame precedes every later frame for that id.
//!
//! Closing the queue detaches the senders: frames already enqueued are still
//! flushed by the pump, new sends are dropped (and their buffers released),
//! and the pump exits once both lanes drain.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::Frame;
use crate::error::TransportError;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct FrameSender {
    inner: Arc<SenderInner>,
}

#[derive(Debug)]
struct SenderInner {
    normal: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    priority: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

#[derive(Debug)]
pub struct FramePump {
    normal: mpsc::UnboundedReceiver<Bytes>,
    priority: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected sender/pump pair.
pub fn frame_queue() -> (FrameSender, FramePump) {
    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    (
        FrameSender {
            inner: Arc::new(SenderInner {
                normal: Mutex::new(Some(normal_tx)),
                priority: Mutex::new(Some(priority_tx)),
            }),
        },
        FramePump {
            normal: normal_rx,
            priority: priority_rx,
        },
    )
}

impl FrameSender {
    /// Enqueue a frame on the normal lane. After close the frame is dropped.
    pub fn send(&self, frame: Frame) {
        if let Some(tx) = self.inner.normal.lock().as_ref() {
            let _ = tx.send(frame.into_bytes());
        }
    }

    /// Enqueue a frame on the priority lane (keepalive, lease).
    pub fn send_prioritized(&self, frame: Frame) {
        if let Some(tx) = self.inner.priority.lock().as_ref() {
            let _ = tx.send(frame.into_bytes());
        }
    }

    /// Stop accepting frames. Already-enqueued frames are still flushed.
    pub fn close(&self) {
        self.inner.normal.lock().take();
        self.inner.priority.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.normal.lock().is_none()
    }
}

impl FramePump {
    /// Write queued frames to the transport until the queue closes and
    /// drains, or the transport fails.
    pub async fn run<T: Transport>(mut self, transport: Arc<T>) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                biased;
                f = self.priority.recv() => match f {
                    Some(buf) => transport.send(buf).await?,
                    None => break,
                },
                f = self.normal.recv() => match f {
                    Some(buf) => transport.send(buf).await?,
                    None => break,
                },
            }
        }
        // Both lanes close together; flush what was enqueued before close.
        while let Some(buf) = self.priority.recv().await {
            transport.send(buf).await?;
        }
        while let Some(buf) = self.normal.recv().await {
            transport.send(buf).await?;
        }
        Ok(())
    }
}
