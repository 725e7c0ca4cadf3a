//! weft-transport-mem: an in-process duplex transport pair.
//!
//! Two [`MemTransport`] halves connected back to back: frames sent on one
//! side arrive on the other, in order, with no wire encoding beyond the
//! frame buffers themselves. Used for tests and same-process wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use weft_core::{Transport, TransportError};

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Create a connected pair. Frames sent on one half are received by the
    /// other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        (
            Self {
                inner: Arc::new(MemInner {
                    tx: tx_b,
                    rx: tokio::sync::Mutex::new(rx_a),
                    closed: AtomicBool::new(false),
                }),
            },
            Self {
                inner: Arc::new(MemInner {
                    tx: tx_a,
                    rx: tokio::sync::Mutex::new(rx_b),
                    closed: AtomicBool::new(false),
                }),
            },
        )
    }
}

impl Transport for MemTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        if self.is_closed() {
            return Ok(None);
        }
        let frame = {
            let mut rx = self.inner.rx.lock().await;
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
