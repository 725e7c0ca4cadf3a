//! weft-testkit: shared harnesses for engine tests.
//!
//! Engine-level tests live here rather than in weft-core so that core does
//! not need a dev-dependency back onto the transport crates.
//!
//! Two harnesses:
//! - [`RecordingTransport`] drives a single connection at the frame level:
//!   the test injects inbound frames and asserts on the exact outbound
//!   frame sequence.
//! - [`connect`] wires two connections back to back over
//!   [`weft_transport_mem::MemTransport`] for end-to-end scenarios.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use weft_core::{Connection, DefaultHandler, Error, Handler, Payload, Requester};
use weft_transport_mem::MemTransport;

mod handlers;
mod recording;

pub use handlers::*;
pub use recording::*;

/// Collects errors delivered to a connection's error sink.
#[derive(Clone, Default)]
pub struct ErrorCollector {
    errors: Arc<Mutex<Vec<Error>>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The closure to install with
    /// [`Connection::on_error`](weft_core::Connection::on_error).
    pub fn sink(&self) -> impl Fn(Error) + Send + Sync + 'static {
        let errors = self.errors.clone();
        move |error| errors.lock().push(error)
    }

    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    #[track_caller]
    pub fn assert_empty(&self, side: &str) {
        let errors = self.errors();
        assert!(
            errors.is_empty(),
            "unexpected errors on the {side} connection: {errors:?}"
        );
    }
}

/// A client connection over a [`RecordingTransport`], driver spawned.
pub fn recording_client() -> (Requester, RecordingTransport, ErrorCollector) {
    let transport = RecordingTransport::new();
    let errors = ErrorCollector::new();
    let (requester, task) = Connection::client(transport.clone(), Arc::new(DefaultHandler))
        .on_error(errors.sink())
        .start();
    tokio::spawn(task.run());
    (requester, transport, errors)
}

/// A server connection (even stream ids, serving `handler`) over a
/// [`RecordingTransport`], driver spawned.
pub fn recording_server(
    handler: Arc<dyn Handler>,
) -> (Requester, RecordingTransport, ErrorCollector) {
    let transport = RecordingTransport::new();
    let errors = ErrorCollector::new();
    let (requester, task) = Connection::server(transport.clone(), handler)
        .on_error(errors.sink())
        .start();
    tokio::spawn(task.run());
    (requester, transport, errors)
}

/// Two connections wired back to back over an in-memory transport.
pub struct TestPair {
    pub client: Requester,
    pub server: Requester,
    pub client_errors: ErrorCollector,
    pub server_errors: ErrorCollector,
}

/// Connect a default client to a server running `handler`.
pub fn connect(server_handler: Arc<dyn Handler>) -> TestPair {
    connect_with(server_handler, |c| c, |s| s)
}

/// Connect two connections that both serve requests.
pub fn connect_duplex(
    client_handler: Arc<dyn Handler>,
    server_handler: Arc<dyn Handler>,
) -> TestPair {
    let (client_transport, server_transport) = MemTransport::pair();
    let client_errors = ErrorCollector::new();
    let server_errors = ErrorCollector::new();

    let (client, client_task) = Connection::client(client_transport, client_handler)
        .on_error(client_errors.sink())
        .start();
    let (server, server_task) = Connection::server(server_transport, server_handler)
        .on_error(server_errors.sink())
        .start();

    tokio::spawn(client_task.run());
    tokio::spawn(server_task.run());

    TestPair {
        client,
        server,
        client_errors,
        server_errors,
    }
}

/// Like [`connect`], with hooks to configure either connection (mtu, lease)
/// before it starts.
pub fn connect_with(
    server_handler: Arc<dyn Handler>,
    client_config: impl FnOnce(Connection<MemTransport>) -> Connection<MemTransport>,
    server_config: impl FnOnce(Connection<MemTransport>) -> Connection<MemTransport>,
) -> TestPair {
    let (client_transport, server_transport) = MemTransport::pair();
    let client_errors = ErrorCollector::new();
    let server_errors = ErrorCollector::new();

    let (client, client_task) = client_config(
        Connection::client(client_transport, Arc::new(DefaultHandler))
            .on_error(client_errors.sink()),
    )
    .start();
    let (server, server_task) = server_config(
        Connection::server(server_transport, server_handler).on_error(server_errors.sink()),
    )
    .start();

    tokio::spawn(client_task.run());
    tokio::spawn(server_task.run());

    TestPair {
        client,
        server,
        client_errors,
        server_errors,
    }
}

/// Assert that every stream table on the connection drains, i.e. no stream
/// object outlives its terminal state.
pub async fn assert_no_active_streams(requester: &Requester) {
    for _ in 0..200 {
        if requester.active_streams() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!(
        "streams still live after terminal state: {:?}",
        requester.pending_stream_ids()
    );
}

/// UTF-8 view of a payload's data, for assertions.
pub fn text(payload: &Payload) -> String {
    String::from_utf8_lossy(payload.data()).into_owned()
}

/// UTF-8 view of a payload's metadata, `None` when absent.
pub fn metadata_text(payload: &Payload) -> Option<String> {
    payload
        .metadata()
        .map(|m| String::from_utf8_lossy(m).into_owned())
}
