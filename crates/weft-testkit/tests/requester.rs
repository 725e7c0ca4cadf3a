//! Frame-level tests: one connection over a recording transport, asserting
//! on the exact outbound frame sequence.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use weft_core::{
    encode_cancel, encode_error, encode_keepalive, encode_payload_complete, encode_payload_next,
    encode_payload_next_complete, encode_request_channel, encode_request_n, encode_request_response,
    encode_request_stream, Error, Flags, FrameType, Payload, Requester, FRAME_LENGTH_MASK,
};
use weft_testkit::{
    assert_no_active_streams, metadata_text, recording_client, recording_server, text,
    ChannelResponder, EchoHandler, RecordingTransport,
};

fn oversized_payload() -> Payload {
    let big = Bytes::from(vec![0u8; FRAME_LENGTH_MASK]);
    Payload::with_metadata(big.clone(), big)
}

#[tokio::test]
async fn no_frame_before_first_demand() {
    let (requester, transport, _errors) = recording_client();
    let stream = requester.request_stream(Payload::empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_frames().is_empty());

    // zero demand is a no-op
    stream.request(0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_frames().is_empty());

    stream.request(5);
    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].frame_type(), FrameType::RequestStream);
    assert_eq!(sent[0].initial_request_n(), 5);
}

#[tokio::test]
async fn later_demand_becomes_request_n() {
    let (requester, transport, _errors) = recording_client();
    let stream = requester.request_stream(Payload::empty());
    stream.request(5);
    let sent = transport.wait_for_sent(1).await;
    let stream_id = sent[0].stream_id();

    stream.request(3);
    let sent = transport.wait_for_sent(2).await;
    assert_eq!(sent[1].frame_type(), FrameType::RequestN);
    assert_eq!(sent[1].stream_id(), stream_id);
    assert_eq!(sent[1].request_n(), 3);
}

async fn exchange_request_response(
    requester: &Requester,
    transport: &RecordingTransport,
    nth: usize,
) -> u32 {
    let requester = requester.clone();
    let call = tokio::spawn(async move { requester.request_response(Payload::new("ping")).await });
    let sent = transport.wait_for_sent(nth).await;
    let frame = &sent[nth - 1];
    assert_eq!(frame.frame_type(), FrameType::RequestResponse);
    let stream_id = frame.stream_id();
    transport.inject(encode_payload_next_complete(stream_id, Payload::new("pong")));
    let response = call.await.unwrap().unwrap().unwrap();
    assert_eq!(text(&response), "pong");
    stream_id
}

#[tokio::test]
async fn repeated_requests_use_fresh_stream_ids() {
    let (requester, transport, errors) = recording_client();
    let first = exchange_request_response(&requester, &transport, 1).await;
    let second = exchange_request_response(&requester, &transport, 2).await;
    assert_ne!(first, second);
    assert_eq!(first % 2, 1, "client ids are odd");
    assert_eq!(second % 2, 1);
    errors.assert_empty("client");
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn dropped_response_future_sends_cancel() {
    let (requester, transport, _errors) = recording_client();
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        requester.request_response(Payload::empty()),
    )
    .await;
    assert!(outcome.is_err(), "no response was ever injected");

    let sent = transport.wait_for_sent(2).await;
    assert_eq!(sent[0].frame_type(), FrameType::RequestResponse);
    assert_eq!(sent[1].frame_type(), FrameType::Cancel);
    assert_eq!(sent[0].stream_id(), sent[1].stream_id());
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn error_frame_fails_the_request() {
    let (requester, transport, errors) = recording_client();
    let call = {
        let requester = requester.clone();
        tokio::spawn(async move { requester.request_response(Payload::empty()).await })
    };
    let sent = transport.wait_for_sent(1).await;
    transport.inject(encode_error(
        sent[0].stream_id(),
        &Error::Application("error".into()),
    ));

    let result = call.await.unwrap();
    assert!(matches!(result, Err(Error::Application(m)) if m == "error"));
    // the error surfaced on the API path, not on the sink as well
    errors.assert_empty("client");
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn bare_complete_resolves_empty() {
    let (requester, transport, _errors) = recording_client();
    let call = {
        let requester = requester.clone();
        tokio::spawn(async move { requester.request_response(Payload::empty()).await })
    };
    let sent = transport.wait_for_sent(1).await;
    transport.inject(encode_payload_complete(sent[0].stream_id()));
    assert_eq!(call.await.unwrap().unwrap(), None);
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn setup_rejection_terminates_the_connection() {
    let (requester, transport, errors) = recording_client();
    transport.inject(encode_error(0, &Error::RejectedSetup("boom".into())));
    requester.closed().await;
    assert!(matches!(&errors.errors()[..], [Error::RejectedSetup(m)] if m == "boom"));
}

#[tokio::test]
async fn request_n_on_stream_zero_is_fatal() {
    let (requester, transport, errors) = recording_client();
    transport.inject(encode_request_n(0, 10));
    requester.closed().await;

    assert!(matches!(&errors.errors()[..], [Error::IllegalState(_)]));
    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::Error);
    assert_eq!(sent[0].stream_id(), 0);
}

#[tokio::test]
async fn setup_after_setup_is_fatal() {
    let (requester, transport, errors) = recording_client();
    // a bare SETUP header; the engine has no business decoding it post-setup
    transport.inject_bytes(Bytes::from_static(&[0, 0, 0, 0, 0x04, 0x00]));
    requester.closed().await;

    assert!(matches!(&errors.errors()[..], [Error::IllegalState(_)]));
    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::Error);
    assert_eq!(sent[0].stream_id(), 0);
}

#[tokio::test]
async fn oversized_payloads_fail_every_operation_without_frames() {
    let (requester, transport, _errors) = recording_client();
    let payload = oversized_payload();

    assert!(matches!(
        requester.fire_and_forget(payload.clone()).await,
        Err(Error::PayloadTooLarge)
    ));
    assert!(matches!(
        requester.request_response(payload.clone()).await,
        Err(Error::PayloadTooLarge)
    ));
    assert!(matches!(
        requester.metadata_push(payload.clone()).await,
        Err(Error::PayloadTooLarge)
    ));

    let mut stream = requester.request_stream(payload.clone());
    stream.request(1);
    assert!(matches!(
        stream.recv().await,
        Some(Err(Error::PayloadTooLarge))
    ));

    let mut channel = requester.request_channel(stream::iter([Ok(payload.clone())]));
    channel.request(1);
    assert!(matches!(
        channel.recv().await,
        Some(Err(Error::PayloadTooLarge))
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_frames().is_empty());
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn cancelled_channel_still_opens_before_cancelling() {
    let (requester, transport, _errors) = recording_client();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let channel = requester.request_channel(UnboundedReceiverStream::new(out_rx));
    channel.request(1);
    out_tx.send(Ok(Payload::new("first"))).unwrap();

    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::RequestChannel);

    channel.cancel();
    let sent = transport.wait_for_sent(2).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].frame_type(), FrameType::Cancel);
    assert_eq!(sent[0].stream_id(), sent[1].stream_id());
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn channel_cancelled_before_the_first_payload_sends_nothing() {
    let (requester, transport, _errors) = recording_client();
    let (_out_tx, out_rx) = mpsc::unbounded_channel::<Result<Payload, Error>>();
    let channel = requester.request_channel(UnboundedReceiverStream::new(out_rx));
    channel.request(1);
    channel.cancel();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_frames().is_empty());
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn invalid_second_channel_payload_sends_exactly_two_frames() {
    let (requester, transport, _errors) = recording_client();
    let mut channel = requester.request_channel(stream::iter([
        Ok(Payload::empty()),
        Ok(oversized_payload()),
    ]));
    channel.request(1);

    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::RequestChannel);
    let stream_id = sent[0].stream_id();

    // credit for the second payload, which fails validation
    transport.inject(encode_request_n(stream_id, 2));
    assert!(matches!(
        channel.recv().await,
        Some(Err(Error::PayloadTooLarge))
    ));

    let sent = transport.wait_for_sent(2).await;
    assert_eq!(sent[1].frame_type(), FrameType::Cancel);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent_frames().len(), 2);
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn peer_cancel_half_closes_the_outbound_leg() {
    let (requester, transport, _errors) = recording_client();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let mut channel = requester.request_channel(UnboundedReceiverStream::new(out_rx));
    channel.request(1);
    out_tx.send(Ok(Payload::empty())).unwrap();

    let sent = transport.wait_for_sent(1).await;
    let stream_id = sent[0].stream_id();

    transport.inject(encode_cancel(stream_id));
    for _ in 0..200 {
        if out_tx.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(out_tx.is_closed(), "outbound producer must be cancelled");

    // the inbound leg stays open until its own terminal
    transport.inject(encode_payload_complete(stream_id));
    assert!(channel.recv().await.is_none());
    assert_eq!(transport.sent_frames().len(), 1);
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn cancel_races_with_inbound_payloads_without_leaks() {
    for _ in 0..100 {
        let (requester, transport, _errors) = recording_client();
        let mut stream = requester.request_stream(Payload::empty());
        stream.request(2);
        let sent = transport.wait_for_sent(1).await;
        let stream_id = sent[0].stream_id();

        transport.inject(encode_payload_next(stream_id, Payload::new("racer")));
        stream.cancel();

        // either the payload was delivered before the cancel landed or it
        // was dropped on arrival; both outcomes leave the table empty
        match stream.recv().await {
            Some(Ok(payload)) => assert_eq!(text(&payload), "racer"),
            Some(Err(e)) => panic!("unexpected error: {e}"),
            None => {}
        }
        drop(stream);
        assert_no_active_streams(&requester).await;
        requester.dispose();
    }
}

#[tokio::test]
async fn outbound_error_before_the_first_payload_stays_local() {
    let (requester, transport, _errors) = recording_client();
    let mut channel =
        requester.request_channel(stream::iter([Err(Error::Application("test".into()))]));
    channel.request(1);

    assert!(matches!(
        channel.recv().await,
        Some(Err(Error::Application(m))) if m == "test"
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_frames().is_empty());
    assert_no_active_streams(&requester).await;
}

#[tokio::test]
async fn keepalive_with_respond_flag_is_echoed() {
    let (_requester, transport, _errors) = recording_client();
    transport.inject(encode_keepalive(true, 0, Bytes::from_static(b"ka")));

    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::Keepalive);
    assert!(!sent[0].keepalive_respond());
    assert_eq!(sent[0].data().as_ref(), b"ka");
}

// ---------------------------------------------------------------------------
// Responder side, frame level
// ---------------------------------------------------------------------------

#[tokio::test]
async fn responder_echoes_request_response() {
    let (_requester, transport, _errors) = recording_server(Arc::new(EchoHandler::default()));
    transport.inject(encode_request_response(1, Payload::with_metadata("hello", "md")));

    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::Payload);
    assert!(sent[0].flags().contains(Flags::NEXT | Flags::COMPLETE));
    assert_eq!(sent[0].data().as_ref(), b"hello");
    assert_eq!(metadata_text(&sent[0].decode_payload()).as_deref(), Some("md"));
}

#[tokio::test]
async fn responder_honours_stream_credit() {
    let (_requester, transport, _errors) =
        recording_server(Arc::new(EchoHandler { stream_len: 10 }));
    transport.inject(encode_request_stream(1, 2, Payload::new("x")));

    let sent = transport.wait_for_sent(2).await;
    assert!(sent.iter().all(|f| f.frame_type() == FrameType::Payload));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent_frames().len(), 2, "only granted credit is used");

    transport.inject(encode_request_n(1, 8));
    let sent = transport.wait_for_sent(11).await;
    assert_eq!(sent.len(), 11);
    assert!(sent[10].flags().contains(Flags::COMPLETE));
}

#[tokio::test]
async fn zero_initial_demand_is_a_quiet_wait() {
    let (_requester, transport, _errors) = recording_server(Arc::new(EchoHandler::default()));
    transport.inject(encode_request_stream(1, 0, Payload::new("x")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_frames().is_empty());

    transport.inject(encode_request_n(1, u64::MAX));
    let sent = transport.wait_for_sent(11).await;
    assert_eq!(sent.len(), 11);
}

#[tokio::test]
async fn cancel_stops_a_responder_stream_without_a_frame() {
    let (requester, transport, _errors) =
        recording_server(Arc::new(EchoHandler { stream_len: 1000 }));
    transport.inject(encode_request_stream(1, 1, Payload::new("x")));
    let _ = transport.wait_for_sent(1).await;

    transport.inject(encode_cancel(1));
    assert_no_active_streams(&requester).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent_frames().len(), 1, "no frame after a peer cancel");
}

#[tokio::test]
async fn duplicate_stream_id_is_a_stream_error() {
    let (_requester, transport, errors) = recording_server(Arc::new(NeverEndingEcho));
    transport.inject(encode_request_response(1, Payload::new("a")));
    transport.inject(encode_request_response(1, Payload::new("b")));

    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::Error);
    assert_eq!(sent[0].stream_id(), 1);
    assert_eq!(errors.len(), 1);
}

/// Request-response that never resolves, so the first stream holds its id.
struct NeverEndingEcho;

impl weft_core::Handler for NeverEndingEcho {
    fn request_response(
        &self,
        payload: Payload,
    ) -> futures::future::BoxFuture<'static, Result<Option<Payload>, Error>> {
        drop(payload);
        Box::pin(std::future::pending())
    }
}

#[tokio::test]
async fn channel_handler_first_demand_is_corrected_on_the_wire() {
    let mut rig = ChannelResponder::rig_with_demand(3);
    let (_requester, transport, _errors) = recording_server(rig.handler.clone());
    transport.inject(encode_request_channel(1, 1, Payload::new("init")));

    // the initial payload arrives implicitly, before any credit moves
    let first = rig.inbound.recv().await.unwrap().unwrap();
    assert_eq!(text(&first), "init");

    // handler asked for 3; one was already delivered
    let sent = transport.wait_for_sent(1).await;
    assert_eq!(sent[0].frame_type(), FrameType::RequestN);
    assert_eq!(sent[0].stream_id(), 1);
    assert_eq!(sent[0].request_n(), 2);
}
