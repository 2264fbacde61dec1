// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message codec over the in-memory transport

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{timeout, Instant};

use tokio_plc::{
    codec::{CodecConfig, MessageCodec},
    connection::{
        default::{DefaultConnection, Pinger},
        Connection,
    },
    trace::TraceEntry,
    transport::test::{TestTransportHandle, TestTransportInstance},
    Error, Result,
};

use common::{encode, init_logging, spawn_echo, Message, MessageFramer};

fn codec() -> (MessageCodec<MessageFramer>, TestTransportHandle) {
    init_logging();
    let (instance, handle) = TestTransportInstance::new("plc");
    (MessageCodec::new(Box::new(instance), MessageFramer), handle)
}

#[tokio::test]
async fn request_is_answered_by_matching_response() {
    let (codec, handle) = codec();
    codec.connect().await.unwrap();
    let echo = spawn_echo(handle);

    let response = codec
        .request(
            Message::new(7, b"hello"),
            |message: &Message| message.id == 7,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(response, Message::new(7, b"hello"));
    assert_eq!(codec.expectation_count(), 0);

    echo.abort();
    codec.disconnect().await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (codec, _handle) = codec();
    codec.connect().await.unwrap();

    let err = codec
        .request(
            Message::new(1, b"ping"),
            |message: &Message| message.id == 1,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(codec.expectation_count(), 0);
}

#[tokio::test]
async fn sending_requires_a_connection() {
    let (codec, _handle) = codec();
    let err = codec.send(Message::new(1, b"")).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn unmatched_messages_go_to_the_default_channel() {
    let (codec, handle) = codec();
    let mut incoming = codec.take_default_incoming_messages().unwrap();
    assert!(codec.take_default_incoming_messages().is_none());
    codec.connect().await.unwrap();

    handle.feed(encode(Message::new(99, b"unsolicited")));
    let message = timeout(Duration::from_secs(1), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::new(99, b"unsolicited"));
}

#[tokio::test]
async fn custom_handler_claims_messages_first() {
    init_logging();
    let claimed = Arc::new(AtomicUsize::new(0));
    let (instance, handle) = TestTransportInstance::new("plc");
    let codec = MessageCodec::builder(Box::new(instance), MessageFramer)
        .config(CodecConfig::default().with_poll_interval(Duration::from_millis(1)))
        .custom_message_handler({
            let claimed = Arc::clone(&claimed);
            move |message: &Message| {
                if message.id == 1 {
                    claimed.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        })
        .build();
    let mut incoming = codec.take_default_incoming_messages().unwrap();
    codec.connect().await.unwrap();

    handle.feed(encode(Message::new(1, b"mine")));
    handle.feed(encode(Message::new(2, b"yours")));
    let message = timeout(Duration::from_secs(1), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id, 2);
    assert_eq!(claimed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_survives_malformed_input() {
    let (codec, handle) = codec();
    let mut incoming = codec.take_default_incoming_messages().unwrap();
    codec.connect().await.unwrap();

    // A length below the header size.
    handle.feed([0x00, 0x01, 0xff]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(codec.is_running());

    handle.feed(encode(Message::new(3, b"valid")));
    let message = timeout(Duration::from_secs(1), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id, 3);
}

#[tokio::test]
async fn worker_stops_when_the_transport_is_lost() {
    let (codec, handle) = codec();
    let mut incoming = codec.take_default_incoming_messages().unwrap();
    codec.connect().await.unwrap();

    handle.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!codec.is_running());

    // Connecting again restarts the worker.
    codec.connect().await.unwrap();
    assert!(codec.is_running());
    handle.feed(encode(Message::new(5, b"back")));
    let message = timeout(Duration::from_secs(1), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id, 5);
}

#[tokio::test]
async fn panicking_expectation_does_not_take_down_the_codec() {
    let (codec, handle) = codec();
    let errors = Arc::new(Mutex::new(Vec::new()));
    codec.connect().await.unwrap();

    let waiting_errors = Arc::clone(&errors);
    codec.expect(
        |message: &Message| message.id == 2,
        |_| Ok(()),
        move |err| {
            waiting_errors.lock().unwrap().push(err.to_string());
            Ok(())
        },
        Duration::from_secs(60),
    );
    let broken_errors = Arc::clone(&errors);
    codec.expect(
        |message: &Message| {
            assert_ne!(message.id, 1, "cannot inspect message");
            false
        },
        |_| Ok(()),
        move |err| {
            broken_errors.lock().unwrap().push(err.to_string());
            Ok(())
        },
        Duration::from_secs(60),
    );

    handle.feed(encode(Message::new(1, b"boom")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(codec.is_running());
    assert_eq!(codec.expectation_count(), 1);
    {
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("panicked"));
    }

    // Later requests are still served.
    let echo = spawn_echo(handle);
    let response = codec
        .request(
            Message::new(3, b"hello"),
            |message: &Message| message.id == 3,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(response.id, 3);
    assert_eq!(codec.expectation_count(), 1);
    echo.abort();
}

#[tokio::test]
async fn expectations_can_be_driven_without_worker() {
    let (codec, _handle) = codec();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let timed_out = Arc::new(AtomicUsize::new(0));

    for id in [1, 2] {
        let handled = Arc::clone(&handled);
        let timed_out = Arc::clone(&timed_out);
        codec.expect(
            move |message: &Message| message.id == id,
            move |message| {
                handled.lock().unwrap().push(message.id);
                Ok(())
            },
            move |err| {
                assert!(err.is_timeout());
                timed_out.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(100),
        );
    }
    assert_eq!(codec.expectation_count(), 2);

    assert!(codec.handle_message(&Message::new(2, b"")));
    assert!(!codec.handle_message(&Message::new(2, b"")));
    assert_eq!(*handled.lock().unwrap(), [2]);

    assert_eq!(codec.timeout_expectations(Instant::now()), 0);
    assert_eq!(
        codec.timeout_expectations(Instant::now() + Duration::from_secs(1)),
        1
    );
    assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    assert_eq!(codec.expectation_count(), 0);
}

struct EchoPinger;

#[async_trait]
impl Pinger<MessageFramer> for EchoPinger {
    async fn ping(&self, codec: &MessageCodec<MessageFramer>) -> Result<()> {
        codec
            .request(
                Message::new(0, b"ping"),
                |message: &Message| message.id == 0,
                Duration::from_millis(200),
            )
            .await
            .map(|_| ())
    }
}

#[tokio::test]
async fn default_connection_pings_through_the_codec() {
    let (codec, handle) = codec();
    let connection = DefaultConnection::builder(Arc::new(codec))
        .tracing(true)
        .pinger(EchoPinger)
        .build();
    connection.connect().await.unwrap();
    assert!(handle.is_connected());

    let echo = spawn_echo(handle.clone());
    connection.ping().await.unwrap();
    echo.abort();

    // Nobody answers anymore.
    assert!(connection.ping().await.unwrap_err().is_timeout());

    connection.close().await.unwrap();
    assert!(!handle.is_connected());

    let labels: Vec<_> = connection
        .tracer()
        .unwrap()
        .traces()
        .iter()
        .map(TraceEntry::label)
        .collect();
    assert_eq!(
        labels,
        [
            "connect-started",
            "connect-success",
            "ping-started",
            "ping-success",
            "ping-started",
            "ping-error: timeout while waiting for response after 200ms",
            "close-started",
            "close-success",
        ]
    );
}
