// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cancel idempotence: send several `WaitResponse` messages, cancel most of
//! them, and check exactly the uncancelled ones produce a response.

use mpipc::{
    error::ErrorKind,
    ids::Slot,
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use serial_test::serial;

use super::common::{client_config, server_config, settle};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Ping {
    n: u32,
}

const PING_TYPE_ID: u32 = 1;

#[tokio::test]
#[serial]
async fn canceling_a_queued_message_completes_locally_with_message_canceled() {
    let client = Service::new(Protocol::builder().build(), client_config());

    let (slot, rx) = client
        .send::<Ping>(
            "127.0.0.1:18701",
            PING_TYPE_ID,
            &Ping { n: 1 },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("enqueued even with nothing listening yet");

    client.cancel("127.0.0.1:18701", slot).await.expect("first cancel succeeds");

    let outcome = rx.await.expect("completion fires");
    assert!(outcome.error.is_some());
    assert!(outcome.error.unwrap().is(&ErrorKind::MessageCanceled));
}

#[tokio::test]
#[serial]
async fn canceling_twice_reports_already_canceled_on_the_second_call() {
    let client = Service::new(Protocol::builder().build(), client_config());

    let (slot, _rx) = client
        .send::<Ping>(
            "127.0.0.1:18702",
            PING_TYPE_ID,
            &Ping { n: 2 },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("enqueued");

    client.cancel("127.0.0.1:18702", slot).await.expect("first cancel completes ok");
    let err = client.cancel("127.0.0.1:18702", slot).await.unwrap_err();
    assert!(err.is(&ErrorKind::ServiceMessageAlreadyCanceled));
}

#[tokio::test]
#[serial]
async fn canceling_a_slot_that_was_never_allocated_reports_already_canceled() {
    let client = Service::new(Protocol::builder().build(), client_config());

    // Resolving the pool allocates no slots, so any `Slot` handed to
    // `cancel` here is unknown to the store.
    let garbage = Slot::new(9999, 0);
    let err = client.cancel("127.0.0.1:18704", garbage).await.unwrap_err();
    assert!(err.is(&ErrorKind::ServiceMessageAlreadyCanceled));
}

#[tokio::test]
#[serial]
async fn uncancelled_messages_still_receive_their_response() {
    let listen_addr = "127.0.0.1:18703";

    let mut builder = Protocol::builder();
    builder.register::<Ping, _>(PING_TYPE_ID, |msg: Ping, is_response: bool| async move {
        if is_response { None } else { Some(msg) }
    });
    let server = Service::new(builder.build(), server_config(listen_addr));
    server.start().await.expect("server starts");
    settle().await;

    let client = Service::new(Protocol::builder().build(), client_config());

    let mut receivers = Vec::new();
    for n in 0..6u32 {
        let (slot, rx) = client
            .send::<Ping>(
                listen_addr,
                PING_TYPE_ID,
                &Ping { n },
                SendOptions {
                    wait_response: true,
                    synchronous: n % 2 == 0,
                    ..Default::default()
                },
            )
            .await
            .expect("send accepted");
        receivers.push((n, slot, rx));
    }

    // Cancel every odd-numbered request; the even ones were registered
    // `Synchronous` and should still complete with the echoed payload.
    for (n, slot, _) in &receivers {
        if n % 2 == 1 {
            let _ = client.cancel(listen_addr, *slot).await;
        }
    }

    for (n, _, rx) in receivers {
        let outcome = rx.await.expect("completion channel delivered");
        if n % 2 == 0 {
            let reply: Ping = Protocol::decode(&outcome.received_payload.expect("payload present")).expect("decode");
            assert_eq!(reply.n, n);
        } else {
            assert!(outcome.error.is_some(), "cancelled request {n} should carry an error");
        }
    }
}
