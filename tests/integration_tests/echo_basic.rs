// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Round-trip identity: a `WaitResponse` send completes with exactly the
//! bytes the handler returned.

use mpipc::{
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use serial_test::serial;

use super::common::{client_config, server_config, settle};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Echo {
    text: String,
}

const ECHO_TYPE_ID: u32 = 1;

#[tokio::test]
#[serial]
async fn wait_response_send_round_trips_the_payload() {
    let listen_addr = "127.0.0.1:18801";

    let mut builder = Protocol::builder();
    builder.register::<Echo, _>(ECHO_TYPE_ID, |msg: Echo, is_response: bool| async move {
        if is_response { None } else { Some(msg) }
    });
    let server = Service::new(builder.build(), server_config(listen_addr));
    server.start().await.expect("server starts");
    settle().await;

    let client = Service::new(Protocol::builder().build(), client_config());
    let (_slot, rx) = client
        .send::<Echo>(
            listen_addr,
            ECHO_TYPE_ID,
            &Echo { text: "hello".to_string() },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("send accepted");

    let outcome = rx.await.expect("completion channel delivered");
    assert!(outcome.error.is_none());
    let reply: Echo = Protocol::decode(&outcome.received_payload.expect("payload present")).expect("decode");
    assert_eq!(reply.text, "hello");
}

#[tokio::test]
#[serial]
async fn one_shot_send_completes_once_fully_handed_to_the_socket() {
    // OneShot semantics: a fire-and-forget send still carries a completion,
    // it just never waits on a peer reply.
    let listen_addr = "127.0.0.1:18802";

    let mut builder = Protocol::builder();
    builder.register::<Echo, _>(ECHO_TYPE_ID, |_msg: Echo, _is_response: bool| async move { None });
    let server = Service::new(builder.build(), server_config(listen_addr));
    server.start().await.expect("server starts");
    settle().await;

    let client = Service::new(Protocol::builder().build(), client_config());
    let (_slot, rx) = client
        .send::<Echo>(
            listen_addr,
            ECHO_TYPE_ID,
            &Echo { text: "fire-and-forget".to_string() },
            SendOptions {
                one_shot: true,
                ..Default::default()
            },
        )
        .await
        .expect("send accepted");

    let outcome = rx.await.expect("completion fires once sent");
    assert!(outcome.error.is_none());
    assert!(outcome.received_payload.is_none());
}
