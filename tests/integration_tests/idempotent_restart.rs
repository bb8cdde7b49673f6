// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Three messages sent with `{OneShot}`, `{WaitResponse+Idempotent}`,
//! `{WaitResponse}` respectively; the server drops mid-transfer and a
//! replacement comes up on
//! the same address. Expected: the idempotent message's response eventually
//! arrives, the plain `WaitResponse` message's completion carries
//! `MessageConnection`, and the `OneShot` message's completion carries an
//! error and is never retried.
//!
//! The first "server" is a bare `TcpListener` that accepts once and drops the
//! stream immediately, standing in for a server killed mid-transfer — this
//! avoids depending on any graceful-shutdown behavior of a full `Service`
//! (dropping a `Service` does not tear down connections its spawned
//! reader/writer tasks already own). Reconnection in this crate is lazy
//! (`Pool::ensure_connection` only runs from `send`, see
//! `pool/mod.rs::connection_lost`), so once the replacement server is up this
//! test nudges the pool with a trivial extra send to trigger the reconnect
//! that would otherwise come from later application traffic.

use std::time::Duration;

use mpipc::{
    error::ErrorKind,
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use tokio::{net::TcpListener, time::timeout};

use super::common::{client_config, server_config, settle};

const PING_TYPE_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Ping {
    n: u32,
    payload: Vec<u8>,
}

fn echo_protocol() -> Protocol {
    let mut builder = Protocol::builder();
    builder.register::<Ping, _>(PING_TYPE_ID, |msg: Ping, is_response: bool| async move {
        if is_response { None } else { Some(msg) }
    });
    builder.build()
}

#[tokio::test]
#[serial]
async fn idempotent_message_survives_a_server_restart_while_the_others_fail() {
    let listen_addr = "127.0.0.1:18903";
    let big = vec![0xCDu8; 4 * 1024 * 1024];

    // A flaky first "server": accepts exactly one connection and immediately
    // drops it, simulating a process killed partway through the transfer.
    let flaky_listener = TcpListener::bind(listen_addr).await.expect("bind flaky listener");
    let flaky = tokio::spawn(async move {
        if let Ok((stream, _)) = flaky_listener.accept().await {
            drop(stream);
        }
    });
    settle().await;

    let client = Service::new(Protocol::builder().build(), client_config());

    let (_one_shot_slot, one_shot_rx) = client
        .send::<Ping>(
            listen_addr,
            PING_TYPE_ID,
            &Ping { n: 1, payload: big.clone() },
            SendOptions {
                one_shot: true,
                ..Default::default()
            },
        )
        .await
        .expect("one-shot send accepted");

    let (_idempotent_slot, idempotent_rx) = client
        .send::<Ping>(
            listen_addr,
            PING_TYPE_ID,
            &Ping { n: 2, payload: big.clone() },
            SendOptions {
                wait_response: true,
                idempotent: true,
                ..Default::default()
            },
        )
        .await
        .expect("idempotent send accepted");

    let (_plain_slot, plain_rx) = client
        .send::<Ping>(
            listen_addr,
            PING_TYPE_ID,
            &Ping { n: 3, payload: big },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("plain send accepted");

    flaky.await.expect("flaky listener task completes");

    let one_shot_outcome = timeout(Duration::from_secs(5), one_shot_rx)
        .await
        .expect("one-shot completes promptly")
        .expect("one-shot completion fires exactly once");
    assert!(one_shot_outcome.error.is_some(), "one-shot must report an error, never silently succeed");

    let plain_outcome = timeout(Duration::from_secs(5), plain_rx)
        .await
        .expect("plain completion arrives promptly")
        .expect("plain WaitResponse completion fires");
    assert!(plain_outcome.error.unwrap().is(&ErrorKind::MessageConnection));

    // Bring a real server up on the same address and nudge the pool so it
    // reconnects and retries the still-queued idempotent message.
    let new_server = Service::new(echo_protocol(), server_config(listen_addr));
    new_server.start().await.expect("replacement server starts");
    settle().await;

    let (_nudge_slot, nudge_rx) = client
        .send::<Ping>(
            listen_addr,
            PING_TYPE_ID,
            &Ping { n: 999, payload: Vec::new() },
            SendOptions {
                one_shot: true,
                ..Default::default()
            },
        )
        .await
        .expect("nudge send accepted");
    let _ = timeout(Duration::from_secs(5), nudge_rx).await;

    let idempotent_outcome = timeout(Duration::from_secs(5), idempotent_rx)
        .await
        .expect("idempotent completion arrives after reconnect")
        .expect("idempotent completion fires");
    assert!(idempotent_outcome.error.is_none(), "idempotent message must eventually succeed after reconnect");
    let reply: Ping = Protocol::decode(&idempotent_outcome.received_payload.expect("payload present")).expect("decode");
    assert_eq!(reply.n, 2);
}
