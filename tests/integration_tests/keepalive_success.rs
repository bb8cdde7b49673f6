// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client configures a short keep-alive emission period, server configures
//! a longer inactivity window with a generous keep-alive allowance; the
//! client sends one message, waits past several keep-alive intervals, then
//! sends another. Expected: both succeed and the connection is never
//! dropped for `ConnectionTooManyKeepAlivePackets`.
//!
//! Driving this with `tokio::time::pause`/`advance` rather than a real sleep
//! would need a seam this crate doesn't expose: the keep-alive timer and
//! the inactivity counter it drives both live inside the connection's
//! reader/writer tasks, reached only through the public `Service` façade.
//! Instead this test scales every duration down to tens of milliseconds,
//! which exercises the same timer-driven code paths in well under a second
//! of real wall-clock time.

use std::time::Duration;

use mpipc::{cfg::config::Configuration, protocol::Protocol, service::{SendOptions, Service}};
use serde::{Deserialize, Serialize};
use serial_test::serial;

use super::common::{direct_resolver, settle};

const PING_TYPE_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Ping {
    n: u32,
}

#[tokio::test]
#[serial]
async fn keepalives_within_the_allowance_keep_the_connection_alive() {
    let listen_addr = "127.0.0.1:18904";

    let mut server_builder = Protocol::builder();
    server_builder.register::<Ping, _>(PING_TYPE_ID, |msg: Ping, is_response: bool| async move {
        if is_response { None } else { Some(msg) }
    });
    let server = Service::new(server_builder.build(), Configuration {
        server_listener_address_str: listen_addr.to_string(),
        connection_inactivity_timeout_seconds: Duration::from_millis(400),
        connection_inactivity_keepalive_count: 8,
        ..Configuration::default()
    });
    server.start().await.expect("server starts");
    settle().await;

    let client = Service::new(Protocol::builder().build(), Configuration {
        client_name_resolver: Some(direct_resolver()),
        connection_keepalive_timeout_seconds: Duration::from_millis(40),
        // The writer loop force-stops its own connection once it has sent
        // more keep-alives than this without any other traffic; give it
        // enough headroom to outlast the idle period below.
        connection_inactivity_keepalive_count: 64,
        ..Configuration::default()
    });

    let (_slot, rx) = client
        .send::<Ping>(
            listen_addr,
            PING_TYPE_ID,
            &Ping { n: 1 },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("first send accepted");
    let outcome = rx.await.expect("first completion delivered");
    assert!(outcome.error.is_none(), "first message must succeed");

    // Idle long enough for several keep-alive packets to cross the wire
    // (well past the server's inactivity window) without tripping the
    // keep-alive-count guard.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let (_slot2, rx2) = client
        .send::<Ping>(
            listen_addr,
            PING_TYPE_ID,
            &Ping { n: 2 },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("second send accepted");
    let outcome2 = rx2.await.expect("second completion delivered");
    assert!(
        outcome2.error.is_none(),
        "second message must still succeed, connection must not have been dropped for excess keep-alives"
    );
}
