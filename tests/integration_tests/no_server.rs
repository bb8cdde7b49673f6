// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sending to an address with nothing listening queues normally instead of
//! failing `send()` outright, and only resolves once the caller explicitly
//! cancels it.

use std::time::Duration;

use mpipc::{
    error::ErrorKind,
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use serial_test::serial;

use super::common::client_config;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Ping {
    n: u32,
}

const PING_TYPE_ID: u32 = 1;

#[tokio::test]
#[serial]
async fn send_to_nothing_listening_queues_and_resolves_only_on_cancel() {
    let unreachable_addr = "127.0.0.1:18901";

    let client = Service::new(Protocol::builder().build(), client_config());

    let (slot, rx) = client
        .send::<Ping>(
            unreachable_addr,
            PING_TYPE_ID,
            &Ping { n: 7 },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("send is accepted even though nothing is listening");

    // Give the pool's connect attempt a moment to fail and settle; the
    // message must still be sitting in the queue, not already completed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        rx.try_recv().is_err(),
        "queued message must not self-complete without an explicit cancel"
    );

    client
        .cancel(unreachable_addr, slot)
        .await
        .expect("cancel on a still-queued message succeeds");

    let outcome = rx.await.expect("completion fires after cancel");
    assert!(outcome.error.is_some());
    assert!(outcome.error.unwrap().is(&ErrorKind::MessageCanceled));
}
