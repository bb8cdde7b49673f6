// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seven large messages in flight, the pool is force-closed mid-transfer.
//! Expected: every one of the 7 client completions fires with a non-nil
//! error.
//!
//! The scenario this mirrors has the *server* observe the first byte of the
//! first message and call `forceClose` on its own pool; this crate only exposes
//! `close_pool`/`CloseMode::Force` through the `Service` that owns the pool,
//! so this test drives it from whichever side issues the close and checks
//! the property it actually guarantees: every outstanding completion (queued
//! or in flight) fires with an error, none silently lost.

use std::sync::Arc;

use mpipc::{
    cfg::config::Configuration,
    pool::CloseMode,
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use serial_test::serial;

use super::common::{client_config, server_config, settle};

const BIG_TYPE_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Big {
    payload: Vec<u8>,
}

#[tokio::test]
#[serial]
async fn force_closing_a_pool_fails_every_outstanding_message() {
    let listen_addr = "127.0.0.1:18902";

    let mut builder = Protocol::builder();
    // The server never replies, so every `WaitResponse` message stays
    // outstanding until the force-close drains the store.
    builder.register::<Big, _>(BIG_TYPE_ID, |_msg: Big, _is_response: bool| async move { None });
    let server = Service::new(builder.build(), server_config(listen_addr));
    server.start().await.expect("server starts");
    settle().await;

    let mut client_cfg = client_config();
    // Let all 7 messages ride in flight on the one connection rather than
    // queueing most of them behind the default multiplex cap of 4.
    client_cfg.writer.max_message_count_multiplex = 8;
    client_cfg.writer.max_message_count_response_wait = 8;
    let client: Arc<Service> = Service::new(Protocol::builder().build(), client_cfg);

    let big = Big {
        payload: vec![0xAB; 8 * 1024 * 1024],
    };

    let mut receivers = Vec::new();
    for _ in 0..7 {
        let (_slot, rx) = client
            .send::<Big>(
                listen_addr,
                BIG_TYPE_ID,
                &big,
                SendOptions {
                    wait_response: true,
                    ..Default::default()
                },
            )
            .await
            .expect("send accepted");
        receivers.push(rx);
    }

    client.close_pool(listen_addr, CloseMode::Force).await;

    for rx in receivers {
        let outcome = rx.await.expect("completion channel delivered even on force-close");
        assert!(outcome.error.is_some(), "every completion must carry a non-nil error");
    }
}
