// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Relay transparency: a message addressed to `relay_addr/peerName` is
//! forwarded verbatim to the peer registered under `peerName`, and the
//! peer's reply finds its way back through the relay's translation table to
//! the sender that issued it, with the relay itself never decoding the
//! payload.

use std::sync::Arc;

use mpipc::{
    cfg::config::Configuration,
    error::ErrorKind,
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use tokio::net::TcpListener;

use super::common::{client_config, direct_resolver, settle};

const ECHO_TYPE_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Echo {
    name: String,
    data: String,
}

#[tokio::test]
#[serial]
async fn message_sent_through_a_relay_reaches_the_registered_peer_and_the_reply_returns() {
    let peer_b_addr = "127.0.0.1:19021";
    let relay_addr = "127.0.0.1:19020";

    let mut peer_b_builder = Protocol::builder();
    peer_b_builder.register::<Echo, _>(ECHO_TYPE_ID, |msg: Echo, is_response: bool| async move {
        if is_response { None } else { Some(msg) }
    });
    let peer_b = Service::new(peer_b_builder.build(), Configuration {
        server_listener_address_str: peer_b_addr.to_string(),
        ..Configuration::default()
    });
    peer_b.start().await.expect("peer-b starts");
    settle().await;

    let relay: Arc<Service> = Service::new(Protocol::builder().build(), Configuration {
        server_listener_address_str: relay_addr.to_string(),
        relay_enabled: true,
        client_name_resolver: Some(direct_resolver()),
        ..Configuration::default()
    });
    relay.start().await.expect("relay starts");
    settle().await;
    relay
        .register_relay_peer("peerB", peer_b_addr)
        .await
        .expect("relay dials and registers peer-b");
    settle().await;

    let peer_a = Service::new(Protocol::builder().build(), client_config());
    let recipient = format!("{relay_addr}/peerB");
    let (_slot, rx) = peer_a
        .send::<Echo>(
            &recipient,
            ECHO_TYPE_ID,
            &Echo {
                name: "peerA".to_string(),
                data: "hello through the relay".to_string(),
            },
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
    assert_eq!(reply.data, "hello through the relay");
    assert_eq!(reply.name, "peerA");
}

#[tokio::test]
#[serial]
async fn losing_the_relayed_peer_mid_flight_cancels_the_waiting_sender_instead_of_stalling_it() {
    let peer_b_addr = "127.0.0.1:19023";
    let relay_addr = "127.0.0.1:19022";

    // Stands in for peer-b: accepts the relay's one connection, then drops
    // it with the request still in flight, simulating the peer dying before
    // it can answer.
    let flaky_listener = TcpListener::bind(peer_b_addr).await.expect("bind flaky peer-b listener");
    let flaky = tokio::spawn(async move {
        if let Ok((stream, _)) = flaky_listener.accept().await {
            drop(stream);
        }
    });
    settle().await;

    let relay: Arc<Service> = Service::new(Protocol::builder().build(), Configuration {
        server_listener_address_str: relay_addr.to_string(),
        relay_enabled: true,
        client_name_resolver: Some(direct_resolver()),
        ..Configuration::default()
    });
    relay.start().await.expect("relay starts");
    settle().await;
    relay
        .register_relay_peer("peerB", peer_b_addr)
        .await
        .expect("relay dials and registers peer-b");
    settle().await;
    flaky.await.expect("flaky peer-b listener task completes");
    settle().await;

    let peer_a = Service::new(Protocol::builder().build(), client_config());
    let recipient = format!("{relay_addr}/peerB");
    let (_slot, rx) = peer_a
        .send::<Echo>(
            &recipient,
            ECHO_TYPE_ID,
            &Echo {
                name: "peerA".to_string(),
                data: "are you still there".to_string(),
            },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .expect("send accepted");

    let outcome = rx.await.expect("completion channel delivered");
    assert!(outcome.error.unwrap().is(&ErrorKind::MessageCanceled));
}
