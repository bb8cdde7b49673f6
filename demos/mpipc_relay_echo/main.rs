// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Three-role relay echo demo: a relay node forwards framed messages
//! between two named peers without decoding them.
//!
//! Registration with the relay engine happens locally inside the relay
//! process itself, which dials out to `peerB` as an ordinary client and
//! registers that one connection under the name peer A's recipient strings
//! will reference — `peerB` never needs to know it is being relayed to at
//! all, it just runs an ordinary server.
//!
//! ```text
//! mpipc_relay_echo peer-b  127.0.0.1:10241
//! mpipc_relay_echo relay   127.0.0.1:10240 peerB 127.0.0.1:10241
//! mpipc_relay_echo peer-a  127.0.0.1:10240 peerB hello
//! ```

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, bail};
use mpipc::{
    cfg::{config::Configuration, logger::init_logger},
    error::{Error, ErrorKind},
    protocol::Protocol,
    service::{SendOptions, Service},
};
use serde::{Deserialize, Serialize};
use tracing::info;

const ECHO_TYPE_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct EchoMessage {
    name: String,
    data: String,
}

/// Recipient names here are plain `"host:port"` strings (the `/peerName`
/// relay suffix is split off by the service before resolution ever sees
/// it), so resolution is just parsing.
fn direct_resolver() -> mpipc::cfg::config::NameResolveFn {
    Arc::new(|name: &str| {
        let name = name.to_string();
        Box::pin(async move {
            let addr: SocketAddr = name
                .parse()
                .map_err(|e| Error::with_source(ErrorKind::ConnectionResolveFailure, anyhow::anyhow!("{e}")))?;
            Ok(vec![addr])
        })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger("tests/config_logger.yaml").ok();

    let mut args = std::env::args().skip(1);
    let role = args.next().unwrap_or_default();

    match role.as_str() {
        "relay" => {
            run_relay(
                args.next().unwrap_or_else(|| "127.0.0.1:10240".to_string()),
                args.next().unwrap_or_else(|| "peerB".to_string()),
                args.next().unwrap_or_else(|| "127.0.0.1:10241".to_string()),
            )
            .await
        },
        "peer-b" => run_peer_b(args.next().unwrap_or_else(|| "127.0.0.1:10241".to_string())).await,
        "peer-a" => {
            run_peer_a(
                args.next().unwrap_or_else(|| "127.0.0.1:10240".to_string()),
                args.next().unwrap_or_else(|| "peerB".to_string()),
                args.next().unwrap_or_else(|| "hello".to_string()),
            )
            .await
        },
        other => bail!("unknown role {other:?}, expected relay|peer-b|peer-a"),
    }
}

/// The relay accepts connections from origins like peer A and forwards
/// their bytes on without decoding them; it also dials out to `peer_addr`
/// itself and registers that one connection under
/// `peer_name`, which is how it learns where `host/peer_name` traffic goes.
async fn run_relay(listen_addr: String, peer_name: String, peer_addr: String) -> Result<()> {
    let protocol = Protocol::builder().build();
    let config = Configuration {
        server_listener_address_str: listen_addr.clone(),
        relay_enabled: true,
        client_name_resolver: Some(direct_resolver()),
        ..Configuration::default()
    };
    let service = Service::new(protocol, config);
    service.start().await.context("failed to start relay listener")?;
    service
        .register_relay_peer(&peer_name, &peer_addr)
        .await
        .context("failed to dial and register relay peer")?;
    info!(%listen_addr, %peer_name, %peer_addr, "mpipc relay listening and peer registered");

    tokio::signal::ctrl_c().await.ok();
    Ok(())
}

/// `peerB` is an ordinary mpipc server; it has no idea its caller went
/// through a relay.
async fn run_peer_b(listen_addr: String) -> Result<()> {
    let mut builder = Protocol::builder();
    builder.register::<EchoMessage, _>(ECHO_TYPE_ID, |msg: EchoMessage, is_response: bool| async move {
        if is_response {
            None
        } else {
            info!(from = %msg.name, data = %msg.data, "peer-b received message");
            Some(EchoMessage {
                name: msg.name,
                data: msg.data,
            })
        }
    });
    let protocol = builder.build();
    let config = Configuration {
        server_listener_address_str: listen_addr.clone(),
        ..Configuration::default()
    };
    let service = Service::new(protocol, config);
    service.start().await.context("failed to start peer-b listener")?;
    info!(%listen_addr, "mpipc peer-b listening");

    tokio::signal::ctrl_c().await.ok();
    Ok(())
}

/// `peerA` sends one message to `relay_addr/peer_name`; the relay forwards
/// it verbatim to the registered connection, and the response comes back
/// through the same translation table entry.
async fn run_peer_a(relay_addr: String, peer_name: String, text: String) -> Result<()> {
    let protocol = Protocol::builder().build();
    let config = Configuration {
        client_name_resolver: Some(direct_resolver()),
        ..Configuration::default()
    };
    let service = Service::new(protocol, config);

    let recipient = format!("{relay_addr}/{peer_name}");
    let (_slot, rx) = service
        .send::<EchoMessage>(
            &recipient,
            ECHO_TYPE_ID,
            &EchoMessage {
                name: "peerA".to_string(),
                data: text.clone(),
            },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .context("send failed")?;

    let outcome = rx.await.context("completion channel dropped")?;
    match outcome.error {
        Some(e) => bail!("relayed request failed: {e}"),
        None => {
            let payload = outcome.received_payload.unwrap_or_default();
            let reply: EchoMessage = Protocol::decode(&payload).context("decode reply")?;
            info!(sent = %text, received = %reply.data, "relayed echo round-trip complete");
            println!("{}", reply.data);
        },
    }
    Ok(())
}
