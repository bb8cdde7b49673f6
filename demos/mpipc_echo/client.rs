// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal mpipc echo client: sends one [`EchoMessage`] with `WaitResponse`
//! set and prints what comes back.

#[path = "common.rs"]
mod common;

use anyhow::{Context, Result, bail};
use common::{ECHO_TYPE_ID, EchoMessage, direct_resolver};
use mpipc::{
    cfg::{config::Configuration, logger::init_logger},
    protocol::Protocol,
    service::{SendOptions, Service},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger("tests/config_logger.yaml").ok();

    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:10234".to_string());
    let text = std::env::args().nth(2).unwrap_or_else(|| "hello".to_string());

    let protocol = Protocol::builder().build();
    let config = Configuration {
        client_name_resolver: Some(direct_resolver()),
        ..Configuration::default()
    };
    let service = Service::new(protocol, config);

    let (_slot, rx) = service
        .send::<EchoMessage>(
            &server_addr,
            ECHO_TYPE_ID,
            &EchoMessage { text: text.clone() },
            SendOptions {
                wait_response: true,
                ..Default::default()
            },
        )
        .await
        .context("send failed")?;

    let outcome = rx.await.context("completion channel dropped")?;
    match outcome.error {
        Some(e) => bail!("echo request failed: {e}"),
        None => {
            let payload = outcome.received_payload.unwrap_or_default();
            let reply: EchoMessage = Protocol::decode(&payload).context("decode reply")?;
            info!(sent = %text, received = %reply.text, "echo round-trip complete");
            println!("{}", reply.text);
        },
    }
    Ok(())
}
