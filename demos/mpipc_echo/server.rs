// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal mpipc echo server: registers [`EchoMessage`] and replies with
//! whatever it receives, mirroring `example_mpipc_echo.cpp`'s server mode.

#[path = "common.rs"]
mod common;

use anyhow::{Context, Result};
use common::{ECHO_TYPE_ID, EchoMessage};
use mpipc::{cfg::config::Configuration, cfg::logger::init_logger, protocol::Protocol, service::Service};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger("tests/config_logger.yaml").ok();

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:10234".to_string());

    let mut builder = Protocol::builder();
    builder.register::<EchoMessage, _>(ECHO_TYPE_ID, |msg: EchoMessage, is_response: bool| async move {
        if is_response {
            None
        } else {
            info!(text = %msg.text, "echo server received");
            Some(msg)
        }
    });
    let protocol = builder.build();

    let config = Configuration {
        server_listener_address_str: listen_addr.clone(),
        ..Configuration::default()
    };

    let service = Service::new(protocol, config);
    service.start().await.context("failed to start listener")?;
    info!(%listen_addr, "mpipc echo server listening");

    tokio::signal::ctrl_c().await.ok();
    Ok(())
}
