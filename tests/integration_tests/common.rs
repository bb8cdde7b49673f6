// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use mpipc::{
    cfg::config::{Configuration, NameResolveFn},
    error::{Error, ErrorKind},
};

/// Every test in this suite addresses peers by plain `"host:port"` strings.
pub fn direct_resolver() -> NameResolveFn {
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

pub fn server_config(listen_addr: &str) -> Configuration {
    Configuration {
        server_listener_address_str: listen_addr.to_string(),
        ..Configuration::default()
    }
}

pub fn client_config() -> Configuration {
    Configuration {
        client_name_resolver: Some(direct_resolver()),
        ..Configuration::default()
    }
}

/// Gives a freshly started listener loop a moment to reach `accept()` before
/// a client in the same test dials it.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
