// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared types for the `mpipc_echo_server`/`mpipc_echo_client` demo pair: a
//! single string field, registered under one type id.

use std::{net::SocketAddr, sync::Arc};

use mpipc::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};

pub const ECHO_TYPE_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EchoMessage {
    pub text: String,
}

/// For this demo, recipient names are already plain `"host:port"` strings,
/// so resolution is just parsing.
pub fn direct_resolver() -> mpipc::cfg::config::NameResolveFn {
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
