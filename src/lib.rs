// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `mpipc` — a multi-peer, multiplexed, message-oriented RPC framework over
//! non-blocking TCP, with optional stream compression.

/// Configuration and logging.
pub mod cfg;
/// Wire framing: the fixed-size packet header and the per-message envelope.
pub mod codec;
/// Pluggable packet-body compression.
pub mod compression;
/// The per-connection state machine, reader and writer.
pub mod connection;
/// The crate's typed error taxonomy.
pub mod error;
/// Generation-checked handles (`RecipientId`, `MessageId`, `Slot`).
pub mod ids;
/// The message bundle circulated inside a pool's message store.
pub mod message;
/// The connection pool: message store, routing, lifecycle.
pub mod pool;
/// Runtime registry mapping message type ids to typed handlers.
pub mod protocol;
/// Transparent relay forwarding between two named connections.
pub mod relay;
/// The public service façade applications hold onto.
pub mod service;
/// Per-pool message store (FIFOs, slot table, pending-response table).
pub mod store;
