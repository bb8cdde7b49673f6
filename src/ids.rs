// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Generation-checked handles used in place of shared-ownership pointers.
//!
//! `Connection`, `Service` and `Pool` objects refer to each other through
//! small `Copy` index+generation pairs resolved back through the owning
//! registry under its shard mutex — no long-lived back-pointers are held
//! anywhere in this crate.

use core::fmt;

/// Index into a slab-style table, paired with a generation counter so that a
/// stale handle (pointing at a reused slot) is detected rather than
/// silently aliasing unrelated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub index: u32,
    pub generation: u32,
}

impl Slot {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Addresses either a whole pool (sticky routing) or one specific connection
/// within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipientId {
    pub pool: Slot,
    pub connection: Option<Slot>,
}

impl RecipientId {
    pub const fn pool_only(pool: Slot) -> Self {
        Self {
            pool,
            connection: None,
        }
    }

    pub const fn with_connection(pool: Slot, connection: Slot) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection {
            Some(c) => write!(f, "pool={} conn={}", self.pool, c),
            None => write!(f, "pool={}", self.pool),
        }
    }
}

/// Stable identity of an enqueued message. Stable across retries within the
/// same pool instance (i.e. re-queue after connection loss keeps the same
/// `MessageId`, only the owning connection changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub pool_generation: u32,
    pub slot: Slot,
}

impl MessageId {
    pub const fn new(pool_generation: u32, slot: Slot) -> Self {
        Self {
            pool_generation,
            slot,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg(pg={} {})", self.pool_generation, self.slot)
    }
}
