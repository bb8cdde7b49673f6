// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side reconnection backoff.
//!
//! A concrete exponential backoff seeded by
//! `connection_reconnect_timeout_seconds`, shaped by how far the previous
//! attempt got — a connection that reached `Active` before dying is retried
//! sooner than one that never even connected.

use std::time::Duration;

/// How far the previous connection attempt progressed before it died.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptOutcome {
    pub was_connected: bool,
    pub was_secured: bool,
    pub was_active: bool,
}

/// Computes the delay before the next connect attempt.
///
/// `retry_count` is 0 for the very first retry after a failure. The base
/// interval doubles per retry up to `ceiling`; an attempt that made it to
/// `Active` gets its computed delay halved, since a live peer that dropped
/// one connection is likely to accept another immediately.
pub fn backoff(
    retry_count: u32,
    outcome: AttemptOutcome,
    base: Duration,
    ceiling: Duration,
) -> Duration {
    let shift = retry_count.min(16);
    let mut delay = base.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
    if delay > ceiling {
        delay = ceiling;
    }
    if outcome.was_active {
        delay /= 2;
    } else if outcome.was_secured || outcome.was_connected {
        delay = delay.mul_f32(0.75);
    }
    delay.max(Duration::from_millis(1))
}
