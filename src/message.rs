// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The message bundle circulated inside a pool's message store: messages are
//! modeled by value in an arena-like slot table, identified by index rather
//! than by pointer.
//!
//! Payloads are serialized once, eagerly, at `send()` time and stored as
//! plain `Vec<u8>` inside the bundle — the writer only ever slices into
//! those bytes to fragment them across packets (`connection::writer`), so
//! "the writer borrows a slot briefly while serializing" reduces to a plain
//! byte-slice borrow rather than live serializer state per message.

use std::time::Instant;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;

use crate::{codec::envelope::MessageFlags, error::Error};

/// Bound satisfied by any application message type: a codec seam producing
/// and consuming byte streams with known typed boundaries.
pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> MessageType for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// What a completed message hands back to the caller: exactly one of
/// `received`/`error` is set on the request side; responses (no completion
/// possible, just a value) only ever carry `received`.
#[derive(Debug)]
pub struct CompletionOutcome {
    pub received_payload: Option<Vec<u8>>,
    pub error: Option<Error>,
}

impl CompletionOutcome {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            received_payload: Some(payload),
            error: None,
        }
    }

    pub fn err(error: Error) -> Self {
        Self {
            received_payload: None,
            error: Some(error),
        }
    }

    /// A successful fire-and-forget send: no response was ever expected, so
    /// there is nothing to hand back beyond "no error".
    pub fn sent() -> Self {
        Self {
            received_payload: None,
            error: None,
        }
    }
}

/// How a slot reports completion back to the caller that enqueued it.
///
/// A `oneshot` channel keeps the slot table homogeneous
/// (`Vec<Option<MessageBundle>>`) without any `dyn Any` downcasting, and
/// resolving the channel from the connection's own task means completions
/// run on the connection's reactor rather than some arbitrary caller thread.
#[derive(Debug)]
pub enum SlotCompletion {
    /// `OneShotSend` with no interest in the outcome beyond logging.
    Forget,
    Notify(oneshot::Sender<CompletionOutcome>),
}

impl SlotCompletion {
    pub fn notify(self, outcome: CompletionOutcome) {
        if let SlotCompletion::Notify(tx) = self {
            let _ = tx.send(outcome);
        }
    }
}

/// One outbound message, owned by the pool until handed to a connection's
/// writer.
#[derive(Debug)]
pub struct MessageBundle {
    pub type_id: u32,
    /// Pre-serialized payload bytes (post `MessageType::serialize`).
    pub payload: Vec<u8>,
    pub flags: MessageFlags,
    /// Correlates a response back to this request; `0` for fire-and-forget
    /// sends that never wait on a reply.
    pub sender_request_id: u32,
    /// Set only on response messages: the sender_request_id that is being
    /// answered.
    pub receiver_request_id: u32,
    pub completion: SlotCompletion,
    pub retry_count: u32,
    pub enqueue_time: Instant,
    pub secure_required: bool,
    /// `host/peer-name` suffix when this message's first hop targets a
    /// relay.
    pub relay_target: Option<String>,
}

impl MessageBundle {
    pub fn is_synchronous(&self) -> bool {
        self.flags.contains(MessageFlags::SYNCHRONOUS)
    }

    pub fn is_one_shot(&self) -> bool {
        self.flags.contains(MessageFlags::ONE_SHOT_SEND)
    }

    pub fn is_idempotent(&self) -> bool {
        self.flags.contains(MessageFlags::IDEMPOTENT)
    }

    pub fn wants_response(&self) -> bool {
        self.flags.contains(MessageFlags::WAIT_RESPONSE)
    }
}
