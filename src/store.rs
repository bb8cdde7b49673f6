// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-pool message store: the FIFO queues, the slot free-list, the
//! pending-response table, and the cancel set.
//!
//! A single-owner `Vec`-backed slab rather than a lock-free map, since the
//! whole store already lives behind the pool's own shard mutex — pool data
//! structures are shared across reactors, but mutation is serialized by a
//! bank of mutexes, not by a second layer of concurrent bookkeeping here.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    error::{Error, ErrorKind},
    ids::Slot,
    message::{CompletionOutcome, MessageBundle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Queued, not yet handed to a connection.
    Queued,
    /// Handed to a connection's writer; still owned here until completion.
    InFlight,
}

struct Entry {
    bundle: Option<MessageBundle>,
    state: SlotState,
    generation: u32,
}

/// Per-pool message store.
pub struct MessageStore {
    entries: Vec<Entry>,
    free_list: Vec<u32>,
    async_queue: VecDeque<u32>,
    sync_queue: VecDeque<u32>,
    /// `sender_request_id -> slot index`, only for slots with
    /// `WAIT_RESPONSE` set and already in flight (i.e. awaiting a reply
    /// rather than still queued).
    pending_response: HashMap<u32, u32>,
    /// `(slot index, slot generation)` pairs that have already been
    /// canceled, kept past slot reuse so a repeated `cancel()` on the same
    /// stale `MessageId` reports `ServiceMessageAlreadyCanceled` rather
    /// than the generic "unknown" error.
    canceled_ids: HashSet<(u32, u32)>,
    next_sender_request_id: u32,
    max_queue_size: usize,
}

pub enum CancelOutcome {
    /// Was queued; already completed locally with `MessageCanceled`.
    CompletedLocally,
    /// Was in flight; caller must forward a cancel event to the owning
    /// connection.
    ForwardToConnection,
    /// Was awaiting a response; completed locally with `MessageCanceled`.
    ResponsePending,
}

impl MessageStore {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            async_queue: VecDeque::new(),
            sync_queue: VecDeque::new(),
            pending_response: HashMap::new(),
            canceled_ids: HashSet::new(),
            next_sender_request_id: 1,
            max_queue_size,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.async_queue.len() + self.sync_queue.len()
    }

    pub fn next_sender_request_id(&mut self) -> u32 {
        let id = self.next_sender_request_id;
        self.next_sender_request_id = self.next_sender_request_id.wrapping_add(1).max(1);
        id
    }

    fn alloc_slot(&mut self, bundle: MessageBundle) -> Slot {
        if let Some(index) = self.free_list.pop() {
            let entry = &mut self.entries[index as usize];
            entry.bundle = Some(bundle);
            entry.state = SlotState::Queued;
            Slot::new(index, entry.generation)
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                bundle: Some(bundle),
                state: SlotState::Queued,
                generation: 0,
            });
            Slot::new(index, 0)
        }
    }

    fn free_slot(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        entry.bundle = None;
        entry.state = SlotState::Free;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_list.push(index);
    }

    /// Looks up `slot`. An out-of-range index or a stale generation means
    /// this `MessageId` is unknown to the store — per the cancel contract,
    /// an unknown id is reported the same way a genuinely already-canceled
    /// one is, as `ServiceMessageAlreadyCanceled`, since from the caller's
    /// perspective both mean "nothing left here to cancel".
    fn resolve(&self, slot: Slot) -> Result<(), Error> {
        let entry = self
            .entries
            .get(slot.index as usize)
            .ok_or_else(|| Error::new(ErrorKind::ServiceMessageAlreadyCanceled))?;
        if entry.generation != slot.generation || entry.bundle.is_none() {
            return Err(Error::new(ErrorKind::ServiceMessageAlreadyCanceled));
        }
        Ok(())
    }

    /// Enqueues `bundle`, returning the allocated slot, or `ServicePoolFull`
    /// if the queue is already at capacity.
    pub fn send(&mut self, bundle: MessageBundle) -> Result<Slot, Error> {
        if self.queue_len() >= self.max_queue_size {
            return Err(Error::new(ErrorKind::ServicePoolFull));
        }
        let synchronous = bundle.is_synchronous();
        let wants_response = bundle.wants_response();
        let sender_request_id = bundle.sender_request_id;
        let slot = self.alloc_slot(bundle);
        if synchronous {
            self.sync_queue.push_back(slot.index);
        } else {
            self.async_queue.push_back(slot.index);
        }
        if wants_response && sender_request_id != 0 {
            self.pending_response.insert(sender_request_id, slot.index);
        }
        Ok(slot)
    }

    /// Re-queues an idempotent message at the pool head after connection
    /// loss: idempotent messages survive connection loss by retrying rather
    /// than failing.
    pub fn requeue_at_head(&mut self, index: u32) {
        let entry = &self.entries[index as usize];
        let synchronous = entry
            .bundle
            .as_ref()
            .map(MessageBundle::is_synchronous)
            .unwrap_or(false);
        if synchronous {
            self.sync_queue.push_front(index);
        } else {
            self.async_queue.push_front(index);
        }
        self.entries[index as usize].state = SlotState::Queued;
    }

    /// Returns the next eligible slot index for a connection, respecting
    /// synchronous single-in-flight-per-pool rules.
    ///
    /// `sync_in_flight_elsewhere` must be `true` if some other connection
    /// already owns the pool's one permitted synchronous message.
    pub fn pull(&mut self, sync_in_flight_elsewhere: bool) -> Option<(Slot, &mut MessageBundle)> {
        let index = if !sync_in_flight_elsewhere {
            self.sync_queue
                .pop_front()
                .or_else(|| self.async_queue.pop_front())
        } else {
            self.async_queue.pop_front()
        }?;

        let entry = &mut self.entries[index as usize];
        entry.state = SlotState::InFlight;
        let generation = entry.generation;
        let bundle = entry.bundle.as_mut().expect("allocated slot has a bundle");
        Some((Slot::new(index, generation), bundle))
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut MessageBundle> {
        self.resolve(slot).ok()?;
        self.entries[slot.index as usize].bundle.as_mut()
    }

    /// Cancels a queued or in-flight slot, reporting how the caller must
    /// finish the job (complete locally vs. forward to the owning
    /// connection).
    pub fn cancel(&mut self, slot: Slot) -> Result<CancelOutcome, Error> {
        if self.canceled_ids.contains(&(slot.index, slot.generation)) {
            return Err(Error::new(ErrorKind::ServiceMessageAlreadyCanceled));
        }
        self.resolve(slot)?;
        self.canceled_ids.insert((slot.index, slot.generation));

        let entry = &self.entries[slot.index as usize];
        let outcome = match entry.state {
            SlotState::Queued => {
                self.async_queue.retain(|i| *i != slot.index);
                self.sync_queue.retain(|i| *i != slot.index);
                let bundle = self.take_bundle(slot.index);
                if let Some(b) = bundle {
                    b.completion
                        .notify(CompletionOutcome::err(Error::new(ErrorKind::MessageCanceled)));
                }
                self.free_slot(slot.index);
                CancelOutcome::CompletedLocally
            },
            SlotState::InFlight => {
                let awaiting_response = entry
                    .bundle
                    .as_ref()
                    .map(MessageBundle::wants_response)
                    .unwrap_or(false);
                if awaiting_response {
                    self.complete_in_flight(
                        slot,
                        CompletionOutcome::err(Error::new(ErrorKind::MessageCanceled)),
                    );
                    CancelOutcome::ResponsePending
                } else {
                    CancelOutcome::ForwardToConnection
                }
            },
            SlotState::Free => return Err(Error::new(ErrorKind::ServiceMessageAlreadyCanceled)),
        };
        Ok(outcome)
    }

    fn take_bundle(&mut self, index: u32) -> Option<MessageBundle> {
        self.entries[index as usize].bundle.take()
    }

    /// Completes an in-flight slot locally (used both for the
    /// `ForwardToConnection`/`ResponsePending` cancel paths and for
    /// connection-loss handling of non-idempotent messages).
    pub fn complete_in_flight(&mut self, slot: Slot, outcome: CompletionOutcome) {
        if self.resolve(slot).is_err() {
            return;
        }
        if let Some(sender_request_id) = self.entries[slot.index as usize]
            .bundle
            .as_ref()
            .map(|b| b.sender_request_id)
        {
            self.pending_response.remove(&sender_request_id);
        }
        if let Some(bundle) = self.take_bundle(slot.index) {
            bundle.completion.notify(outcome);
        }
        self.free_slot(slot.index);
    }

    /// Fails the slot awaiting `sender_request_id` with `error` instead of a
    /// response, returning `false` if no such slot is pending (already
    /// completed or never existed on this store). Used when a relayed
    /// request's peer leg is lost or canceled before a response arrives.
    pub fn fail_pending(&mut self, sender_request_id: u32, error: Error) -> bool {
        let Some(index) = self.pending_response.remove(&sender_request_id) else {
            return false;
        };
        if let Some(bundle) = self.take_bundle(index) {
            bundle.completion.notify(CompletionOutcome::err(error));
        }
        self.free_slot(index);
        true
    }

    /// Completes the slot awaiting `sender_request_id` with the response
    /// payload.
    pub fn on_response(
        &mut self,
        sender_request_id: u32,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let index = self
            .pending_response
            .remove(&sender_request_id)
            .ok_or_else(|| Error::new(ErrorKind::ServiceMessageLost))?;
        if let Some(bundle) = self.take_bundle(index) {
            bundle.completion.notify(CompletionOutcome::ok(payload));
        }
        self.free_slot(index);
        Ok(())
    }

    /// Empties the store, completing every message with `MessageConnection`.
    /// A delayed close is handled by the caller instead, repeatedly draining
    /// via `pull`/natural completion rather than calling this.
    pub fn force_close(&mut self) {
        let indices: Vec<u32> = (0..self.entries.len() as u32)
            .filter(|i| self.entries[*i as usize].bundle.is_some())
            .collect();
        for index in indices {
            if let Some(bundle) = self.take_bundle(index) {
                bundle
                    .completion
                    .notify(CompletionOutcome::err(Error::new(ErrorKind::MessageConnection)));
            }
            self.free_slot(index);
        }
        self.async_queue.clear();
        self.sync_queue.clear();
        self.pending_response.clear();
    }

    pub fn is_drained(&self) -> bool {
        self.entries.iter().all(|e| e.bundle.is_none())
    }

    /// Connection-loss handling: returns every currently in-flight slot
    /// along with whether it is idempotent and whether it is a
    /// `OneShotSend`, so the caller can requeue the idempotent ones and fail
    /// the rest — one-shot failures report `MessageCanceled` rather than the
    /// `MessageConnection` used for ordinary `WaitResponse` messages. Does
    /// not itself mutate slot state — the caller drives that via
    /// [`MessageStore::requeue_at_head`] or
    /// [`MessageStore::complete_in_flight`].
    pub fn drain_in_flight_for_loss(&self) -> Vec<(Slot, bool, bool)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == SlotState::InFlight && e.bundle.is_some())
            .map(|(i, e)| {
                let bundle = e.bundle.as_ref().expect("checked above");
                (Slot::new(i as u32, e.generation), bundle.is_idempotent(), bundle.is_one_shot())
            })
            .collect()
    }
}
