// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection message writer: selects the next message to serialize
//! given flag constraints, fragments it into packets honouring
//! `MaxPacketDataSize`, and tracks the synchronous/multiplex limits.

use std::collections::VecDeque;

use crate::{
    codec::{MessageFlags, PacketFlags, PacketType},
    compression::Compressor,
    error::Error,
    ids::Slot,
};

/// One message actively being serialized by this connection's writer.
struct WriteSlot {
    /// Connection-local packet `message-id` (distinct from the pool's
    /// [`Slot`] — a fresh small counter scoped to this connection).
    local_id: u32,
    pool_slot: Slot,
    payload: Vec<u8>,
    cursor: usize,
    flags: MessageFlags,
    first_packet_sent: bool,
    waiting_response: bool,
}

/// One packet's worth of bytes ready to hand to the socket, plus which pool
/// slot it came from (so the caller can mark it in-flight/complete in the
/// store).
pub struct PreparedPacket {
    pub pool_slot: Slot,
    pub local_id: u32,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub payload: Vec<u8>,
    /// Set once this was the final packet emitted for `pool_slot` — the
    /// caller should consider the message fully handed off to the socket
    /// (not yet *delivered* — that's the peer's `Ack`/response).
    pub message_complete: bool,
}

pub struct MessageWriter {
    ring: VecDeque<WriteSlot>,
    max_multiplex: usize,
    max_response_wait: usize,
    response_wait_count: usize,
    sync_in_progress: bool,
    next_local_id: u32,
    max_packet_data_size: usize,
    /// Cap on consecutive packets served from the front-most ring slot
    /// before it is rotated to the back, giving every other in-flight
    /// message a turn.
    max_continuous_packets: usize,
    continuous_count: usize,
}

impl MessageWriter {
    pub fn new(
        max_multiplex: usize,
        max_response_wait: usize,
        max_packet_data_size: usize,
        max_continuous_packets: usize,
    ) -> Self {
        Self {
            ring: VecDeque::new(),
            max_multiplex,
            max_response_wait,
            response_wait_count: 0,
            sync_in_progress: false,
            next_local_id: 1,
            max_packet_data_size,
            max_continuous_packets: max_continuous_packets.max(1),
            continuous_count: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.ring.len() < self.max_multiplex
    }

    /// Whether a synchronous message may currently be admitted: asynchronous
    /// messages may be interleaved freely, but never two synchronous
    /// messages at once.
    pub fn can_admit(&self, synchronous: bool) -> bool {
        if !self.has_capacity() {
            return false;
        }
        if synchronous && self.sync_in_progress {
            return false;
        }
        if synchronous {
            return true;
        }
        // WaitResponse back-pressure, step 6.
        true
    }

    pub fn admit_response_wait(&mut self) -> bool {
        if self.response_wait_count >= self.max_response_wait {
            return false;
        }
        self.response_wait_count += 1;
        true
    }

    /// Admits a newly pulled pool slot into the ring, returning the
    /// connection-local id assigned to it.
    pub fn admit(&mut self, pool_slot: Slot, payload: Vec<u8>, flags: MessageFlags) -> u32 {
        let local_id = self.next_local_id;
        self.next_local_id = self.next_local_id.wrapping_add(1).max(1);
        let synchronous = flags.contains(MessageFlags::SYNCHRONOUS);
        if synchronous {
            self.sync_in_progress = true;
        }
        self.ring.push_back(WriteSlot {
            local_id,
            pool_slot,
            payload,
            cursor: 0,
            flags,
            first_packet_sent: false,
            waiting_response: false,
        });
        local_id
    }

    /// Produces the next packet to write, advancing the front-most slot in
    /// the ring (round-robin within capacity). Returns `None` when there is
    /// nothing queued to serialize right now.
    pub fn next_packet(
        &mut self,
        compressor: &dyn Compressor,
        compress: bool,
    ) -> Result<Option<PreparedPacket>, Error> {
        let Some(slot) = self.ring.front_mut() else {
            return Ok(None);
        };

        let remaining = slot.payload.len() - slot.cursor;
        let take = remaining.min(self.max_packet_data_size);
        let mut chunk = slot.payload[slot.cursor..slot.cursor + take].to_vec();
        slot.cursor += take;
        let is_last = slot.cursor >= slot.payload.len();

        let mut packet_flags = PacketFlags::empty();
        if is_last {
            packet_flags |= PacketFlags::END_OF_MESSAGE;
        }
        if slot.flags.contains(MessageFlags::SYNCHRONOUS) {
            packet_flags |= PacketFlags::SYNCHRONOUS;
        }
        if slot.flags.contains(MessageFlags::RELAYED) {
            packet_flags |= PacketFlags::RELAYED;
        }

        let packet_type = if !slot.first_packet_sent {
            slot.first_packet_sent = true;
            if slot.flags.contains(MessageFlags::RELAYED) {
                PacketType::RelayedNew
            } else {
                PacketType::NewMessage
            }
        } else if slot.flags.contains(MessageFlags::RELAYED) {
            PacketType::RelayedContinuation
        } else {
            PacketType::Continuation
        };

        if compress && compressor.should_compress(&chunk) {
            chunk = compressor.compress(&chunk)?;
            packet_flags |= PacketFlags::COMPRESSED;
        }

        let pool_slot = slot.pool_slot;
        let local_id = slot.local_id;
        let synchronous = slot.flags.contains(MessageFlags::SYNCHRONOUS);
        let waiting_response = slot.flags.contains(MessageFlags::WAIT_RESPONSE);

        if is_last {
            self.ring.pop_front();
            self.continuous_count = 0;
            if synchronous {
                self.sync_in_progress = false;
            }
            if waiting_response {
                // response_wait_count is released when the response or a
                // terminal error actually completes the slot in the store,
                // not merely once it's been written — tracked by the
                // connection via `release_response_wait`.
            }
        } else {
            self.continuous_count += 1;
            if self.continuous_count >= self.max_continuous_packets && self.ring.len() > 1 {
                self.ring.rotate_left(1);
                self.continuous_count = 0;
            }
        }

        Ok(Some(PreparedPacket {
            pool_slot,
            local_id,
            packet_type,
            packet_flags,
            payload: chunk,
            message_complete: is_last,
        }))
    }

    pub fn release_response_wait(&mut self) {
        self.response_wait_count = self.response_wait_count.saturating_sub(1);
    }

    /// Aborts a slot's remaining writes for a cancel request. Returns
    /// `true` if the slot was found (and thus a `CancelRequest` packet
    /// should be emitted for its `local_id`).
    pub fn abort(&mut self, pool_slot: Slot) -> Option<u32> {
        if let Some(pos) = self.ring.iter().position(|s| s.pool_slot == pool_slot) {
            let slot = self.ring.remove(pos).expect("position just found");
            if slot.flags.contains(MessageFlags::SYNCHRONOUS) {
                self.sync_in_progress = false;
            }
            return Some(slot.local_id);
        }
        None
    }

    pub fn in_flight_count(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::compression::NoCompressor;

    use super::*;

    #[test]
    fn fragments_large_payload_across_packets() {
        let mut writer = MessageWriter::new(4, 4, 4, 4);
        writer.admit(Slot::new(0, 0), vec![1, 2, 3, 4, 5, 6, 7], MessageFlags::empty());
        let p1 = writer
            .next_packet(&NoCompressor, false)
            .unwrap()
            .expect("first packet");
        assert_eq!(p1.payload, vec![1, 2, 3, 4]);
        assert!(!p1.message_complete);
        assert_eq!(p1.packet_type, PacketType::NewMessage);

        let p2 = writer
            .next_packet(&NoCompressor, false)
            .unwrap()
            .expect("second packet");
        assert_eq!(p2.payload, vec![5, 6, 7]);
        assert!(p2.message_complete);
        assert_eq!(p2.packet_type, PacketType::Continuation);
        assert!(p2.packet_flags.contains(PacketFlags::END_OF_MESSAGE));
    }

    #[test]
    fn only_one_synchronous_message_admitted_at_a_time() {
        let mut writer = MessageWriter::new(4, 4, 64, 4);
        assert!(writer.can_admit(true));
        writer.admit(Slot::new(0, 0), vec![1], MessageFlags::SYNCHRONOUS);
        assert!(!writer.can_admit(true));
        assert!(writer.can_admit(false));
    }

    #[test]
    fn abort_removes_slot_and_releases_sync_gate() {
        let mut writer = MessageWriter::new(4, 4, 64, 4);
        let slot = Slot::new(2, 0);
        writer.admit(slot, vec![1, 2, 3], MessageFlags::SYNCHRONOUS);
        assert!(writer.abort(slot).is_some());
        assert!(writer.can_admit(true));
    }

    #[test]
    fn two_async_messages_interleave_instead_of_serializing_one_at_a_time() {
        let mut writer = MessageWriter::new(4, 4, 1, 1);
        let first = Slot::new(0, 0);
        let second = Slot::new(1, 0);
        writer.admit(first, vec![1, 2], MessageFlags::empty());
        writer.admit(second, vec![9, 9], MessageFlags::empty());

        let p1 = writer.next_packet(&NoCompressor, false).unwrap().expect("packet");
        assert_eq!(p1.pool_slot, first);
        let p2 = writer.next_packet(&NoCompressor, false).unwrap().expect("packet");
        assert_eq!(p2.pool_slot, second, "ring rotated to the other message after one packet");
        let p3 = writer.next_packet(&NoCompressor, false).unwrap().expect("packet");
        assert_eq!(p3.pool_slot, first, "ring rotated back");
    }

    #[test]
    fn continuous_packet_cap_forces_rotation_before_a_message_drains() {
        let mut writer = MessageWriter::new(4, 4, 1, 2);
        let first = Slot::new(0, 0);
        let second = Slot::new(1, 0);
        writer.admit(first, vec![1, 2, 3, 4], MessageFlags::empty());
        writer.admit(second, vec![9], MessageFlags::empty());

        let p1 = writer.next_packet(&NoCompressor, false).unwrap().expect("packet");
        assert_eq!(p1.pool_slot, first);
        let p2 = writer.next_packet(&NoCompressor, false).unwrap().expect("packet");
        assert_eq!(p2.pool_slot, first, "cap of 2 not yet reached");
        let p3 = writer.next_packet(&NoCompressor, false).unwrap().expect("packet");
        assert_eq!(p3.pool_slot, second, "cap reached, ring rotates even mid-message");
    }
}
