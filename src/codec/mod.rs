// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod envelope;
pub mod packet;
pub mod varint;

pub use envelope::{Envelope, MessageFlags};
pub use packet::{Decoded, Packet, PacketCodec, PacketFlags, PacketType, RawPacketHeader};
