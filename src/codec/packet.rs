// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed-size packet framing: the on-wire header shape and the codec that
//! encodes/decodes it.
//!
//! Every packet on the wire is an 8-byte header followed by `size` bytes of
//! payload. The header is a `zerocopy` struct in network (big-endian) byte
//! order: a transparent-over-bytes struct instead of manual bit-twiddling
//! at every call site.

use bitflags::bitflags;
use zerocopy::{
    BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, U16, U32,
};

use crate::error::{Error, ErrorKind};

/// Size, in bytes, of a [`PacketHeader`] on the wire.
pub const HEADER_LEN: usize = 8;

/// Default cap on `size` (payload bytes following the header): 16 KiB minus
/// the header itself.
pub const DEFAULT_MAX_PACKET_DATA_SIZE: usize = 16 * 1024 - HEADER_LEN;

/// Packet types.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    #[default]
    NewMessage = 1,
    Continuation = 2,
    CancelRequest = 3,
    KeepAlive = 4,
    Update = 5,
    Compressed = 6,
    Ack = 7,
    RelayedNew = 8,
    RelayedContinuation = 9,
}

impl PacketType {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::NewMessage,
            2 => Self::Continuation,
            3 => Self::CancelRequest,
            4 => Self::KeepAlive,
            5 => Self::Update,
            6 => Self::Compressed,
            7 => Self::Ack,
            8 => Self::RelayedNew,
            9 => Self::RelayedContinuation,
            _ => return None,
        })
    }
}

bitflags! {
    /// Packet-level flags: bit 0 end-of-message, bit 1 compressed-inner,
    /// bit 2 relayed, bit 3 synchronous.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const END_OF_MESSAGE = 0b0000_0001;
        const COMPRESSED     = 0b0000_0010;
        const RELAYED        = 0b0000_0100;
        const SYNCHRONOUS    = 0b0000_1000;
    }
}

/// Wire-exact 8-byte packet header: `type:u8, flags:u8, size:u16be,
/// message_id:u32be`.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct RawPacketHeader {
    ty: u8,
    flags: u8,
    size: U16<BigEndian>,
    message_id: U32<BigEndian>,
}

impl RawPacketHeader {
    pub fn new(ty: PacketType, flags: PacketFlags, size: u16, message_id: u32) -> Self {
        Self {
            ty: ty as u8,
            flags: flags.bits(),
            size: U16::new(size),
            message_id: U32::new(message_id),
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.ty)
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_truncate(self.flags)
    }

    pub fn size(&self) -> u16 {
        self.size.get()
    }

    pub fn message_id(&self) -> u32 {
        self.message_id.get()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// A decoded `{header, payload}` pair borrowed from the connection's
/// receive buffer.
#[derive(Debug)]
pub struct Packet<'a> {
    pub header: RawPacketHeader,
    pub payload: &'a [u8],
}

/// Outcome of attempting to decode one packet from a buffer.
pub enum Decoded<'a> {
    Packet(Packet<'a>, usize),
    NeedMore,
}

/// Stateless framing codec: bytes are consumed strictly in order, never
/// buffered internally (the connection's receive ring owns the bytes).
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    pub max_packet_data_size: usize,
    pub recv_buffer_capacity: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_packet_data_size: DEFAULT_MAX_PACKET_DATA_SIZE,
            recv_buffer_capacity: 64 * 1024,
        }
    }
}

impl PacketCodec {
    /// Attempts to decode exactly one packet from the front of `buf`.
    ///
    /// Returns `Decoded::Packet(_, consumed)` when a full header+payload was
    /// present, `Decoded::NeedMore` when `buf` is a valid-so-far prefix
    /// that simply lacks enough bytes yet. Any header content that cannot
    /// possibly be valid (oversized `size`) is a hard error: the connection
    /// must stop.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<Decoded<'a>, Error> {
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::NeedMore);
        }
        let header = RawPacketHeader::read_from_bytes(&buf[..HEADER_LEN])
            .map_err(|_| Error::new(ErrorKind::ReaderInvalidPacketHeader))?;

        if header.packet_type().is_none() {
            return Err(Error::new(ErrorKind::ReaderInvalidPacketHeader));
        }

        let size = header.size() as usize;
        if size > self.max_packet_data_size
            || HEADER_LEN + size > self.recv_buffer_capacity
        {
            return Err(Error::new(ErrorKind::ReaderInvalidPacketHeader));
        }

        // size = 0 is legal only for KeepAlive and for an end-of-message
        // marker packet; any other packet type needs payload or will just
        // carry the end-of-message flag on a regular data packet. We don't
        // reject size=0 here for other types since that's a valid empty
        // continuation/final packet.

        let total = HEADER_LEN + size;
        if buf.len() < total {
            return Ok(Decoded::NeedMore);
        }

        Ok(Decoded::Packet(
            Packet {
                header,
                payload: &buf[HEADER_LEN..total],
            },
            total,
        ))
    }

    /// Encodes a header+payload pair, returning the header bytes and
    /// leaving the payload to be written verbatim by the caller (the
    /// writer fills packets incrementally; see `connection::writer`).
    pub fn encode_header(
        &self,
        ty: PacketType,
        flags: PacketFlags,
        payload_len: usize,
        message_id: u32,
    ) -> Result<[u8; HEADER_LEN], Error> {
        if payload_len > self.max_packet_data_size {
            return Err(Error::new(ErrorKind::ReaderInvalidPacketHeader));
        }
        let header = RawPacketHeader::new(ty, flags, payload_len as u16, message_id);
        Ok(header.to_bytes())
    }
}
