// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Message envelope carried at the start of the first packet of a message:
//! `version:u8, type_id:varint, sender_request_id:u32be,
//! receiver_request_id:u32be, flags:u16be`, followed by the typed payload.

use bitflags::bitflags;

use crate::{
    codec::varint,
    error::{Error, ErrorKind},
};

pub const ENVELOPE_VERSION: u8 = 1;

bitflags! {
    /// Message-level flags carried in the envelope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u16 {
        const SYNCHRONOUS    = 0b0000_0001;
        const ONE_SHOT_SEND  = 0b0000_0010;
        const IDEMPOTENT     = 0b0000_0100;
        const WAIT_RESPONSE  = 0b0000_1000;
        const RESPONSE       = 0b0001_0000;
        const CANCELED       = 0b0010_0000;
        const RELAYED        = 0b0100_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub type_id: u32,
    pub sender_request_id: u32,
    pub receiver_request_id: u32,
    pub flags: MessageFlags,
}

impl Envelope {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(ENVELOPE_VERSION);
        varint::encode_u64(self.type_id as u64, out);
        out.extend_from_slice(&self.sender_request_id.to_be_bytes());
        out.extend_from_slice(&self.receiver_request_id.to_be_bytes());
        out.extend_from_slice(&self.flags.bits().to_be_bytes());
    }

    /// Decodes the envelope header from the front of `buf`, returning the
    /// envelope and the number of bytes consumed (the remainder of `buf`
    /// is the typed payload).
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
        let mut off = 0usize;
        let version = *buf
            .first()
            .ok_or_else(|| Error::new(ErrorKind::ReaderInvalidMessageSwitch))?;
        if version != ENVELOPE_VERSION {
            return Err(Error::new(ErrorKind::ReaderInvalidMessageSwitch));
        }
        off += 1;

        let (type_id, n) = varint::decode_u64(&buf[off..])?;
        off += n;

        let read_u32 = |b: &[u8], at: usize| -> Result<u32, Error> {
            let slice = b
                .get(at..at + 4)
                .ok_or_else(|| Error::new(ErrorKind::ReaderInvalidMessageSwitch))?;
            Ok(u32::from_be_bytes(slice.try_into().expect("4 bytes")))
        };

        let sender_request_id = read_u32(buf, off)?;
        off += 4;
        let receiver_request_id = read_u32(buf, off)?;
        off += 4;
        let flags_slice = buf
            .get(off..off + 2)
            .ok_or_else(|| Error::new(ErrorKind::ReaderInvalidMessageSwitch))?;
        let flags = MessageFlags::from_bits_truncate(u16::from_be_bytes(
            flags_slice.try_into().expect("2 bytes"),
        ));
        off += 2;

        Ok((
            Envelope {
                type_id: type_id as u32,
                sender_request_id,
                receiver_request_id,
                flags,
            },
            off,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let env = Envelope {
            type_id: 42,
            sender_request_id: 7,
            receiver_request_id: 0,
            flags: MessageFlags::WAIT_RESPONSE | MessageFlags::SYNCHRONOUS,
        };
        let mut buf = Vec::new();
        env.encode(&mut buf);
        let (decoded, consumed) = Envelope::decode(&buf).expect("decode");
        assert_eq!(decoded, env);
        assert_eq!(consumed, buf.len());
    }
}
