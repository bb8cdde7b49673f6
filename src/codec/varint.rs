// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! "Cross-encoded" integers used inside the message envelope: a leading byte
//! `n <= 8` giving the number of following little-endian bytes, then those
//! `n` bytes. `n == 0` encodes the value `0`.

use crate::error::{Error, ErrorKind};

/// Encodes `v` and appends it to `out`.
pub fn encode_u64(v: u64, out: &mut Vec<u8>) {
    if v == 0 {
        out.push(0);
        return;
    }
    let bytes = v.to_le_bytes();
    let n = 8 - (v.leading_zeros() as usize / 8);
    out.push(n as u8);
    out.extend_from_slice(&bytes[..n]);
}

/// Decodes a cross-encoded integer from the front of `buf`, returning the
/// value and the number of bytes consumed.
pub fn decode_u64(buf: &[u8]) -> Result<(u64, usize), Error> {
    let n = *buf
        .first()
        .ok_or_else(|| Error::new(ErrorKind::ReaderInvalidMessageSwitch))? as usize;
    if n > 8 {
        return Err(Error::new(ErrorKind::ReaderInvalidMessageSwitch));
    }
    if buf.len() < 1 + n {
        return Err(Error::new(ErrorKind::ReaderInvalidMessageSwitch));
    }
    let mut raw = [0u8; 8];
    raw[..n].copy_from_slice(&buf[1..1 + n]);
    Ok((u64::from_le_bytes(raw), 1 + n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_boundary_values() {
        for v in [0u64, 1, 255, 256, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_u64(v, &mut buf);
            let (decoded, consumed) = decode_u64(&buf).expect("decode");
            assert_eq!(decoded, v);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn zero_encodes_to_single_byte() {
        let mut buf = Vec::new();
        encode_u64(0, &mut buf);
        assert_eq!(buf, vec![0]);
    }
}
