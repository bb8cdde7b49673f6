// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pluggable packet-body compression.
//!
//! `Compressor` is a trait object an application can swap out rather than a
//! hard-wired library, with a real default built on `flate2` (DEFLATE).
//!
//! Compression wraps only the packet *payload*; the envelope header riding
//! inside the first packet of a message is compressed along with the rest of
//! that packet's payload bytes (it has already been serialized into the
//! payload buffer by the time the writer considers compression), not treated
//! specially.

use std::io::{Read, Write};

use flate2::{
    Compression,
    read::DeflateDecoder,
    write::DeflateEncoder,
};

use crate::error::{Error, ErrorKind};

/// Packets below this size are not worth the round-trip through the
/// compressor.
pub const DEFAULT_COMPRESSIBILITY_THRESHOLD: usize = 256;

pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, Error>;
    fn decompress(&self, input: &[u8], expected_len_hint: usize) -> Result<Vec<u8>, Error>;

    /// Whether `payload` is worth compressing at all. Default: larger than
    /// [`DEFAULT_COMPRESSIBILITY_THRESHOLD`].
    fn should_compress(&self, payload: &[u8]) -> bool {
        payload.len() >= DEFAULT_COMPRESSIBILITY_THRESHOLD
    }
}

/// DEFLATE-based default compressor.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    pub level: u32,
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl Compressor for DeflateCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
        enc.write_all(input)
            .map_err(|e| Error::with_source(ErrorKind::CompressionEngineFailure, e))?;
        enc.finish()
            .map_err(|e| Error::with_source(ErrorKind::CompressionEngineFailure, e))
    }

    fn decompress(&self, input: &[u8], expected_len_hint: usize) -> Result<Vec<u8>, Error> {
        let mut dec = DeflateDecoder::new(input);
        let mut out = Vec::with_capacity(expected_len_hint.max(input.len()));
        dec.read_to_end(&mut out)
            .map_err(|e| Error::with_source(ErrorKind::CompressionEngineFailure, e))?;
        Ok(out)
    }
}

/// A compressor that always reports itself unavailable; used when
/// `Configuration` does not set one and a `Compressed` packet is still
/// received from a peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn compress(&self, _input: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::new(ErrorKind::CompressionUnavailable))
    }

    fn decompress(&self, _input: &[u8], _expected_len_hint: usize) -> Result<Vec<u8>, Error> {
        Err(Error::new(ErrorKind::CompressionUnavailable))
    }

    fn should_compress(&self, _payload: &[u8]) -> bool {
        false
    }
}
