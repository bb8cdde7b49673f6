// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed error taxonomy for the mpipc transport engine.
//!
//! A single flat `enum`, grouped by doc comments rather than sub-enums, lets
//! callers `match` on the exact kind instead of comparing against an opaque
//! error code.

use thiserror::Error;

/// Every terminal condition the transport engine can report to application
/// code, grouped (via doc comments, not sub-enums) into five categories:
/// Connection, Message, Reader, Service, Compression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    // --- Connection ---
    #[error("connection: timeout due to inactivity")]
    ConnectionInactivityTimeout,
    #[error("connection: received too many keep-alive packets")]
    ConnectionTooManyKeepAlive,
    #[error("connection: killed")]
    ConnectionKilled,
    #[error("connection: logic error")]
    ConnectionLogic,
    #[error("connection: failed to resolve recipient name")]
    ConnectionResolveFailure,
    #[error("connection: delayed close")]
    ConnectionDelayedClose,
    #[error("connection: cannot enter active state, too many active connections")]
    ConnectionEnterActiveRefused,
    #[error("connection: is stopping")]
    ConnectionStopping,
    #[error("connection: invalid state for requested operation")]
    ConnectionInvalidState,

    // --- Message ---
    #[error("message: canceled")]
    MessageCanceled,
    #[error("message: connection broken")]
    MessageConnection,
    #[error("message: canceled by peer")]
    MessageCanceledByPeer,
    #[error("message: lost (no matching request)")]
    MessageLost,
    #[error("message: already canceled")]
    MessageAlreadyCanceled,

    // --- Reader ---
    #[error("reader: invalid packet header")]
    ReaderInvalidPacketHeader,
    #[error("reader: invalid message switch (continuation on unknown slot)")]
    ReaderInvalidMessageSwitch,
    #[error("reader: too many multiplexed messages")]
    ReaderTooManyMultiplex,

    // --- Service ---
    #[error("service: stopping")]
    ServiceStopping,
    #[error("service: unknown message type")]
    ServiceUnknownMessageType,
    #[error("service: server only, no client resolver configured")]
    ServiceServerOnly,
    #[error("service: unknown recipient")]
    ServiceUnknownRecipient,
    #[error("service: unknown pool")]
    ServiceUnknownPool,
    #[error("service: pool is stopping")]
    ServicePoolStopping,
    #[error("service: pool is full")]
    ServicePoolFull,
    #[error("service: unknown connection")]
    ServiceUnknownConnection,
    #[error("service: too many active connections")]
    ServiceTooManyActiveConnections,
    #[error("service: bad cast of request message")]
    ServiceBadCastRequest,
    #[error("service: bad cast of response message")]
    ServiceBadCastResponse,
    #[error("service: failed to start")]
    ServiceStartFailed,
    #[error("service: failed to start listener")]
    ServiceStartListenerFailed,
    #[error("service: message already canceled")]
    ServiceMessageAlreadyCanceled,
    #[error("service: message lost")]
    ServiceMessageLost,

    // --- Compression ---
    #[error("compression: unavailable")]
    CompressionUnavailable,
    #[error("compression: engine failure")]
    CompressionEngineFailure,
}

/// Top-level error type returned from the public API.
///
/// Wraps an [`ErrorKind`] plus, when available, the underlying I/O or
/// serialization cause: a small `thiserror` leaf for matching, with
/// `anyhow::Error` absorbing arbitrary causes at call sites that only need
/// to propagate, not match.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind}")]
    Kind {
        kind: ErrorKind,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error::Kind { kind, source: None }
    }

    pub fn with_source(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Error::Kind {
            kind,
            source: Some(source.into()),
        }
    }

    /// The classified error kind, when this error carries one. `Error::Io`
    /// variants surfaced from raw socket failures do not map to a specific
    /// kind and return `None`.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            Error::Kind { kind, .. } => Some(kind),
            Error::Io(_) => None,
        }
    }

    pub fn is(&self, kind: &ErrorKind) -> bool {
        self.kind() == Some(kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
