// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Relay engine: forwards framed packets between two named connections
//! without deserializing payloads.
//!
//! A connection is registered under a peer name (the part after the `/` in
//! a `host/peerName` recipient); when a relayed message completes framing on
//! the ingress side, the engine peeks the message envelope's
//! `sender_request_id` (never the business payload) and hands the whole
//! envelope+payload verbatim to the registered peer's connection, keeping a
//! translation table keyed by `(peer name, sender_request_id)` so the
//! eventual response can be routed back to the connection that asked for it
//! without either side ever deserializing the message body.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    codec::{Envelope, MessageFlags, PacketFlags, PacketType},
    connection::{Connection, ConnectionEvent},
};

struct Registration {
    connection: Arc<Connection>,
}

/// Shared across every pool in a `Service`: a lock-free `DashMap` backs both
/// tables rather than a hand-rolled mutex-guarded map, since lookups happen
/// from whichever connection task needs them concurrently.
#[derive(Default)]
pub struct RelayEngine {
    /// peer name -> the connection registered to receive on its behalf.
    registrations: DashMap<String, Registration>,
    /// `(peer name the message was forwarded to, sender_request_id)` ->
    /// the origin connection a response should be handed back to.
    translation: DashMap<(String, u32), Arc<Connection>>,
    next_local_id: AtomicU32,
}

impl RelayEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A connection announces it serves as the relay endpoint for
    /// `peer_name`.
    pub fn register(&self, peer_name: String, connection: Arc<Connection>) {
        self.registrations.insert(peer_name, Registration { connection });
    }

    pub fn unregister(&self, peer_name: &str) {
        self.registrations.remove(peer_name);
    }

    /// Splits a `host/peerName`-style recipient into the transport address
    /// part and the relay peer name, if present.
    pub fn split_recipient(name: &str) -> (&str, Option<&str>) {
        match name.split_once('/') {
            Some((host, peer)) => (host, Some(peer)),
            None => (name, None),
        }
    }

    /// Forwards a fully-framed relayed message received from `origin`
    /// toward the connection registered under `target_name`. `payload` is
    /// the envelope followed by the typed body, byte-identical to what the
    /// origin would have sent over a direct connection to the target.
    ///
    /// If the target connection has already exited, the just-registered
    /// translation entry is forgotten immediately and `origin` is told its
    /// request was canceled rather than left to wait for a response that
    /// will never come.
    pub async fn forward(&self, origin: Arc<Connection>, target_name: &str, payload: Vec<u8>) {
        let Some(entry) = self.registrations.get(target_name) else {
            debug!(peer = target_name, "relay: no registration for peer, dropping");
            return;
        };
        let target = entry.connection.clone();
        drop(entry);

        let envelope = Envelope::decode(&payload).ok().map(|(e, _)| e);
        let tracked = envelope
            .as_ref()
            .map(|e| !e.flags.contains(MessageFlags::ONE_SHOT_SEND) || e.sender_request_id != 0)
            .unwrap_or(false);
        if tracked {
            if let Some(e) = &envelope {
                self.translation
                    .insert((target_name.to_string(), e.sender_request_id), origin);
            }
        }

        let target_local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let delivered = target.notify(ConnectionEvent::RelayForward {
            local_id: target_local_id,
            packet_type: PacketType::NewMessage,
            packet_flags: PacketFlags::END_OF_MESSAGE,
            payload,
        });
        if !delivered && tracked {
            if let Some(e) = envelope {
                self.forget(target_name, e.sender_request_id).await;
            }
        }
    }

    /// Routes a response arriving on a relay-registered peer pool back to
    /// whichever connection originated the request it answers, re-framed
    /// exactly as the peer sent it.
    pub async fn forward_response(&self, registered_peer_name: &str, sender_request_id: u32, payload: Vec<u8>) {
        let Some((_, origin)) = self.translation.remove(&(registered_peer_name.to_string(), sender_request_id))
        else {
            debug!(
                peer = registered_peer_name,
                sender_request_id, "relay: no pending translation entry for response, dropping"
            );
            return;
        };
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        origin.notify(ConnectionEvent::RelayForward {
            local_id,
            packet_type: PacketType::NewMessage,
            packet_flags: PacketFlags::END_OF_MESSAGE,
            payload,
        });
    }

    /// Drops the pending translation entry for `(registered_peer_name,
    /// sender_request_id)` and tells `origin` over the wire that the
    /// request it is waiting on was canceled, rather than leaving it to
    /// time out on its own connection's unrelated activity/keepalive
    /// timeout. `origin` is the relay's own ingress connection from the
    /// true requester, a different process with its own `Pool` and
    /// `MessageStore` than this relay's — the only channel back to it is
    /// the socket, so this sends a `RESPONSE | CANCELED` envelope exactly
    /// as `forward_response` sends a real response, and lets the
    /// requester's own connection dispatch resolve its pending slot.
    pub async fn forget(&self, registered_peer_name: &str, sender_request_id: u32) {
        if let Some((_, origin)) = self.translation.remove(&(registered_peer_name.to_string(), sender_request_id)) {
            self.notify_origin_canceled(&origin, sender_request_id);
        }
    }

    /// Drops every pending translation entry forwarded toward
    /// `registered_peer_name`, called when that peer's connection is lost,
    /// and tells each origin over the wire that its request was canceled,
    /// the same way [`RelayEngine::forget`] does for a single entry.
    pub async fn forget_all_for_peer(&self, registered_peer_name: &str) {
        let stale: Vec<(u32, Arc<Connection>)> = self
            .translation
            .iter()
            .filter(|entry| entry.key().0 == registered_peer_name)
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect();
        self.translation.retain(|(peer, _), _| peer != registered_peer_name);
        for (sender_request_id, origin) in stale {
            self.notify_origin_canceled(&origin, sender_request_id);
        }
    }

    /// Writes a zero-payload `RESPONSE | CANCELED` envelope to `origin`,
    /// framed exactly like a real relayed response. The origin's own
    /// connection dispatch decodes the `CANCELED` flag and fails its
    /// waiting slot locally instead of completing it with a payload.
    fn notify_origin_canceled(&self, origin: &Arc<Connection>, sender_request_id: u32) {
        let mut bytes = Vec::with_capacity(16);
        Envelope {
            type_id: 0,
            sender_request_id: 0,
            receiver_request_id: sender_request_id,
            flags: MessageFlags::RESPONSE | MessageFlags::CANCELED,
        }
        .encode(&mut bytes);
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        origin.notify(ConnectionEvent::RelayForward {
            local_id,
            packet_type: PacketType::NewMessage,
            packet_flags: PacketFlags::END_OF_MESSAGE,
            payload: bytes,
        });
    }
}
