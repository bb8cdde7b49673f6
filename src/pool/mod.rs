// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection pool: owns the message store, the set of connections to one
//! named peer, and routing between them.
//!
//! Built around a `DashMap` keyed by a small integer id, an
//! `OnceCell<Weak<Pool>>` self-reference set once after construction so
//! children can hold a weak back-pointer without a reference cycle, and
//! async methods that clone what they need out of a `DashMap` guard before
//! `.await`ing (holding a guard across an await point would deadlock the
//! shard).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU8, Ordering},
    },
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{net::TcpStream, sync::Mutex};
use tracing::{debug, warn};

use crate::{
    cfg::config::Configuration,
    codec::MessageFlags,
    compression::Compressor,
    connection::{Connection, ConnectionConfig, ConnectionEvent},
    error::{Error, ErrorKind},
    ids::Slot,
    message::{CompletionOutcome, MessageBundle},
    protocol::Protocol,
    relay::RelayEngine,
    store::{CancelOutcome, MessageStore},
};

/// A pool's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Active = 0,
    Stopping = 1,
    DelayClosing = 2,
    ForceClosing = 3,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Stopping,
            2 => Self::DelayClosing,
            3 => Self::ForceClosing,
            _ => Self::Active,
        }
    }
}

pub enum CloseMode {
    Delay,
    Force,
}

/// A message pulled from the store, flattened into what a connection's
/// writer needs: the envelope has already been prepended to the payload.
pub struct PulledMessage {
    pub slot: Slot,
    pub bytes: Vec<u8>,
    pub flags: MessageFlags,
}

pub struct Pool {
    pub name: String,
    /// `host/peerName` relay target this pool's messages are routed
    /// through, if any.
    pub relay_target: Option<String>,
    pub index: Slot,
    /// `true` only for pools formed from connections *accepted* by a
    /// relay-enabled listener: their reader treats payload bytes opaquely
    /// and expects a routing-name prefix on the first packet. Pools on the
    /// originating or the relay's own registered-peer side are never
    /// reader-relay-mode — only their writer tags outgoing relayed
    /// messages, which is driven by `relay_target`, not this flag.
    relay_mode: bool,
    /// Set once this pool has been registered with the relay engine under a
    /// peer name: responses arriving on it are routed back through the
    /// relay's translation table instead of this pool's own (nonexistent)
    /// pending-response entries.
    relay_peer_name: OnceCell<String>,
    state: AtomicU8,
    store: Mutex<MessageStore>,
    connections: DashMap<u32, Arc<Connection>>,
    next_connection_index: AtomicU32,
    /// Tie-break cursor for [`Pool::should_pull`]: when several connections
    /// are equally loaded, round-robins among them instead of always
    /// favouring the lowest connection index.
    pull_round_robin: AtomicU32,
    /// Connection slot currently holding the pool's one permitted
    /// synchronous in-flight message, if any.
    sync_owner: Mutex<Option<Slot>>,
    protocol: Arc<Protocol>,
    compressor: Arc<dyn Compressor>,
    relay: Arc<RelayEngine>,
    config: Configuration,
    self_weak: OnceCell<Weak<Pool>>,
}

impl Pool {
    pub fn new(
        name: String,
        relay_target: Option<String>,
        index: Slot,
        protocol: Arc<Protocol>,
        compressor: Arc<dyn Compressor>,
        relay: Arc<RelayEngine>,
        config: Configuration,
        relay_mode: bool,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            name,
            relay_target,
            index,
            relay_mode,
            relay_peer_name: OnceCell::new(),
            state: AtomicU8::new(PoolState::Active as u8),
            store: Mutex::new(MessageStore::new(config.pool_max_message_queue_size)),
            connections: DashMap::new(),
            next_connection_index: AtomicU32::new(0),
            pull_round_robin: AtomicU32::new(0),
            sync_owner: Mutex::new(None),
            protocol,
            compressor,
            relay,
            config,
            self_weak: OnceCell::new(),
        });
        let _ = pool.self_weak.set(Arc::downgrade(&pool));
        pool
    }

    pub fn protocol(&self) -> Arc<Protocol> {
        self.protocol.clone()
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn weak_self(&self) -> Weak<Pool> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    /// Enqueues `bundle`; ensures a connection exists when the pool is under
    /// `pool_max_active_connection_count`.
    ///
    /// A failure to establish that connection (no listener yet, DNS
    /// failure, ...) does not fail the send itself — the message stays
    /// queued and is retried the next time a connection becomes available:
    /// sending to an address with nothing listening queues normally and
    /// only resolves via a later `cancel`.
    pub async fn send(self: &Arc<Self>, bundle: MessageBundle) -> Result<Slot, Error> {
        if self.state() != PoolState::Active {
            return Err(Error::new(ErrorKind::ServicePoolStopping));
        }
        let slot = {
            let mut store = self.store.lock().await;
            store.send(bundle)?
        };
        if let Err(e) = self.ensure_connection().await {
            debug!(pool = %self.name, error = %e, "no connection available yet, message stays queued");
        }
        self.wake_all();
        Ok(slot)
    }

    fn wake_all(&self) {
        for entry in self.connections.iter() {
            entry.value().notify(ConnectionEvent::PoolPush);
        }
    }

    /// Public entry point for callers outside the send path (relay peer
    /// registration) that need a connection to exist without enqueuing a
    /// message.
    pub async fn ensure_connection_public(self: &Arc<Self>) -> Result<(), Error> {
        self.ensure_connection().await
    }

    /// Creates a client connection if fewer than
    /// `pool_max_active_connection_count` already exist and a resolver is
    /// configured.
    async fn ensure_connection(self: &Arc<Self>) -> Result<(), Error> {
        if self.connections.len() as u32 >= self.config.pool_max_active_connection_count {
            return Ok(());
        }
        let Some(resolver) = self.config.client_name_resolver.as_ref() else {
            return Ok(());
        };
        let addrs = resolver(&self.name)
            .await
            .map_err(|_| Error::new(ErrorKind::ConnectionResolveFailure))?;
        let Some(addr) = addrs.into_iter().next() else {
            return Err(Error::new(ErrorKind::ConnectionResolveFailure));
        };
        self.spawn_client_connection(addr).await
    }

    async fn spawn_client_connection(self: &Arc<Self>, addr: SocketAddr) -> Result<(), Error> {
        let index = self.next_connection_index.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::new(index, 0);
        let conn = Connection::connect_client(
            slot,
            self.weak_self(),
            self.protocol.clone(),
            self.compressor.clone(),
            addr,
            self.connection_config(),
        )
        .await?;
        conn.notify(ConnectionEvent::EnterActive);
        self.connections.insert(index, conn);
        Ok(())
    }

    /// Accepts an already-established server-side stream into this pool
    /// (called by [`crate::service::Service`]'s listener loop).
    pub fn accept_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let index = self.next_connection_index.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::new(index, 0);
        let conn = Connection::accept_server(
            slot,
            self.weak_self(),
            self.protocol.clone(),
            self.compressor.clone(),
            stream,
            peer_addr,
            self.connection_config(),
        );
        conn.notify(ConnectionEvent::EnterActive);
        self.connections.insert(index, conn);
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            codec: crate::codec::PacketCodec {
                max_packet_data_size: self.config.max_packet_data_size(),
                recv_buffer_capacity: self.config.connection_recv_buffer_max_capacity_kb as usize * 1024,
            },
            max_message_count_multiplex: self.config.writer.max_message_count_multiplex as usize,
            max_message_count_response_wait: self.config.writer.max_message_count_response_wait as usize,
            max_message_continuous_packet_count: self.config.writer.max_message_continuous_packet_count as usize,
            reader_max_message_count_multiplex: self.config.reader.max_message_count_multiplex as usize,
            connection_inactivity_timeout: self.config.connection_inactivity_timeout(),
            connection_keepalive_timeout: self.config.connection_keepalive_timeout(),
            connection_inactivity_keepalive_count: self.config.connection_inactivity_keepalive_count,
            relay_mode: self.relay_mode,
            compress: self.config.compression_enabled,
        }
    }

    pub async fn sync_in_flight_elsewhere(&self, requesting: Slot) -> bool {
        let owner = *self.sync_owner.lock().await;
        matches!(owner, Some(o) if o != requesting)
    }

    /// Called by a connection's writer loop to pull its next outbound
    /// message. When more than one connection is active for this pool,
    /// `requester` only gets a message when it is the one selected by
    /// [`Pool::should_pull`] — the caller should treat `None` as "not your
    /// turn right now" rather than "queue empty" and simply wait for the
    /// next wake-up.
    pub async fn pull_for_writer(&self, requester: Slot, sync_in_flight_elsewhere: bool) -> Option<PulledMessage> {
        if self.connections.len() > 1 && !self.should_pull(requester.index) {
            return None;
        }
        let mut store = self.store.lock().await;
        let (slot, bundle) = store.pull(sync_in_flight_elsewhere)?;
        let synchronous = bundle.is_synchronous();
        let mut bytes = Vec::with_capacity(bundle.payload.len() + 16);
        if let Some(target_name) = &bundle.relay_target {
            crate::connection::reader::encode_relay_routing_prefix(target_name, &mut bytes);
        } else {
            crate::codec::Envelope {
                type_id: bundle.type_id,
                sender_request_id: bundle.sender_request_id,
                receiver_request_id: bundle.receiver_request_id,
                flags: bundle.flags,
            }
            .encode(&mut bytes);
        }
        bytes.extend_from_slice(&bundle.payload);
        let flags = bundle.flags;
        drop(store);
        if synchronous {
            *self.sync_owner.lock().await = Some(slot);
        }
        Some(PulledMessage { slot, bytes, flags })
    }

    /// Picks which connection is allowed to pull next: the one with the
    /// fewest in-flight messages, round-robining among ties so no single
    /// connection starves the others when load is even.
    fn should_pull(&self, requester_index: u32) -> bool {
        let mut candidates: Vec<(u32, usize)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().in_flight_count()))
            .collect();
        if candidates.is_empty() {
            return true;
        }
        candidates.sort_unstable_by_key(|(index, _)| *index);
        let min_count = candidates.iter().map(|(_, count)| *count).min().expect("non-empty");
        let tied: Vec<u32> = candidates
            .into_iter()
            .filter(|(_, count)| *count == min_count)
            .map(|(index, _)| index)
            .collect();
        if tied.len() == 1 {
            return tied[0] == requester_index;
        }
        let turn = self.pull_round_robin.fetch_add(1, Ordering::Relaxed) as usize % tied.len();
        tied[turn] == requester_index
    }

    pub async fn requeue_at_head(&self, index: u32) {
        self.store.lock().await.requeue_at_head(index);
    }

    /// A message has been fully handed to the socket; fire-and-forget
    /// messages complete right here, `WaitResponse` messages stay in the
    /// store until [`Pool::on_response`] or a terminal error.
    pub async fn note_fully_sent(&self, slot: Slot) {
        let mut store = self.store.lock().await;
        let wants_response = match store.get_mut(slot) {
            Some(bundle) => bundle.wants_response(),
            None => return,
        };
        if !wants_response {
            store.complete_in_flight(slot, CompletionOutcome::sent());
            drop(store);
            *self.sync_owner.lock().await = None;
        }
    }

    pub async fn on_response(&self, sender_request_id: u32, payload: Vec<u8>) -> Result<(), Error> {
        let mut store = self.store.lock().await;
        store.on_response(sender_request_id, payload)?;
        drop(store);
        *self.sync_owner.lock().await = None;
        Ok(())
    }

    /// Fails the pending `WaitResponse` slot for `sender_request_id` with
    /// `error`. Called from this pool's own connection dispatch on receipt
    /// of a `RESPONSE` envelope carrying the `CANCELED` flag — the wire
    /// signal a relay sends back when the peer leg of a relayed request was
    /// lost or canceled before answering — so this pool's own waiting
    /// caller completes immediately instead of sitting until an unrelated
    /// timeout fires.
    pub async fn fail_pending_response(&self, sender_request_id: u32, error: Error) {
        let mut store = self.store.lock().await;
        let completed = store.fail_pending(sender_request_id, error);
        drop(store);
        if completed {
            *self.sync_owner.lock().await = None;
        }
    }

    /// A response arrived on a pool registered with the relay engine: this
    /// pool never sent the request itself, so the response is handed to the
    /// relay engine to forward to whichever connection actually asked for
    /// it, re-framed exactly as received.
    pub async fn relay_forward_response(
        &self,
        type_id: u32,
        receiver_request_id: u32,
        flags: MessageFlags,
        payload: Vec<u8>,
    ) {
        let Some(peer_name) = self.relay_peer_name() else {
            return;
        };
        let mut bytes = Vec::with_capacity(payload.len() + 16);
        crate::codec::Envelope {
            type_id,
            sender_request_id: 0,
            receiver_request_id,
            flags,
        }
        .encode(&mut bytes);
        bytes.extend_from_slice(&payload);
        self.relay.forward_response(peer_name, receiver_request_id, bytes).await;
    }

    /// Sends `reply` back on the exact connection `origin` arrived on.
    pub async fn send_response(
        &self,
        origin: Slot,
        type_id: u32,
        sender_request_id: u32,
        reply: Vec<u8>,
    ) -> Result<(), Error> {
        let Some(conn) = self.connections.get(&origin.index).map(|e| e.value().clone()) else {
            return Err(Error::new(ErrorKind::ServiceUnknownConnection));
        };
        let mut bytes = Vec::with_capacity(reply.len() + 16);
        let flags = MessageFlags::RESPONSE;
        crate::codec::Envelope {
            type_id,
            sender_request_id: 0,
            receiver_request_id: sender_request_id,
            flags,
        }
        .encode(&mut bytes);
        bytes.extend_from_slice(&reply);
        conn.notify(ConnectionEvent::SendDirect { bytes, flags });
        Ok(())
    }

    /// Cancels `slot`, forwarding to the owning connection when needed.
    pub async fn cancel(&self, slot: Slot) -> Result<CancelOutcome, Error> {
        let outcome = {
            let mut store = self.store.lock().await;
            store.cancel(slot)?
        };
        if let CancelOutcome::ForwardToConnection = outcome {
            // The slot is in flight on whichever connection pulled it; since
            // the store no longer tracks which one, broadcast the cancel —
            // only the owning connection's writer will find a matching
            // entry in its ring, the rest are no-ops.
            for entry in self.connections.iter() {
                entry.value().notify(ConnectionEvent::Cancel(slot));
            }
        }
        Ok(outcome)
    }

    /// Connection-loss handling. Idempotent in-flight messages are requeued
    /// at the pool head; ordinary `WaitResponse` messages fail with
    /// `MessageConnection`; `OneShotSend` messages fail with
    /// `MessageCanceled` and are never retried.
    pub async fn connection_lost(&self, conn_id: Slot) {
        self.connections.remove(&conn_id.index);
        *self.sync_owner.lock().await = None;

        let mut store = self.store.lock().await;
        let lost = store.drain_in_flight_for_loss();
        for (slot, idempotent, one_shot) in lost {
            if idempotent {
                store.requeue_at_head(slot.index);
            } else if one_shot {
                store.complete_in_flight(slot, CompletionOutcome::err(Error::new(ErrorKind::MessageCanceled)));
            } else {
                store.complete_in_flight(slot, CompletionOutcome::err(Error::new(ErrorKind::MessageConnection)));
            }
        }
        drop(store);

        if self.state() == PoolState::Active && self.connections.is_empty() {
            warn!(pool = %self.name, "all connections lost, will reconnect on next send");
            if let Some(peer_name) = self.relay_peer_name() {
                self.relay.forget_all_for_peer(peer_name).await;
            }
        }
    }

    /// A relayed message completed framing on this pool's connection; hand
    /// it to the relay engine to forward to the registered peer connection.
    pub async fn relay_deliver(&self, origin: Slot, target_name: &str, payload: Vec<u8>) {
        let Some(conn) = self.connections.get(&origin.index).map(|e| e.value().clone()) else {
            return;
        };
        self.relay.forward(conn, target_name, payload).await;
    }

    /// Closes the pool, delayed (drain in-flight, stop accepting new writes)
    /// or forced (drop everything immediately).
    pub async fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Delay => {
                self.state.store(PoolState::DelayClosing as u8, Ordering::Release);
                for entry in self.connections.iter() {
                    entry.value().stop_delayed();
                }
            },
            CloseMode::Force => {
                self.state.store(PoolState::ForceClosing as u8, Ordering::Release);
                for entry in self.connections.iter() {
                    entry.value().stop_force();
                }
                self.connections.clear();
                self.store.lock().await.force_close();
                *self.sync_owner.lock().await = None;
            },
        }
    }

    pub async fn is_drained(&self) -> bool {
        self.store.lock().await.is_drained() && self.connections.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Any one live connection owned by this pool, for callers (the relay
    /// registration path) that just need a connection to forward bytes on
    /// rather than a specific one.
    pub fn any_connection(&self) -> Option<Arc<Connection>> {
        self.connections.iter().next().map(|e| e.value().clone())
    }

    /// Marks this pool as the relay-registered connection for `peer_name`.
    pub fn mark_relay_peer(&self, peer_name: String) {
        let _ = self.relay_peer_name.set(peer_name);
    }

    pub fn relay_peer_name(&self) -> Option<&str> {
        self.relay_peer_name.get().map(String::as_str)
    }
}

/// Name -> pool handle, owned by [`crate::service::Service`].
pub type PoolRegistry = HashMap<String, Arc<Pool>>;
