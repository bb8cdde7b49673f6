// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Service façade: owns the pool registry, the protocol registry, and the
//! configuration; exposes the public send/cancel/close API.
//!
//! The pool registry is sharded behind a small bank of mutexes
//! (`pools_mutex_count`), picked by a hash of the pool name, built with
//! `tokio::sync::Mutex` since pool creation briefly awaits (connecting out
//! to a freshly-named peer).

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
};

use tokio::{net::TcpListener, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::Configuration,
    compression::{Compressor, DeflateCompressor, NoCompressor},
    error::{Error, ErrorKind},
    ids::{RecipientId, Slot},
    message::{CompletionOutcome, MessageBundle, SlotCompletion},
    pool::{CloseMode, Pool},
    protocol::{Protocol, SharedProtocol},
    relay::RelayEngine,
};

struct Shard {
    pools: std::collections::HashMap<String, Arc<Pool>>,
}

/// Owns every pool for one configuration; the entry point applications hold
/// onto.
pub struct Service {
    shards: Vec<Mutex<Shard>>,
    next_pool_index: std::sync::atomic::AtomicU32,
    protocol: SharedProtocol,
    compressor: Arc<dyn Compressor>,
    relay: Arc<RelayEngine>,
    config: Configuration,
    listener_cancel: CancellationToken,
}

/// Parameters controlling one `send` call: fire-and-forget, synchronous,
/// idempotent-retry, and wait-for-response behavior all compose freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub synchronous: bool,
    pub one_shot: bool,
    pub idempotent: bool,
    pub wait_response: bool,
}

impl Service {
    pub fn new(protocol: Protocol, config: Configuration) -> Arc<Self> {
        let compressor: Arc<dyn Compressor> = if config.compression_enabled {
            Arc::new(DeflateCompressor::default())
        } else {
            Arc::new(NoCompressor)
        };
        let shard_count = config.pools_mutex_count.max(1) as usize;
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    pools: std::collections::HashMap::new(),
                })
            })
            .collect();

        Arc::new(Self {
            shards,
            next_pool_index: std::sync::atomic::AtomicU32::new(0),
            protocol: Arc::new(protocol),
            compressor,
            relay: RelayEngine::new(),
            config,
            listener_cancel: CancellationToken::new(),
        })
    }

    fn shard_for(&self, name: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Starts the service: if `server_listener_address_str` is set, begins
    /// accepting inbound connections. The protocol registry is frozen
    /// (already `Arc`) at this point and never mutated again.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if !self.config.is_server() {
            return Ok(());
        }
        let addr: SocketAddr = self
            .config
            .server_listener_address_str
            .parse()
            .map_err(|e| Error::with_source(ErrorKind::ServiceStartListenerFailed, anyhow::anyhow!("{e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::with_source(ErrorKind::ServiceStartListenerFailed, e))?;
        info!(%addr, "mpipc service listening");

        let service = self.clone();
        let cancel = self.listener_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => service.on_accept(stream, peer_addr).await,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_accept(self: &Arc<Self>, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        // Inbound connections join a pool named after the peer's address
        // until an application-level handshake identifies a symbolic name;
        // that handshake step itself is out of scope here.
        let pool = self
            .resolve_or_create_pool_inner(&peer_addr.to_string(), self.config.relay_enabled)
            .await;
        pool.accept_connection(stream, peer_addr);
    }

    pub fn stop_listener(&self) {
        self.listener_cancel.cancel();
    }

    async fn resolve_or_create_pool(self: &Arc<Self>, name: &str) -> Arc<Pool> {
        self.resolve_or_create_pool_inner(name, false).await
    }

    /// `relay_mode` is only ever `true` for pools formed from connections a
    /// relay-enabled listener accepts — every other caller (outgoing sends,
    /// relay peer registration) gets a plain pool whose reader decodes
    /// envelopes normally.
    async fn resolve_or_create_pool_inner(self: &Arc<Self>, name: &str, relay_mode: bool) -> Arc<Pool> {
        let shard = self.shard_for(name);
        let mut guard = shard.lock().await;
        if let Some(pool) = guard.pools.get(name) {
            return pool.clone();
        }
        let index = self.next_pool_index.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (transport_name, relay_peer) = RelayEngine::split_recipient(name);
        let pool = Pool::new(
            transport_name.to_string(),
            relay_peer.map(str::to_string),
            Slot::new(index, 0),
            self.protocol.clone(),
            self.compressor.clone(),
            self.relay.clone(),
            self.config.clone(),
            relay_mode,
        );
        guard.pools.insert(name.to_string(), pool.clone());
        pool
    }

    /// Creates or resolves the pool named `recipient_name`, producing a
    /// `RecipientId`.
    pub async fn resolve(self: &Arc<Self>, recipient_name: &str) -> RecipientId {
        let pool = self.resolve_or_create_pool(recipient_name).await;
        RecipientId::pool_only(pool.index)
    }

    /// Sends pre-serialized `payload` (already produced by
    /// [`Protocol::encode`]) to `recipient_name`, returning a completion
    /// future. The returned receiver resolves exactly once: completions are
    /// the sole asynchronous error channel.
    pub async fn send_bytes(
        self: &Arc<Self>,
        recipient_name: &str,
        type_id: u32,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> Result<(Slot, tokio::sync::oneshot::Receiver<CompletionOutcome>), Error> {
        let pool = self.resolve_or_create_pool(recipient_name).await;

        let mut flags = crate::codec::MessageFlags::empty();
        if options.synchronous {
            flags |= crate::codec::MessageFlags::SYNCHRONOUS;
        }
        if options.one_shot {
            flags |= crate::codec::MessageFlags::ONE_SHOT_SEND;
        }
        if options.idempotent {
            flags |= crate::codec::MessageFlags::IDEMPOTENT;
        }
        if options.wait_response {
            flags |= crate::codec::MessageFlags::WAIT_RESPONSE;
        }
        if pool.relay_target.is_some() {
            flags |= crate::codec::MessageFlags::RELAYED;
        }

        // Even a pure fire-and-forget send keeps a completion channel, so a
        // broken connection can still report `MessageCanceled` without a
        // retry.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let completion = SlotCompletion::Notify(tx);

        let sender_request_id = if options.wait_response { next_request_id() } else { 0 };

        let bundle = MessageBundle {
            type_id,
            payload,
            flags,
            sender_request_id,
            receiver_request_id: 0,
            completion,
            retry_count: 0,
            enqueue_time: std::time::Instant::now(),
            secure_required: false,
            relay_target: pool.relay_target.clone(),
        };

        let slot = pool.send(bundle).await?;
        Ok((slot, rx))
    }

    /// Typed convenience wrapper over [`Service::send_bytes`].
    pub async fn send<T: crate::message::MessageType>(
        self: &Arc<Self>,
        recipient_name: &str,
        type_id: u32,
        value: &T,
        options: SendOptions,
    ) -> Result<(Slot, tokio::sync::oneshot::Receiver<CompletionOutcome>), Error> {
        let payload = Protocol::encode(value)?;
        self.send_bytes(recipient_name, type_id, payload, options).await
    }

    /// Relay registration: ensures a (client) connection to `pool_name`
    /// exists and registers it with the relay engine under `peer_name`, so
    /// that relayed messages addressed to `peer_name` are forwarded onto
    /// this connection.
    pub async fn register_relay_peer(self: &Arc<Self>, peer_name: &str, pool_name: &str) -> Result<(), Error> {
        let pool = self.resolve_or_create_pool(pool_name).await;
        pool.ensure_connection_public().await?;
        let Some(connection) = pool.any_connection() else {
            return Err(Error::new(ErrorKind::ConnectionResolveFailure));
        };
        pool.mark_relay_peer(peer_name.to_string());
        self.relay.register(peer_name.to_string(), connection);
        Ok(())
    }

    /// Cancels an in-flight message, surfaced through the service.
    pub async fn cancel(self: &Arc<Self>, recipient_name: &str, slot: Slot) -> Result<(), Error> {
        let pool = self.resolve_or_create_pool(recipient_name).await;
        pool.cancel(slot).await?;
        Ok(())
    }

    /// Force- or delay-closes a named pool.
    pub async fn close_pool(self: &Arc<Self>, recipient_name: &str, mode: CloseMode) {
        let shard = self.shard_for(recipient_name);
        let pool = {
            let guard = shard.lock().await;
            guard.pools.get(recipient_name).cloned()
        };
        if let Some(pool) = pool {
            pool.close(mode).await;
        }
    }

    /// Reconfigure: stop all pools, replace the configuration, restart.
    /// Returns a fresh `Service` sharing the same protocol registry (still
    /// read-only) but a new configuration; callers swap their held
    /// `Arc<Service>` for the result.
    pub async fn reconfigure(self: &Arc<Self>, new_config: Configuration) -> Arc<Self> {
        for shard in &self.shards {
            let guard = shard.lock().await;
            for pool in guard.pools.values() {
                pool.close(CloseMode::Force).await;
            }
        }
        self.stop_listener();
        Arc::new(Self {
            shards: (0..new_config.pools_mutex_count.max(1) as usize)
                .map(|_| Mutex::new(Shard { pools: std::collections::HashMap::new() }))
                .collect(),
            next_pool_index: std::sync::atomic::AtomicU32::new(0),
            protocol: self.protocol.clone(),
            compressor: if new_config.compression_enabled {
                Arc::new(DeflateCompressor::default()) as Arc<dyn Compressor>
            } else {
                Arc::new(NoCompressor)
            },
            relay: RelayEngine::new(),
            config: new_config,
            listener_cancel: CancellationToken::new(),
        })
    }

    pub fn protocol(&self) -> SharedProtocol {
        self.protocol.clone()
    }
}

fn next_request_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    loop {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}
