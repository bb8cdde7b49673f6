// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection object: owns one TCP (optionally TLS) stream, holds the
//! reader and writer, drives the state machine, and posts events back to
//! its owning pool.
//!
//! The stream is split into `OwnedReadHalf`/`OwnedWriteHalf`, each wrapped
//! in its own `tokio::sync::Mutex`, a `CancellationToken` pair gives a
//! hard-kill plus a softer "stop accepting writes" gate, and the reader
//! runs as its own spawned task reading off `Arc<Self>`.

pub mod reader;
pub mod reconnect;
pub mod writer;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{MessageFlags, PacketCodec, PacketFlags, PacketType},
    compression::Compressor,
    error::{Error, ErrorKind},
    ids::Slot,
    pool::Pool,
    protocol::Protocol,
};

use reader::{MessageReader, ReaderEvent};
use writer::MessageWriter;

/// The connection state machine: `Raw -> Secure? -> Passive -> Active ->
/// Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Raw,
    Secure,
    Passive,
    Active,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Events processed by a connection. `start`, `stream-readable` and
/// `stream-writable` are internal to the task loop rather than posted from
/// outside, so they have no variant here.
#[derive(Debug)]
pub enum ConnectionEvent {
    EnterSecure,
    EnterPassive,
    EnterActive,
    /// The pool has at least one new message queued; wake the writer.
    PoolPush,
    Cancel(Slot),
    StopDelayed,
    StopForce,
    /// A response (or a completion) for `slot` was just resolved in the
    /// pool; release this connection's `WaitResponse` budget for it.
    ReleaseResponseWait,
    /// Raw bytes to forward verbatim on behalf of the relay engine; bypasses
    /// the writer ring entirely since relayed payloads are never
    /// deserialized or re-queued by this connection.
    RelayForward {
        local_id: u32,
        packet_type: PacketType,
        packet_flags: PacketFlags,
        payload: Vec<u8>,
    },
    /// A fully-formed envelope+payload to send on this exact connection,
    /// bypassing the pool queue — used for replies, which must travel back
    /// down the same socket the request arrived on rather than through
    /// whichever connection the pool's routing would otherwise pick.
    SendDirect { bytes: Vec<u8>, flags: MessageFlags },
}

pub struct ConnectionConfig {
    pub codec: PacketCodec,
    pub max_message_count_multiplex: usize,
    pub max_message_count_response_wait: usize,
    pub max_message_continuous_packet_count: usize,
    pub reader_max_message_count_multiplex: usize,
    pub connection_inactivity_timeout: Duration,
    pub connection_keepalive_timeout: Duration,
    pub connection_inactivity_keepalive_count: u32,
    pub relay_mode: bool,
    pub compress: bool,
}

pub struct Connection {
    pub id: Slot,
    pool: std::sync::Weak<Pool>,
    #[allow(dead_code)]
    protocol: Arc<Protocol>,
    write_half: Mutex<OwnedWriteHalf>,
    state: Mutex<ConnectionState>,
    cancel: CancellationToken,
    stop_writes: CancellationToken,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Mirrors this connection's writer ring length, so the pool can compare
    /// in-flight load across connections without reaching into the writer
    /// task itself.
    in_flight: AtomicUsize,
    pub role: Role,
    pub peer_addr: Option<SocketAddr>,
}

impl Connection {
    pub async fn connect_client(
        id: Slot,
        pool: std::sync::Weak<Pool>,
        protocol: Arc<Protocol>,
        compressor: Arc<dyn Compressor>,
        addr: SocketAddr,
        cfg: ConnectionConfig,
    ) -> Result<Arc<Self>, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::with_source(ErrorKind::ConnectionResolveFailure, e))?;
        stream.set_nodelay(true).ok();
        Ok(Self::spawn(id, pool, protocol, compressor, stream, Role::Client, Some(addr), cfg))
    }

    pub fn accept_server(
        id: Slot,
        pool: std::sync::Weak<Pool>,
        protocol: Arc<Protocol>,
        compressor: Arc<dyn Compressor>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cfg: ConnectionConfig,
    ) -> Arc<Self> {
        stream.set_nodelay(true).ok();
        Self::spawn(id, pool, protocol, compressor, stream, Role::Server, Some(peer_addr), cfg)
    }

    fn spawn(
        id: Slot,
        pool: std::sync::Weak<Pool>,
        protocol: Arc<Protocol>,
        compressor: Arc<dyn Compressor>,
        stream: TcpStream,
        role: Role,
        peer_addr: Option<SocketAddr>,
        cfg: ConnectionConfig,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id,
            pool,
            protocol: protocol.clone(),
            write_half: Mutex::new(write_half),
            state: Mutex::new(ConnectionState::Raw),
            cancel: CancellationToken::new(),
            stop_writes: CancellationToken::new(),
            events_tx,
            in_flight: AtomicUsize::new(0),
            role,
            peer_addr,
        });

        let reader_conn = conn.clone();
        let reader_compressor = compressor.clone();
        let reader_codec = cfg.codec;
        let reader_max_multiplex = cfg.reader_max_message_count_multiplex;
        let relay_mode = cfg.relay_mode;
        tokio::spawn(async move {
            if let Err(e) = reader_conn
                .read_loop(read_half, reader_codec, reader_compressor, reader_max_multiplex, relay_mode)
                .await
            {
                debug!(connection = %reader_conn.id, error = %e, "read loop exited");
            }
            reader_conn.cancel.cancel();
        });

        let writer_conn = conn.clone();
        let writer_compressor = compressor;
        tokio::spawn(async move {
            writer_conn.writer_loop(events_rx, writer_compressor, cfg).await;
        });

        conn
    }

    /// Posts `event` to this connection's writer loop. Returns `false` if
    /// the loop has already exited and the event was dropped.
    pub fn notify(&self, event: ConnectionEvent) -> bool {
        self.events_tx.send(event).is_ok()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub fn stop_delayed(&self) {
        self.notify(ConnectionEvent::StopDelayed);
    }

    pub fn stop_force(&self) {
        self.notify(ConnectionEvent::StopForce);
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of messages this connection's writer currently has admitted
    /// into its ring. Used by the pool to pick which connection pulls next
    /// when more than one is active for the same peer.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    async fn read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        codec: PacketCodec,
        compressor: Arc<dyn Compressor>,
        max_multiplex: usize,
        relay_mode: bool,
    ) -> Result<(), Error> {
        use tokio::io::AsyncReadExt;

        let mut reader = MessageReader::new(
            max_multiplex,
            64, // inactivity_keepalive_count is enforced by the caller-supplied config in practice; the reader's own ceiling here is a defensive upper bound.
            relay_mode,
        );
        let mut buf = vec![0u8; codec.recv_buffer_capacity];
        let mut filled = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = read_half.read(&mut buf[filled..]) => res.map_err(Error::Io)?,
            };
            if n == 0 {
                return Err(Error::new(ErrorKind::ConnectionKilled));
            }
            filled += n;

            let mut consumed_total = 0;
            loop {
                match codec.decode(&buf[consumed_total..filled])? {
                    crate::codec::Decoded::NeedMore => break,
                    crate::codec::Decoded::Packet(packet, consumed) => {
                        reader.note_activity();
                        self.handle_reader_event(reader.on_packet(&packet, compressor.as_ref())?)
                            .await?;
                        consumed_total += consumed;
                    },
                }
            }
            buf.copy_within(consumed_total..filled, 0);
            filled -= consumed_total;
        }
    }

    async fn handle_reader_event(&self, event: ReaderEvent) -> Result<(), Error> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        match event {
            ReaderEvent::MessageComplete {
                type_id,
                sender_request_id,
                receiver_request_id,
                flags,
                payload,
            } => {
                if flags.contains(MessageFlags::RESPONSE) {
                    if pool.relay_peer_name().is_some() {
                        pool.relay_forward_response(type_id, receiver_request_id, flags, payload).await;
                    } else if flags.contains(MessageFlags::CANCELED) {
                        pool.fail_pending_response(receiver_request_id, Error::new(ErrorKind::MessageCanceled)).await;
                    } else {
                        pool.on_response(receiver_request_id, payload).await.ok();
                    }
                    self.notify(ConnectionEvent::ReleaseResponseWait);
                } else {
                    let protocol = pool.protocol();
                    if let Some(reply) = protocol
                        .dispatch(type_id, &payload, false)
                        .await?
                    {
                        if sender_request_id != 0 {
                            pool.send_response(self.id, type_id, sender_request_id, reply).await?;
                        }
                    }
                }
            },
            ReaderEvent::RelayedComplete { target_name, payload, .. } => {
                pool.relay_deliver(self.id, &target_name, payload).await;
            },
            ReaderEvent::CancelRequested { message_id } => {
                debug!(connection = %self.id, message_id, "peer canceled inbound message");
            },
            ReaderEvent::KeepAlive | ReaderEvent::Update | ReaderEvent::Pending => {},
        }
        Ok(())
    }

    async fn writer_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        compressor: Arc<dyn Compressor>,
        cfg: ConnectionConfig,
    ) {
        let mut writer = MessageWriter::new(
            cfg.max_message_count_multiplex,
            cfg.max_message_count_response_wait,
            cfg.codec.max_packet_data_size,
            cfg.max_message_continuous_packet_count,
        );
        let mut keepalive = tokio::time::interval(cfg.connection_keepalive_timeout);
        let mut inactivity_deadline = Instant::now() + cfg.connection_inactivity_timeout;
        let mut keepalive_sent_count = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.complete_all_in_flight_as_lost().await;
                    return;
                },
                _ = tokio::time::sleep_until(inactivity_deadline) => {
                    warn!(connection = %self.id, "inactivity timeout");
                    self.stop_force();
                    return;
                },
                _ = keepalive.tick() => {
                    if self.stop_writes.is_cancelled() { continue; }
                    keepalive_sent_count += 1;
                    if keepalive_sent_count > cfg.connection_inactivity_keepalive_count {
                        self.stop_force();
                        return;
                    }
                    self.write_raw(PacketType::KeepAlive, PacketFlags::empty(), 0, &[]).await.ok();
                },
                event = events_rx.recv() => {
                    inactivity_deadline = Instant::now() + cfg.connection_inactivity_timeout;
                    match event {
                        None => return,
                        Some(ConnectionEvent::EnterSecure) => { *self.state.lock().await = ConnectionState::Secure; }
                        Some(ConnectionEvent::EnterPassive) => { *self.state.lock().await = ConnectionState::Passive; }
                        Some(ConnectionEvent::EnterActive) => { *self.state.lock().await = ConnectionState::Active; }
                        Some(ConnectionEvent::StopDelayed) => {
                            *self.state.lock().await = ConnectionState::Stopping;
                            self.stop_writes.cancel();
                        }
                        Some(ConnectionEvent::StopForce) => {
                            *self.state.lock().await = ConnectionState::Stopped;
                            self.complete_all_in_flight_as_lost().await;
                            return;
                        }
                        Some(ConnectionEvent::Cancel(slot)) => {
                            if let Some(local_id) = writer.abort(slot) {
                                self.in_flight.store(writer.in_flight_count(), Ordering::Relaxed);
                                self.write_raw(PacketType::CancelRequest, PacketFlags::END_OF_MESSAGE, local_id, &[]).await.ok();
                            }
                        }
                        Some(ConnectionEvent::ReleaseResponseWait) => writer.release_response_wait(),
                        Some(ConnectionEvent::RelayForward { local_id, packet_type, packet_flags, payload }) => {
                            self.write_raw(packet_type, packet_flags, local_id, &payload).await.ok();
                        }
                        Some(ConnectionEvent::SendDirect { bytes, flags }) => {
                            if writer.has_capacity() {
                                writer.admit(Slot::new(u32::MAX, 0), bytes, flags);
                            }
                        }
                        Some(ConnectionEvent::PoolPush) => {},
                    }
                },
            }

            if self.stop_writes.is_cancelled() {
                continue;
            }
            if let Err(e) = self.drain_writer(&mut writer, compressor.as_ref(), cfg.compress).await {
                debug!(connection = %self.id, error = %e, "writer drained with error");
                self.stop_force();
                return;
            }
        }
    }

    async fn drain_writer(
        &self,
        writer: &mut MessageWriter,
        compressor: &dyn Compressor,
        compress: bool,
    ) -> Result<(), Error> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        while writer.has_capacity() {
            let sync_in_flight_elsewhere = pool.sync_in_flight_elsewhere(self.id).await;
            let Some(pulled) = pool.pull_for_writer(self.id, sync_in_flight_elsewhere).await else {
                break;
            };
            if pulled.flags.contains(MessageFlags::WAIT_RESPONSE) && !writer.admit_response_wait() {
                pool.requeue_at_head(pulled.slot.index).await;
                break;
            }
            writer.admit(pulled.slot, pulled.bytes, pulled.flags);
            self.in_flight.store(writer.in_flight_count(), Ordering::Relaxed);
        }

        while let Some(packet) = writer.next_packet(compressor, compress)? {
            self.write_raw(packet.packet_type, packet.packet_flags, packet.local_id, &packet.payload)
                .await?;
            if packet.message_complete {
                self.in_flight.store(writer.in_flight_count(), Ordering::Relaxed);
                if let Some(pool) = self.pool.upgrade() {
                    pool.note_fully_sent(packet.pool_slot).await;
                }
            }
        }
        Ok(())
    }

    async fn write_raw(
        &self,
        ty: PacketType,
        flags: PacketFlags,
        message_id: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = PacketCodec::default().encode_header(ty, flags, payload.len(), message_id)?;
        let mut w = self.write_half.lock().await;
        w.write_all(&header).await.map_err(Error::Io)?;
        if !payload.is_empty() {
            w.write_all(payload).await.map_err(Error::Io)?;
        }
        Ok(())
    }

    async fn complete_all_in_flight_as_lost(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.connection_lost(self.id).await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
