// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `Configuration` — the YAML-loadable knob set for a whole [`crate::service::Service`].
//!
//! A plain `serde`-derived struct loaded with `serde_yaml`, then run through
//! `validate_and_normalize` before use.

use std::{fs, future::Future, net::SocketAddr, path::Path, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Resolves a symbolic recipient name to a list of candidate socket
/// addresses. Absent ⇒ server-only service.
pub type NameResolveFn = Arc<
    dyn Fn(&str) -> Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, Error>> + Send>>
        + Send
        + Sync,
>;

/// The state a freshly spawned connection starts in.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStartState {
    Raw,
    Passive,
    #[default]
    Active,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WriterConfig {
    /// Per-connection in-flight messages. Default 4.
    #[serde(default = "WriterConfig::default_multiplex")]
    pub max_message_count_multiplex: u32,
    /// Per-connection outstanding `WaitResponse` messages.
    #[serde(default = "WriterConfig::default_response_wait")]
    pub max_message_count_response_wait: u32,
    /// Fairness cap on consecutive packets from one message.
    #[serde(default = "WriterConfig::default_continuous_packets")]
    pub max_message_continuous_packet_count: u32,
}

impl WriterConfig {
    fn default_multiplex() -> u32 {
        4
    }

    fn default_response_wait() -> u32 {
        16
    }

    fn default_continuous_packets() -> u32 {
        4
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_message_count_multiplex: Self::default_multiplex(),
            max_message_count_response_wait: Self::default_response_wait(),
            max_message_continuous_packet_count: Self::default_continuous_packets(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReaderConfig {
    /// Per-connection receive-side in-flight messages.
    #[serde(default = "ReaderConfig::default_multiplex")]
    pub max_message_count_multiplex: u32,
}

impl ReaderConfig {
    fn default_multiplex() -> u32 {
        4
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_message_count_multiplex: Self::default_multiplex(),
        }
    }
}

/// One `Configuration` per [`crate::service::Service`], covering every pool
/// it will host.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Configuration {
    #[serde(default = "Configuration::default_pool_max_active")]
    pub pool_max_active_connection_count: u32,
    #[serde(default = "Configuration::default_pool_max_pending")]
    pub pool_max_pending_connection_count: u32,
    #[serde(default = "Configuration::default_pool_max_queue")]
    pub pool_max_message_queue_size: usize,
    #[serde(default = "Configuration::default_mutex_count")]
    pub pools_mutex_count: u32,

    #[serde(default = "Configuration::default_recv_start_kb")]
    pub connection_recv_buffer_start_capacity_kb: u32,
    #[serde(default = "Configuration::default_recv_max_kb")]
    pub connection_recv_buffer_max_capacity_kb: u32,
    #[serde(default = "Configuration::default_send_start_kb")]
    pub connection_send_buffer_start_capacity_kb: u32,
    #[serde(default = "Configuration::default_send_max_kb")]
    pub connection_send_buffer_max_capacity_kb: u32,

    #[serde(default = "Configuration::default_reconnect_secs", with = "serde_secs")]
    pub connection_reconnect_timeout_seconds: Duration,
    #[serde(default = "Configuration::default_reconnect_ceiling_secs", with = "serde_secs")]
    pub connection_reconnect_timeout_ceiling_seconds: Duration,
    #[serde(default = "Configuration::default_inactivity_secs", with = "serde_secs")]
    pub connection_inactivity_timeout_seconds: Duration,
    #[serde(default = "Configuration::default_keepalive_secs", with = "serde_secs")]
    pub connection_keepalive_timeout_seconds: Duration,
    #[serde(default = "Configuration::default_keepalive_count")]
    pub connection_inactivity_keepalive_count: u32,

    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub reader: ReaderConfig,

    /// `"host:port"`; empty ⇒ client-only service.
    #[serde(default)]
    pub server_listener_address_str: String,

    #[serde(default)]
    pub relay_enabled: bool,
    #[serde(default)]
    pub compression_enabled: bool,

    #[serde(default)]
    pub connection_start_state: ConnectionStartState,

    /// Name resolver hook; `None` ⇒ server-only service.
    /// Skipped by (de)serialization — set programmatically by the
    /// application after loading the file-backed knobs.
    #[serde(skip)]
    pub client_name_resolver: Option<NameResolveFn>,
}

impl Configuration {
    fn default_pool_max_active() -> u32 {
        1
    }

    fn default_pool_max_pending() -> u32 {
        4
    }

    fn default_pool_max_queue() -> usize {
        1024
    }

    fn default_mutex_count() -> u32 {
        16
    }

    fn default_recv_start_kb() -> u32 {
        16
    }

    fn default_recv_max_kb() -> u32 {
        1024
    }

    fn default_send_start_kb() -> u32 {
        16
    }

    fn default_send_max_kb() -> u32 {
        1024
    }

    fn default_reconnect_secs() -> Duration {
        Duration::from_secs(1)
    }

    fn default_reconnect_ceiling_secs() -> Duration {
        Duration::from_secs(60)
    }

    fn default_inactivity_secs() -> Duration {
        Duration::from_secs(60)
    }

    fn default_keepalive_secs() -> Duration {
        Duration::from_secs(20)
    }

    fn default_keepalive_count() -> u32 {
        4
    }

    pub fn max_packet_data_size(&self) -> usize {
        crate::codec::packet::DEFAULT_MAX_PACKET_DATA_SIZE
            .min((self.connection_send_buffer_max_capacity_kb as usize * 1024).saturating_sub(crate::codec::packet::HEADER_LEN))
    }

    pub fn connection_inactivity_timeout(&self) -> Duration {
        self.connection_inactivity_timeout_seconds
    }

    pub fn connection_keepalive_timeout(&self) -> Duration {
        self.connection_keepalive_timeout_seconds
    }

    /// Loads configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Configuration =
            serde_yaml::from_str(&s).context("failed to parse mpipc config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.pool_max_active_connection_count >= 1,
            "pool_max_active_connection_count must be >= 1"
        );
        ensure!(self.pools_mutex_count >= 1, "pools_mutex_count must be >= 1");
        if !self.pools_mutex_count.is_power_of_two() {
            self.pools_mutex_count = self.pools_mutex_count.next_power_of_two();
        }
        ensure!(
            self.connection_recv_buffer_max_capacity_kb >= self.connection_recv_buffer_start_capacity_kb,
            "connection_recv_buffer_max_capacity_kb must be >= start capacity"
        );
        ensure!(
            self.connection_send_buffer_max_capacity_kb >= self.connection_send_buffer_start_capacity_kb,
            "connection_send_buffer_max_capacity_kb must be >= start capacity"
        );
        ensure!(
            self.writer.max_message_count_multiplex >= 1,
            "writer.max_message_count_multiplex must be >= 1"
        );
        ensure!(
            self.reader.max_message_count_multiplex >= 1,
            "reader.max_message_count_multiplex must be >= 1"
        );
        if self.connection_reconnect_timeout_ceiling_seconds < self.connection_reconnect_timeout_seconds {
            self.connection_reconnect_timeout_ceiling_seconds = self.connection_reconnect_timeout_seconds;
        }
        Ok(())
    }

    pub fn is_server(&self) -> bool {
        !self.server_listener_address_str.is_empty()
    }

    pub fn is_client_capable(&self) -> bool {
        self.client_name_resolver.is_some()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            pool_max_active_connection_count: Self::default_pool_max_active(),
            pool_max_pending_connection_count: Self::default_pool_max_pending(),
            pool_max_message_queue_size: Self::default_pool_max_queue(),
            pools_mutex_count: Self::default_mutex_count(),
            connection_recv_buffer_start_capacity_kb: Self::default_recv_start_kb(),
            connection_recv_buffer_max_capacity_kb: Self::default_recv_max_kb(),
            connection_send_buffer_start_capacity_kb: Self::default_send_start_kb(),
            connection_send_buffer_max_capacity_kb: Self::default_send_max_kb(),
            connection_reconnect_timeout_seconds: Self::default_reconnect_secs(),
            connection_reconnect_timeout_ceiling_seconds: Self::default_reconnect_ceiling_secs(),
            connection_inactivity_timeout_seconds: Self::default_inactivity_secs(),
            connection_keepalive_timeout_seconds: Self::default_keepalive_secs(),
            connection_inactivity_keepalive_count: Self::default_keepalive_count(),
            writer: WriterConfig::default(),
            reader: ReaderConfig::default(),
            server_listener_address_str: String::new(),
            relay_enabled: false,
            compression_enabled: false,
            connection_start_state: ConnectionStartState::default(),
            client_name_resolver: None,
        }
    }
}

/// Serde helper for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
