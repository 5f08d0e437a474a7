//! Runtime configuration for the arena server.

use shared::{DEFAULT_PORT, DEFAULT_TICK_RATE, ITEM_SPAWN_INTERVAL_SECS};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Largest single message accepted from a client, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Bytes a channel may have in flight before the peer is treated as stalled.
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 256 * 1024;

/// Shortest tick period the server loop will run with.
pub const MIN_TICK_DURATION: Duration = Duration::from_millis(1);

/// Where the TLS identity of the endpoint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateConfig {
    /// Generate a self-signed certificate at start-up (development only).
    SelfSigned { hostnames: Vec<String> },
    /// Load a PEM certificate chain and private key from disk.
    PemFiles { cert_path: PathBuf, key_path: PathBuf },
}

impl Default for CertificateConfig {
    fn default() -> Self {
        CertificateConfig::SelfSigned {
            hostnames: vec!["localhost".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub tick_rate: u32,
    pub item_spawn_interval: Duration,
    pub max_message_size: usize,
    /// Outbound bytes a channel may have waiting on the transport.
    pub max_queued_bytes: usize,
    pub certificate: CertificateConfig,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// When set, clients must send a matching `auth` message before playing.
    pub auth_token: Option<String>,
    /// Instance name used when registering with the key-value store.
    pub server_name: String,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    pub database_url: Option<String>,
    /// Pool size used for the startup database check.
    pub database_max_connections: u32,
    /// Shared key-value store; the in-process store is used when unset.
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            tick_rate: DEFAULT_TICK_RATE,
            item_spawn_interval: Duration::from_secs(ITEM_SPAWN_INTERVAL_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            certificate: CertificateConfig::default(),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            auth_token: None,
            server_name: "default_server".to_string(),
            seed: None,
            database_url: None,
            database_max_connections: 5,
            redis_url: None,
        }
    }
}

impl ServerConfig {
    /// Duration of one simulation step, never shorter than [`MIN_TICK_DURATION`].
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64).max(MIN_TICK_DURATION)
    }
}
