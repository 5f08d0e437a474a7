use clap::Parser;
use log::{error, info, warn};
use server::bootstrap;
use server::config::{CertificateConfig, ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};
use server::network::Server;
use server::storage::{KeyValueStore, MemoryStore};
use shared::DEFAULT_PORT;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind the QUIC listener to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// UDP port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Simulation ticks per second
    #[arg(
        short,
        long,
        default_value = "20",
        value_parser = clap::value_parser!(u32).range(1..=1000)
    )]
    tick_rate: u32,

    /// PEM certificate chain (self-signed when omitted)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Require clients to authenticate with this token
    #[arg(long)]
    auth_token: Option<String>,

    /// Instance name published to the key-value store
    #[arg(short, long, env = "NAME", default_value = "default_server")]
    name: String,

    /// Fixed seed for spawn positions
    #[arg(long)]
    seed: Option<u64>,

    /// Largest accepted client message in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// PostgreSQL URL checked at startup
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Connection pool size for the database check
    #[arg(long, default_value_t = 5)]
    database_max_connections: u32,

    /// Redis URL for server registration and presence (in-memory when omitted)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let certificate = match (self.cert, self.key) {
            (Some(cert_path), Some(key_path)) => CertificateConfig::PemFiles {
                cert_path,
                key_path,
            },
            _ => CertificateConfig::default(),
        };

        ServerConfig {
            bind_addr: SocketAddr::new(self.host, self.port),
            tick_rate: self.tick_rate,
            max_message_size: self.max_message_size,
            certificate,
            auth_token: self.auth_token,
            server_name: self.name,
            seed: self.seed,
            database_url: self.database_url,
            database_max_connections: self.database_max_connections,
            redis_url: self.redis_url,
            ..ServerConfig::default()
        }
    }
}

#[cfg(feature = "postgres")]
async fn check_database(url: &str, max_connections: u32) {
    let mut database =
        server::storage::PostgresStore::new(url).with_max_connections(max_connections);
    if let Err(e) = bootstrap::verify_database(&mut database).await {
        warn!("Database check failed: {}", e);
    }
}

#[cfg(not(feature = "postgres"))]
async fn check_database(_url: &str, _max_connections: u32) {
    warn!("Database URL given but this build has no postgres support");
}

#[cfg(feature = "redis")]
async fn open_store(url: Option<&str>) -> Arc<dyn KeyValueStore> {
    let Some(url) = url else {
        return Arc::new(MemoryStore::new());
    };
    match server::storage::RedisStore::connect(url).await {
        Ok(store) => {
            info!("Using Redis at {}", url);
            Arc::new(store)
        }
        Err(e) => {
            warn!("Redis unavailable ({}), falling back to in-memory store", e);
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn open_store(url: Option<&str>) -> Arc<dyn KeyValueStore> {
    if url.is_some() {
        warn!("Redis URL given but this build has no redis support");
    }
    Arc::new(MemoryStore::new())
}

/// Resolves on Ctrl+C or when Enter is pressed.
async fn stop_signal() {
    let enter = async {
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            // Without a terminal, stdin is closed at once; wait for Ctrl+C instead.
            Ok(0) | Err(_) => std::future::pending::<()>().await,
            Ok(_) => {}
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = enter => info!("Received Enter"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();

    let store = open_store(config.redis_url.as_deref()).await;
    if let Err(e) = bootstrap::register_instance(store.as_ref(), &config).await {
        warn!("Server registration failed: {}", e);
    }
    if let Some(url) = &config.database_url {
        check_database(url, config.database_max_connections).await;
    }

    let mut server = match Server::bind(config, store) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {}", e);
            return Err(e.into());
        }
    };

    info!("Press Enter or Ctrl+C to stop");
    server.run(stop_signal()).await?;

    info!("Server stopped");
    Ok(())
}
