//! One-shot startup registration.
//!
//! Publishes this instance's metadata to the key-value store so that other
//! services can list running servers, and resets its online counter.

use crate::config::ServerConfig;
use crate::storage::{
    self, KeyValueStore, RelationalStore, StoreError, ONLINE_BY_SERVER_KEY, SERVER_LIST_KEY,
};
use log::info;
use serde::Serialize;

/// Metadata stored under `manage:server_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub quic_port: String,
    pub arch: String,
    pub platform: String,
    pub version: String,
}

impl ServerInfo {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            name: config.server_name.clone(),
            quic_port: config.bind_addr.port().to_string(),
            arch: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Registers this instance and zeroes its online counter.
pub async fn register_instance(
    store: &dyn KeyValueStore,
    config: &ServerConfig,
) -> storage::Result<ServerInfo> {
    let info = ServerInfo::from_config(config);
    let record = serde_json::to_string(&info).map_err(|e| StoreError::Backend(e.to_string()))?;

    store.hash_set(SERVER_LIST_KEY, &info.name, &record).await?;
    store.hash_set(ONLINE_BY_SERVER_KEY, &info.name, "0").await?;

    info!("Registered server {} ({} {})", info.name, info.platform, info.arch);
    Ok(info)
}

/// Connects to the relational store and runs a trivial query.
pub async fn verify_database(store: &mut dyn RelationalStore) -> storage::Result<()> {
    store.connect().await?;
    let rows = store.execute("SELECT 1 AS ok").await?;
    info!("Database reachable ({} row)", rows.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Row};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_register_instance() {
        let store = MemoryStore::new();
        let config = ServerConfig {
            server_name: "eu-1".to_string(),
            ..ServerConfig::default()
        };
        store.hash_set(ONLINE_BY_SERVER_KEY, "eu-1", "17").await.unwrap();

        let info = register_instance(&store, &config).await.unwrap();
        assert_eq!(info.name, "eu-1");
        assert_eq!(info.quic_port, "4443");

        let record = store.hash_get(SERVER_LIST_KEY, "eu-1").await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&record).unwrap();
        assert_eq!(json["name"], "eu-1");
        assert_eq!(json["quicPort"], "4443");
        assert_eq!(json["platform"], std::env::consts::OS);

        assert_eq!(
            store.hash_get(ONLINE_BY_SERVER_KEY, "eu-1").await.unwrap(),
            Some("0".to_string())
        );
    }

    #[tokio::test]
    async fn test_register_instance_reports_store_errors() {
        let store = MemoryStore::new();
        store.set(SERVER_LIST_KEY, "not a hash").await.unwrap();

        let result = register_instance(&store, &ServerConfig::default()).await;
        assert!(matches!(result, Err(StoreError::WrongType(_))));
    }

    struct FakeDatabase {
        connected: bool,
    }

    #[async_trait]
    impl RelationalStore for FakeDatabase {
        async fn connect(&mut self) -> storage::Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn execute(&self, _query: &str) -> storage::Result<Vec<Row>> {
            if !self.connected {
                return Err(StoreError::NotConnected);
            }
            Ok(vec![vec![("ok".to_string(), serde_json::Value::from(1))]])
        }
    }

    #[tokio::test]
    async fn test_verify_database() {
        let mut database = FakeDatabase { connected: false };

        verify_database(&mut database).await.unwrap();
        assert!(database.connected);
    }
}
