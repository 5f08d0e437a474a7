//! # Arena Server Library
//!
//! Authoritative game-state server reachable over QUIC. Clients join, move
//! and shoot by sending newline-delimited JSON on one bidirectional stream;
//! the server owns the only copy of the world, advances it on a fixed tick
//! and broadcasts a snapshot of every active entity back to each session.
//!
//! ## Architecture
//!
//! ### Single Consumer
//! quinn runs connections and streams on tokio worker tasks. The transport
//! adapter turns everything those tasks observe into typed events on one
//! queue; the server loop is the only reader of that queue and the only code
//! that touches sessions or the world. No game state is behind a lock.
//!
//! ### Ticks
//! Each tick runs item collection, bullet integration, hit detection, item
//! respawn and snapshot broadcast back to back, without awaiting anything.
//! A slow client only ever costs a failed or queued send on its own stream.
//!
//! ## Module Organization
//!
//! - `transport`: QUIC endpoint, per-stream reader/writer tasks, event types
//! - `session`: connection and channel state machines, framing, send tracking
//! - `game`: players, items, bullets and the tick
//! - `network`: the server loop tying the three together
//! - `storage`, `bootstrap`: key-value and relational collaborators, startup
//!   registration
//! - `dev_client`: a QUIC client used by the `test_client` binary and tests
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind(ServerConfig::default(), Arc::new(MemoryStore::new()))?;
//!
//!     // Serve until Ctrl+C, then close every connection.
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod dev_client;
pub mod error;
pub mod game;
pub mod network;
pub mod session;
pub mod storage;
pub mod transport;
