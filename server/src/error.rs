//! Error types for the arena server.

use crate::transport::{ChannelId, ConnectionId, SendId};
use thiserror::Error;

/// Failures that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("QUIC configuration error: {0}")]
    Quic(String),
}

/// Failure to submit a message on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The channel is unknown, or it is already closing.
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    /// The transport side of the channel stopped accepting frames.
    #[error("send queue for channel {0} is closed")]
    QueueClosed(ChannelId),

    /// The peer is not draining the channel fast enough.
    #[error("channel {channel} has {queued} bytes waiting, refusing more")]
    Backlogged { channel: ChannelId, queued: usize },
}

/// An event referred to an entity that no longer exists.
///
/// Expected whenever transport events race with a close; logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaleReference {
    #[error("connection {0} is not registered")]
    Connection(ConnectionId),

    #[error("channel {0} is not open")]
    Channel(ChannelId),

    #[error("send {0} is not pending")]
    Send(SendId),
}
