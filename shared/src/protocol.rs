//! JSON wire protocol.
//!
//! Every message is one JSON object on a single line. Client messages carry
//! an `action` tag; the server answers with tagged replies and broadcasts
//! untagged [`Snapshot`] objects every tick.

use crate::MESSAGE_DELIMITER;
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("{0}")]
    MissingField(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        let text = err.to_string();
        match err.classify() {
            Category::Data if text.starts_with("missing field") => {
                ProtocolError::MissingField(text)
            }
            Category::Data => ProtocolError::InvalidField(text),
            Category::Syntax | Category::Eof | Category::Io => ProtocolError::Malformed(text),
        }
    }
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player: Option<String>,
    },
    Move {
        x: i64,
        y: i64,
    },
    Shoot {
        x: i64,
        y: i64,
        dx: f64,
        dy: f64,
        player: String,
    },
    Auth {
        token: String,
    },
}

impl ClientMessage {
    /// Parses one framed message (delimiter already stripped).
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_line(self)
    }

    /// Name of the action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Move { .. } => "move",
            ClientMessage::Shoot { .. } => "shoot",
            ClientMessage::Auth { .. } => "auth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ok,
    Error,
}

/// Replies addressed to a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        player: String,
    },
    Auth {
        status: AuthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_line(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    pub id: u32,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletView {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
    pub shooter: String,
}

/// Immutable view of every active entity, broadcast once per tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub players: Vec<PlayerView>,
    pub items: Vec<ItemView>,
    pub bullets: Vec<BulletView>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_line(self)
    }
}

/// Anything a client can receive from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Message(ServerMessage),
    Snapshot(Snapshot),
}

impl ServerFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Serializes `value` as compact JSON followed by the message delimiter.
///
/// Compact JSON escapes newlines inside strings, so the output never contains
/// a delimiter before the final byte.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    bytes.push(MESSAGE_DELIMITER);
    Ok(bytes)
}
