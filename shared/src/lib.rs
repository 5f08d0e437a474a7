//! Types and codecs shared between the arena server and its clients.
//!
//! The play field, the wire protocol and the newline framer live here so that
//! the server and the development client agree on one definition of each.

pub mod framing;
pub mod protocol;

pub use framing::{FrameBuffer, FrameError, Frames};
pub use protocol::{
    AuthStatus, BulletView, ClientMessage, ItemView, PlayerView, ProtocolError, ServerFrame,
    ServerMessage, Snapshot,
};

/// Width of the play field in world units.
pub const WORLD_WIDTH: i32 = 600;
/// Height of the play field in world units.
pub const WORLD_HEIGHT: i32 = 400;

/// Lowest coordinate used when placing spawned players and items.
pub const SPAWN_MARGIN: i32 = 50;
/// Number of distinct x positions available to the spawner.
pub const SPAWN_RANGE_X: i32 = 500;
/// Number of distinct y positions available to the spawner.
pub const SPAWN_RANGE_Y: i32 = 300;

/// A player closer than this to an item collects it.
pub const COLLECTION_RADIUS: f64 = 20.0;
/// A bullet closer than this to a player hits it.
pub const HIT_RADIUS: f64 = 15.0;
/// Distance a bullet travels per tick.
pub const BULLET_SPEED: f64 = 15.0;
/// Bullets are culled once they leave the play field by more than this.
pub const BULLET_BOUNDS_PADDING: f64 = 50.0;

/// Default simulation rate.
pub const DEFAULT_TICK_RATE: u32 = 20;
/// Default interval between item spawns, in seconds of simulated time.
pub const ITEM_SPAWN_INTERVAL_SECS: u64 = 5;

/// ALPN identifier negotiated by server and client.
pub const ALPN_PROTOCOL: &[u8] = b"game";
/// Default UDP port the server listens on.
pub const DEFAULT_PORT: u16 = 4443;

/// Byte separating application messages on a channel.
pub const MESSAGE_DELIMITER: u8 = b'\n';
