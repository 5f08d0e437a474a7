//! Authoritative world state and the fixed-rate tick.
//!
//! The [`World`] owns every player, item and bullet. It is only ever touched
//! from the server loop, so a tick runs start to finish without interruption
//! and always sees a consistent world:
//!
//! 1. item collection
//! 2. bullet integration and culling
//! 3. bullet/player hits
//! 4. item respawn, driven by simulated time
//! 5. purge of inactive entities and snapshot construction
//!
//! Entities are visited in insertion order and the first match wins.

use crate::transport::ChannelId;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    BulletView, ItemView, PlayerView, Snapshot, BULLET_BOUNDS_PADDING, BULLET_SPEED,
    COLLECTION_RADIUS, HIT_RADIUS, SPAWN_MARGIN, SPAWN_RANGE_X, SPAWN_RANGE_Y, WORLD_HEIGHT,
    WORLD_WIDTH,
};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub channel: ChannelId,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bullet {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    /// Unit direction.
    pub dx: f64,
    pub dy: f64,
    pub shooter: String,
    pub active: bool,
}

impl Bullet {
    fn out_of_bounds(&self) -> bool {
        let min = -BULLET_BOUNDS_PADDING;
        let max_x = WORLD_WIDTH as f64 + BULLET_BOUNDS_PADDING;
        let max_y = WORLD_HEIGHT as f64 + BULLET_BOUNDS_PADDING;
        self.x < min || self.x > max_x || self.y < min || self.y > max_y
    }
}

fn distance(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    (ax - bx).hypot(ay - by)
}

/// Timing knobs for the world clock.
#[derive(Debug, Clone, Copy)]
pub struct WorldSettings {
    pub tick_duration: Duration,
    pub item_spawn_interval: Duration,
    pub seed: Option<u64>,
}

pub struct World {
    players: Vec<Player>,
    items: Vec<Item>,
    bullets: Vec<Bullet>,
    next_item_id: u32,
    next_bullet_id: u32,
    player_counter: u32,
    rng: StdRng,
    tick: u64,
    elapsed: Duration,
    last_item_spawn: Duration,
    tick_duration: Duration,
    item_spawn_interval: Duration,
}

impl World {
    pub fn new(settings: WorldSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            players: Vec::new(),
            items: Vec::new(),
            bullets: Vec::new(),
            next_item_id: 1,
            next_bullet_id: 1,
            player_counter: 0,
            rng,
            tick: 0,
            elapsed: Duration::ZERO,
            last_item_spawn: Duration::ZERO,
            tick_duration: settings.tick_duration,
            item_spawn_interval: settings.item_spawn_interval,
        }
    }

    fn random_position(&mut self) -> (i32, i32) {
        let x = SPAWN_MARGIN + self.rng.gen_range(0..SPAWN_RANGE_X);
        let y = SPAWN_MARGIN + self.rng.gen_range(0..SPAWN_RANGE_Y);
        (x, y)
    }

    /// Adds a player for `channel` and returns its name, or `None` if the
    /// channel already has one.
    pub fn add_player(&mut self, channel: ChannelId, name: Option<&str>) -> Option<String> {
        if self.player(channel).is_some() {
            debug!("Channel {} already has a player", channel);
            return None;
        }

        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                self.player_counter += 1;
                format!("P{}", self.player_counter)
            }
        };

        let (x, y) = self.random_position();
        info!("Added player {} on {} at ({}, {})", name, channel, x, y);

        self.players.push(Player {
            channel,
            name: name.clone(),
            x,
            y,
            score: 0,
        });
        Some(name)
    }

    /// Moves the player bound to `channel`, clamped to the play field.
    /// Negative coordinates are ignored.
    pub fn move_player(&mut self, channel: ChannelId, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 {
            return false;
        }

        let Some(player) = self.players.iter_mut().find(|p| p.channel == channel) else {
            return false;
        };

        player.x = x.min(WORLD_WIDTH as i64) as i32;
        player.y = y.min(WORLD_HEIGHT as i64) as i32;
        true
    }

    /// Fires a bullet. The direction is normalized, so every bullet travels at
    /// the same speed.
    pub fn spawn_bullet(&mut self, shooter: &str, x: i64, y: i64, dx: f64, dy: f64) -> Option<u32> {
        if shooter.is_empty() {
            return None;
        }

        let length = dx.hypot(dy);
        if !length.is_finite() || length == 0.0 {
            debug!("Rejected shot from {} with direction ({}, {})", shooter, dx, dy);
            return None;
        }

        let id = self.next_bullet_id;
        self.next_bullet_id += 1;

        self.bullets.push(Bullet {
            id,
            x: x as f64,
            y: y as f64,
            dx: dx / length,
            dy: dy / length,
            shooter: shooter.to_string(),
            active: true,
        });
        Some(id)
    }

    /// Removes the player bound to `channel`, if any.
    pub fn remove_player(&mut self, channel: ChannelId) -> Option<Player> {
        let index = self.players.iter().position(|p| p.channel == channel)?;
        let player = self.players.remove(index);
        info!("Removed player {} ({})", player.name, channel);
        Some(player)
    }

    /// Places an item at a fixed position and returns its id.
    pub fn spawn_item_at(&mut self, x: i32, y: i32) -> u32 {
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.items.push(Item {
            id,
            x,
            y,
            active: true,
        });
        id
    }

    /// Advances the world by one tick and returns the snapshot to broadcast,
    /// or `None` when nobody is playing.
    pub fn tick(&mut self) -> Option<Snapshot> {
        self.tick += 1;
        self.elapsed += self.tick_duration;

        self.collect_items();
        self.integrate_bullets();
        self.resolve_hits();
        self.respawn_items();

        self.items.retain(|item| item.active);
        self.bullets.retain(|bullet| bullet.active);

        if self.players.is_empty() {
            return None;
        }
        Some(self.snapshot())
    }

    fn collect_items(&mut self) {
        for item in self.items.iter_mut().filter(|item| item.active) {
            let collector = self.players.iter_mut().find(|player| {
                distance(
                    player.x as f64,
                    player.y as f64,
                    item.x as f64,
                    item.y as f64,
                ) < COLLECTION_RADIUS
            });

            if let Some(player) = collector {
                item.active = false;
                player.score += 1;
                debug!("{} collected item {}", player.name, item.id);
            }
        }
    }

    fn integrate_bullets(&mut self) {
        for bullet in self.bullets.iter_mut().filter(|bullet| bullet.active) {
            bullet.x += bullet.dx * BULLET_SPEED;
            bullet.y += bullet.dy * BULLET_SPEED;
            if bullet.out_of_bounds() {
                bullet.active = false;
            }
        }
    }

    fn resolve_hits(&mut self) {
        for bullet in self.bullets.iter_mut().filter(|bullet| bullet.active) {
            let victim = self.players.iter_mut().find(|player| {
                player.name != bullet.shooter
                    && distance(player.x as f64, player.y as f64, bullet.x, bullet.y) < HIT_RADIUS
            });

            if let Some(player) = victim {
                bullet.active = false;
                player.score = player.score.saturating_sub(1);
                debug!("{} hit {} with bullet {}", bullet.shooter, player.name, bullet.id);
            }
        }
    }

    fn respawn_items(&mut self) {
        if self.elapsed - self.last_item_spawn < self.item_spawn_interval {
            return;
        }
        self.last_item_spawn = self.elapsed;

        let (x, y) = self.random_position();
        let id = self.spawn_item_at(x, y);
        debug!("Spawned item {} at ({}, {})", id, x, y);
    }

    /// Copies every active entity into a wire view.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            players: self
                .players
                .iter()
                .map(|p| PlayerView {
                    name: p.name.clone(),
                    x: p.x,
                    y: p.y,
                    score: p.score,
                })
                .collect(),
            items: self
                .items
                .iter()
                .filter(|i| i.active)
                .map(|i| ItemView {
                    id: i.id,
                    x: i.x,
                    y: i.y,
                })
                .collect(),
            bullets: self
                .bullets
                .iter()
                .filter(|b| b.active)
                .map(|b| BulletView {
                    id: b.id,
                    x: b.x,
                    y: b.y,
                    dx: b.dx,
                    dy: b.dy,
                    shooter: b.shooter.clone(),
                })
                .collect(),
        }
    }

    pub fn player(&self, channel: ChannelId) -> Option<&Player> {
        self.players.iter().find(|p| p.channel == channel)
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn bullets(&self) -> &[Bullet] {
        &self.bullets
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Simulated time since the world was created.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
