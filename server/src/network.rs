//! Server loop: the single consumer of transport events.
//!
//! [`Server::run`] multiplexes three inputs with `tokio::select!`: the
//! transport event queue, the tick timer and the shutdown signal. Everything
//! that mutates sessions or the world happens in [`ServerState`], called from
//! that one loop, so no state here needs a lock.

use crate::config::ServerConfig;
use crate::error::{ServerError, StaleReference};
use crate::game::{World, WorldSettings};
use crate::session::SessionRegistry;
use crate::storage::{KeyValueStore, ONLINE_BY_SERVER_KEY};
use crate::transport::{
    ChannelId, ConnectionId, EventReceiver, EventSender, Transport, TransportEvent,
};
use log::{debug, info, warn};
use shared::{AuthStatus, ClientMessage, ServerMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Sessions, world and collaborators, driven by the server loop.
pub struct ServerState {
    config: ServerConfig,
    registry: SessionRegistry,
    world: World,
    store: Arc<dyn KeyValueStore>,
}

impl ServerState {
    pub fn new(config: ServerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let registry = SessionRegistry::new(config.max_message_size, config.auth_token.is_some())
            .with_send_limit(config.max_queued_bytes);
        let world = World::new(WorldSettings {
            tick_duration: config.tick_duration(),
            item_spawn_interval: config.item_spawn_interval,
            seed: config.seed,
        });

        Self {
            config,
            registry,
            world,
            store,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Applies one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        let outcome = match event {
            TransportEvent::ConnectionOpened { connection, remote } => {
                debug!("Connection {} opening from {}", connection, remote);
                self.registry.register(connection, Some(remote));
                Ok(())
            }
            TransportEvent::ConnectionEstablished {
                connection,
                control,
            } => self.registry.establish(connection, control),
            TransportEvent::ChannelOpened {
                connection,
                channel,
                sink,
            } => self.registry.bind_channel(connection, channel, sink),
            TransportEvent::DataReceived { channel, data } => self.handle_data(channel, &data),
            TransportEvent::ChannelFinished { channel } => self.registry.finish_channel(channel),
            TransportEvent::SendCompleted {
                channel,
                send_id,
                payload,
                result,
            } => self.registry.complete_send(channel, send_id, payload, result),
            TransportEvent::ConnectionClosed { connection, reason } => {
                info!("Connection {} closed: {}", connection, reason);
                self.disconnect(connection);
                Ok(())
            }
        };

        if let Err(stale) = outcome {
            match stale {
                // Completions routinely race with a close.
                StaleReference::Send(_) => debug!("Dropped event: {}", stale),
                _ => warn!("Dropped event: {}", stale),
            }
        }
    }

    fn handle_data(&mut self, channel: ChannelId, data: &[u8]) -> Result<(), StaleReference> {
        for frame in self.registry.receive(channel, data)? {
            match frame {
                Ok(message) => self.handle_message(channel, &message),
                Err(e) => warn!("Dropping message on {}: {}", channel, e),
            }
        }
        Ok(())
    }

    /// Decodes and applies one framed message from `channel`.
    pub fn handle_message(&mut self, channel: ChannelId, bytes: &[u8]) {
        let message = match ClientMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", channel, e);
                return;
            }
        };

        if let ClientMessage::Auth { token } = &message {
            self.authenticate(channel, token);
            return;
        }

        if !self.registry.is_authenticated(channel) {
            debug!(
                "Dropping {} from unauthenticated {}",
                message.action(),
                channel
            );
            return;
        }

        match message {
            ClientMessage::Join { player } => self.join(channel, player.as_deref()),
            ClientMessage::Move { x, y } => {
                if !self.world.move_player(channel, x, y) {
                    debug!("Ignored move to ({}, {}) from {}", x, y, channel);
                }
            }
            ClientMessage::Shoot {
                x,
                y,
                dx,
                dy,
                player,
            } => {
                self.world.spawn_bullet(&player, x, y, dx, dy);
            }
            ClientMessage::Auth { .. } => {}
        }
    }

    fn authenticate(&mut self, channel: ChannelId, token: &str) {
        let accepted = match &self.config.auth_token {
            Some(expected) => expected == token,
            None => true,
        };

        let reply = if accepted {
            if let Err(stale) = self.registry.authenticate(channel) {
                warn!("Dropped auth: {}", stale);
                return;
            }
            ServerMessage::Auth {
                status: AuthStatus::Ok,
                message: None,
            }
        } else {
            warn!("Rejected auth token on {}", channel);
            ServerMessage::Auth {
                status: AuthStatus::Error,
                message: Some("Invalid token".to_string()),
            }
        };

        self.reply(channel, &reply);
    }

    fn join(&mut self, channel: ChannelId, name: Option<&str>) {
        let Some(name) = self.world.add_player(channel, name) else {
            return;
        };

        if let Err(stale) = self.registry.bind_session(channel, &name) {
            warn!("Join on vanished channel: {}", stale);
            self.world.remove_player(channel);
            return;
        }

        self.reply(channel, &ServerMessage::Welcome { player: name });
        self.update_presence(1);
    }

    fn reply(&mut self, channel: ChannelId, message: &ServerMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode reply for {}: {}", channel, e);
                return;
            }
        };

        if let Err(e) = self.registry.send(channel, payload) {
            warn!("Reply to {} failed: {}", channel, e);
        }
    }

    /// Adjusts this instance's online counter without waiting for the store.
    fn update_presence(&self, delta: i64) {
        let store = Arc::clone(&self.store);
        let server_name = self.config.server_name.clone();

        tokio::spawn(async move {
            if let Err(e) = store
                .hash_incr_by(ONLINE_BY_SERVER_KEY, &server_name, delta)
                .await
            {
                warn!("Failed to update online count for {}: {}", server_name, e);
            }
        });
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        let Some(departed) = self.registry.unregister(connection) else {
            return;
        };

        if let Some(channel) = departed.channel {
            self.world.remove_player(channel);
        }
        if let Some(session) = departed.session {
            info!("Player {} left", session.name);
            self.update_presence(-1);
        }
    }

    /// Runs one world step and broadcasts the snapshot.
    pub fn tick(&mut self) {
        let Some(snapshot) = self.world.tick() else {
            return;
        };

        let payload = match snapshot.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode snapshot: {}", e);
                return;
            }
        };

        // Failed channels are already closing; their players go now.
        for channel in self.registry.broadcast(&payload) {
            self.world.remove_player(channel);
        }

        let tick = self.world.tick_count();
        if tick % (self.config.tick_rate.max(1) as u64 * 5) == 0 {
            debug!(
                "Tick {}: {} players, {} items, {} bullets, {} sends in flight",
                tick,
                snapshot.players.len(),
                snapshot.items.len(),
                snapshot.bullets.len(),
                self.registry.pending_sends()
            );
        }
    }

    /// Starts closing every connection.
    pub fn close_all(&mut self) {
        self.registry.close_all("server shutting down");
    }
}

/// The QUIC listener plus the loop that drives [`ServerState`].
pub struct Server {
    transport: Transport,
    state: ServerState,
    events_tx: EventSender,
    events_rx: EventReceiver,
}

impl Server {
    /// Binds the listener. Failing here is the only fatal error.
    pub fn bind(config: ServerConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ServerError> {
        let transport = Transport::bind(&config)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            transport,
            state: ServerState::new(config, store),
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Serves until `shutdown` resolves, then closes every connection and
    /// waits for the endpoint to go idle.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let accept_task = self.transport.start(self.events_tx.clone());

        let mut tick_interval = interval(self.state.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            "Server started on {} at {} Hz",
            self.local_addr()?,
            self.state.config.tick_rate
        );

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.state.handle_event(event),
                        None => break,
                    }
                },

                _ = tick_interval.tick() => {
                    self.state.tick();
                },

                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        self.state.close_all();
        self.transport.shutdown().await;
        if let Err(e) = accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        Ok(())
    }
}
