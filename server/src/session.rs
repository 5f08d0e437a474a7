//! Session registry.
//!
//! Tracks every connection and its default channel, the per-channel receive
//! accumulator, the application session bound to a channel after `join`, and
//! the table of sends that are still in flight. Only the server loop touches
//! the registry, so none of this is locked.
//!
//! Each channel may have at most `max_queued_bytes` waiting on the transport.
//! A peer that stops reading hits that limit, its next send fails and the
//! channel is torn down like any other failed channel.

use crate::config::DEFAULT_MAX_QUEUED_BYTES;
use crate::error::{SendError, StaleReference};
use crate::transport::{
    ChannelId, ChannelSink, ConnectionControl, ConnectionId, OutboundFrame, SendId,
    CLOSE_NORMAL, CLOSE_SEND_FAILED,
};
use log::{debug, info, warn};
use shared::{FrameBuffer, FrameError};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// The peer finished its send side; we can still write.
    HalfClosed,
    Closed,
}

/// Application identity bound to a channel by a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub channel: ChannelId,
    pub name: String,
    pub authenticated: bool,
}

/// What was left of a connection when it was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub connection: ConnectionId,
    pub channel: Option<ChannelId>,
    pub session: Option<Session>,
}

struct ConnectionEntry {
    state: ConnectionState,
    remote: Option<SocketAddr>,
    control: Option<Box<dyn ConnectionControl>>,
    channel: Option<ChannelId>,
}

impl ConnectionEntry {
    fn begin_shutdown(&mut self, code: u32, reason: &str) {
        if matches!(
            self.state,
            ConnectionState::ShuttingDown | ConnectionState::Closed
        ) {
            return;
        }
        self.state = ConnectionState::ShuttingDown;
        if let Some(control) = &self.control {
            control.close(code, reason);
        }
    }
}

struct ChannelEntry {
    connection: ConnectionId,
    state: ChannelState,
    sink: Box<dyn ChannelSink>,
    frames: FrameBuffer,
    queued_bytes: usize,
    authenticated: bool,
    session: Option<Session>,
}

impl ChannelEntry {
    fn close(&mut self) {
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Closed;
            self.sink.close();
        }
    }
}

#[derive(Debug)]
struct PendingSend {
    channel: ChannelId,
    len: usize,
}

pub struct SessionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: BTreeMap<ChannelId, ChannelEntry>,
    pending: HashMap<SendId, PendingSend>,
    next_send_id: u64,
    max_message_size: usize,
    max_queued_bytes: usize,
    require_auth: bool,
}

impl SessionRegistry {
    /// `require_auth` makes new channels start unauthenticated.
    pub fn new(max_message_size: usize, require_auth: bool) -> Self {
        Self {
            connections: HashMap::new(),
            channels: BTreeMap::new(),
            pending: HashMap::new(),
            next_send_id: 1,
            max_message_size,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            require_auth,
        }
    }

    /// Caps the bytes a single channel may have in flight.
    pub fn with_send_limit(mut self, max_queued_bytes: usize) -> Self {
        self.max_queued_bytes = max_queued_bytes;
        self
    }

    /// Starts tracking a connection. A second call for the same id does nothing.
    pub fn register(&mut self, connection: ConnectionId, remote: Option<SocketAddr>) {
        if self.connections.contains_key(&connection) {
            debug!("Connection {} already registered", connection);
            return;
        }

        self.connections.insert(
            connection,
            ConnectionEntry {
                state: ConnectionState::Connecting,
                remote,
                control: None,
                channel: None,
            },
        );
    }

    /// Handshake finished; the registry now owns the connection's control handle.
    pub fn establish(
        &mut self,
        connection: ConnectionId,
        control: Box<dyn ConnectionControl>,
    ) -> Result<(), StaleReference> {
        let entry = match self.connections.get_mut(&connection) {
            Some(entry) if entry.state == ConnectionState::Connecting => entry,
            _ => {
                control.close(CLOSE_NORMAL, "unknown connection");
                return Err(StaleReference::Connection(connection));
            }
        };

        entry.state = ConnectionState::Established;
        entry.control = Some(control);
        match entry.remote {
            Some(remote) => info!("Connection {} established from {}", connection, remote),
            None => info!("Connection {} established", connection),
        }
        Ok(())
    }

    /// Records the default channel of a connection. Extra channels are refused.
    pub fn bind_channel(
        &mut self,
        connection: ConnectionId,
        channel: ChannelId,
        sink: Box<dyn ChannelSink>,
    ) -> Result<(), StaleReference> {
        let entry = match self.connections.get_mut(&connection) {
            Some(entry) if entry.state == ConnectionState::Established => entry,
            _ => {
                sink.close();
                return Err(StaleReference::Connection(connection));
            }
        };

        if let Some(existing) = entry.channel {
            warn!(
                "Connection {} opened extra channel {} (default is {}), ignoring",
                connection, channel, existing
            );
            sink.close();
            return Ok(());
        }

        entry.channel = Some(channel);
        self.channels.insert(
            channel,
            ChannelEntry {
                connection,
                state: ChannelState::Open,
                sink,
                frames: FrameBuffer::with_max_len(self.max_message_size),
                queued_bytes: 0,
                authenticated: !self.require_auth,
                session: None,
            },
        );
        debug!("Channel {} bound to connection {}", channel, connection);
        Ok(())
    }

    /// Forgets a connection, its channel and its session. Safe when absent.
    ///
    /// Sends still in flight for the channel are dropped from the pending
    /// table; their completions will show up as stale.
    pub fn unregister(&mut self, connection: ConnectionId) -> Option<Departed> {
        let entry = self.connections.remove(&connection)?;

        let mut departed = Departed {
            connection,
            channel: entry.channel,
            session: None,
        };

        if let Some(channel) = entry.channel {
            if let Some(mut channel_entry) = self.channels.remove(&channel) {
                channel_entry.close();
                departed.session = channel_entry.session.take();
            }
            self.pending.retain(|_, pending| pending.channel != channel);
        }

        info!("Connection {} unregistered", connection);
        Some(departed)
    }

    /// Appends received bytes to the channel accumulator and returns the
    /// complete messages now available.
    pub fn receive(
        &mut self,
        channel: ChannelId,
        data: &[u8],
    ) -> Result<Vec<Result<Vec<u8>, FrameError>>, StaleReference> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(StaleReference::Channel(channel))?;

        let connection_live = self
            .connections
            .get(&entry.connection)
            .map(|c| c.state == ConnectionState::Established)
            .unwrap_or(false);

        if entry.state != ChannelState::Open || !connection_live {
            debug!(
                "Dropping {} bytes on {} ({:?})",
                data.len(),
                channel,
                entry.state
            );
            return Ok(Vec::new());
        }

        Ok(entry.frames.push(data).collect())
    }

    /// The peer will send nothing more on this channel.
    pub fn finish_channel(&mut self, channel: ChannelId) -> Result<(), StaleReference> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(StaleReference::Channel(channel))?;

        if entry.state == ChannelState::Open {
            entry.state = ChannelState::HalfClosed;
            if entry.frames.pending() > 0 {
                debug!(
                    "Discarding {} unterminated bytes on {}",
                    entry.frames.pending(),
                    channel
                );
                entry.frames.clear();
            }
        }
        Ok(())
    }

    /// Submits one message for delivery and returns its correlation id.
    ///
    /// A message is always accepted on an idle channel, whatever its size.
    /// Otherwise it is refused once it would take the channel past the send
    /// limit.
    pub fn send(&mut self, channel: ChannelId, payload: Vec<u8>) -> Result<SendId, SendError> {
        let entry = match self.channels.get_mut(&channel) {
            Some(entry) if entry.state != ChannelState::Closed => entry,
            _ => return Err(SendError::ChannelClosed(channel)),
        };

        let connection_live = self
            .connections
            .get(&entry.connection)
            .map(|c| c.state == ConnectionState::Established)
            .unwrap_or(false);
        if !connection_live {
            return Err(SendError::ChannelClosed(channel));
        }

        let len = payload.len();
        if entry.queued_bytes > 0 && entry.queued_bytes + len > self.max_queued_bytes {
            return Err(SendError::Backlogged {
                channel,
                queued: entry.queued_bytes,
            });
        }

        let send_id = SendId(self.next_send_id);
        self.next_send_id += 1;

        entry
            .sink
            .submit(OutboundFrame { send_id, payload })
            .map_err(|_rejected| SendError::QueueClosed(channel))?;

        entry.queued_bytes += len;
        self.pending.insert(send_id, PendingSend { channel, len });
        Ok(send_id)
    }

    /// Sends a copy of `payload` to every open channel with a session.
    ///
    /// Returns the channels that failed. Those are put on the way out: the
    /// channel is closed and its connection starts shutting down.
    pub fn broadcast(&mut self, payload: &[u8]) -> Vec<ChannelId> {
        let targets: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, entry)| {
                entry.state != ChannelState::Closed
                    && entry.authenticated
                    && entry.session.is_some()
            })
            .map(|(id, _)| *id)
            .collect();

        let mut failed = Vec::new();
        for channel in targets {
            if let Err(e) = self.send(channel, payload.to_vec()) {
                warn!("Broadcast to {} failed: {}", channel, e);
                self.close_channel(channel, CLOSE_SEND_FAILED, "send failed");
                failed.push(channel);
            }
        }
        failed
    }

    /// Handles a send completion. The payload is released here, once.
    pub fn complete_send(
        &mut self,
        channel: ChannelId,
        send_id: SendId,
        payload: Vec<u8>,
        result: Result<(), String>,
    ) -> Result<(), StaleReference> {
        drop(payload);

        let pending = self
            .pending
            .remove(&send_id)
            .ok_or(StaleReference::Send(send_id))?;

        if let Some(entry) = self.channels.get_mut(&pending.channel) {
            entry.queued_bytes = entry.queued_bytes.saturating_sub(pending.len);
        }

        if let Err(reason) = result {
            warn!(
                "Send {} of {} bytes on {} failed: {}",
                send_id, pending.len, channel, reason
            );
            self.close_channel(channel, CLOSE_SEND_FAILED, "send failed");
        }
        Ok(())
    }

    /// Closes a channel and begins shutting down its connection. Idempotent.
    pub fn close_channel(&mut self, channel: ChannelId, code: u32, reason: &str) {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return;
        };
        entry.close();

        if let Some(connection) = self.connections.get_mut(&entry.connection) {
            connection.begin_shutdown(code, reason);
        }
    }

    /// Closes every connection, used on server shutdown.
    pub fn close_all(&mut self, reason: &str) {
        for entry in self.channels.values_mut() {
            entry.close();
        }
        for connection in self.connections.values_mut() {
            connection.begin_shutdown(CLOSE_NORMAL, reason);
        }
    }

    pub fn bind_session(&mut self, channel: ChannelId, name: &str) -> Result<(), StaleReference> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(StaleReference::Channel(channel))?;

        if entry.session.is_none() {
            entry.session = Some(Session {
                channel,
                name: name.to_string(),
                authenticated: entry.authenticated,
            });
        }
        Ok(())
    }

    pub fn session(&self, channel: ChannelId) -> Option<&Session> {
        self.channels.get(&channel)?.session.as_ref()
    }

    pub fn authenticate(&mut self, channel: ChannelId) -> Result<(), StaleReference> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(StaleReference::Channel(channel))?;

        entry.authenticated = true;
        if let Some(session) = entry.session.as_mut() {
            session.authenticated = true;
        }
        Ok(())
    }

    pub fn is_authenticated(&self, channel: ChannelId) -> bool {
        self.channels
            .get(&channel)
            .map(|entry| entry.authenticated)
            .unwrap_or(false)
    }

    pub fn connection_state(&self, connection: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&connection).map(|entry| entry.state)
    }

    pub fn channel_state(&self, channel: ChannelId) -> Option<ChannelState> {
        self.channels.get(&channel).map(|entry| entry.state)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    /// Bytes submitted on `channel` that have not completed yet.
    pub fn queued_bytes(&self, channel: ChannelId) -> Option<usize> {
        self.channels.get(&channel).map(|entry| entry.queued_bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Channel sink that records what it was given.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub frames: Arc<Mutex<Vec<OutboundFrame>>>,
        pub closed: Arc<AtomicBool>,
        pub reject: Arc<AtomicBool>,
    }

    impl RecordingSink {
        pub fn payloads(&self) -> Vec<Vec<u8>> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.payload.clone())
                .collect()
        }

        pub fn take(&self) -> Vec<OutboundFrame> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }
    }

    impl ChannelSink for RecordingSink {
        fn submit(&self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
            if self.reject.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                return Err(frame);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingControl {
        pub closes: Arc<AtomicU32>,
    }

    impl ConnectionControl for RecordingControl {
        fn close(&self, _code: u32, _reason: &str) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connected(
        registry: &mut SessionRegistry,
        connection: u64,
        channel: u64,
    ) -> (RecordingSink, RecordingControl) {
        let sink = RecordingSink::default();
        let control = RecordingControl::default();
        registry.register(ConnectionId(connection), None);
        registry
            .establish(ConnectionId(connection), Box::new(control.clone()))
            .unwrap();
        registry
            .bind_channel(ConnectionId(connection), ChannelId(channel), Box::new(sink.clone()))
            .unwrap();
        (sink, control)
    }

    fn joined(
        registry: &mut SessionRegistry,
        connection: u64,
        channel: u64,
    ) -> (RecordingSink, RecordingControl) {
        let handles = connected(registry, connection, channel);
        registry
            .bind_session(ChannelId(channel), &format!("player{}", channel))
            .unwrap();
        handles
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = SessionRegistry::new(1024, false);

        registry.register(ConnectionId(1), None);
        registry.register(ConnectionId(1), None);

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(
            registry.connection_state(ConnectionId(1)),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, control) = connected(&mut registry, 1, 10);

        assert_eq!(
            registry.connection_state(ConnectionId(1)),
            Some(ConnectionState::Established)
        );
        assert_eq!(registry.channel_state(ChannelId(10)), Some(ChannelState::Open));

        registry.close_channel(ChannelId(10), CLOSE_SEND_FAILED, "test");
        registry.close_channel(ChannelId(10), CLOSE_SEND_FAILED, "test");
        assert_eq!(
            registry.connection_state(ConnectionId(1)),
            Some(ConnectionState::ShuttingDown)
        );
        assert_eq!(control.closes.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(ConnectionId(1)).is_some());
        assert!(registry.unregister(ConnectionId(1)).is_none());
        assert_eq!(registry.connection_state(ConnectionId(1)), None);
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_establish_unknown_connection_is_stale() {
        let mut registry = SessionRegistry::new(1024, false);
        let control = RecordingControl::default();

        let result = registry.establish(ConnectionId(9), Box::new(control.clone()));

        assert_eq!(result, Err(StaleReference::Connection(ConnectionId(9))));
        assert_eq!(control.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_channel_is_ignored() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        let extra = RecordingSink::default();
        registry
            .bind_channel(ConnectionId(1), ChannelId(11), Box::new(extra.clone()))
            .unwrap();

        assert_eq!(registry.channel_count(), 1);
        assert_eq!(registry.channel_state(ChannelId(11)), None);
        assert!(extra.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_receive_frames_across_chunks() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        let first = registry.receive(ChannelId(10), b"{\"a\":1}\n{\"b\"").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), b"{\"a\":1}");

        let second = registry.receive(ChannelId(10), b":2}\n").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref().unwrap(), b"{\"b\":2}");
    }

    #[test]
    fn test_receive_oversized_message() {
        let mut registry = SessionRegistry::new(8, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        let frames = registry
            .receive(ChannelId(10), b"0123456789abcdef\nok\n")
            .unwrap();

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::Oversized { .. })));
        assert_eq!(frames[1].as_ref().unwrap(), b"ok");
    }

    #[test]
    fn test_receive_unknown_channel_is_stale() {
        let mut registry = SessionRegistry::new(1024, false);

        let result = registry.receive(ChannelId(3), b"hello\n");
        assert_eq!(result, Err(StaleReference::Channel(ChannelId(3))));
    }

    #[test]
    fn test_data_after_shutdown_is_not_forwarded() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        registry.close_channel(ChannelId(10), CLOSE_SEND_FAILED, "test");

        let frames = registry.receive(ChannelId(10), b"late\n").unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_data_after_finish_is_not_forwarded() {
        let mut registry = SessionRegistry::new(1024, false);
        let (sink, _control) = connected(&mut registry, 1, 10);

        registry.receive(ChannelId(10), b"partial").unwrap();
        registry.finish_channel(ChannelId(10)).unwrap();
        assert_eq!(
            registry.channel_state(ChannelId(10)),
            Some(ChannelState::HalfClosed)
        );

        assert!(registry.receive(ChannelId(10), b"more\n").unwrap().is_empty());

        // Half-closed channels still take outbound traffic.
        assert!(registry.send(ChannelId(10), b"x\n".to_vec()).is_ok());
        assert_eq!(sink.payloads(), vec![b"x\n".to_vec()]);
    }

    #[test]
    fn test_send_and_complete() {
        let mut registry = SessionRegistry::new(1024, false);
        let (sink, _control) = connected(&mut registry, 1, 10);

        let send_id = registry.send(ChannelId(10), b"hello\n".to_vec()).unwrap();
        assert_eq!(registry.pending_sends(), 1);

        let frame = sink.take().pop().unwrap();
        assert_eq!(frame.send_id, send_id);

        registry
            .complete_send(ChannelId(10), send_id, frame.payload, Ok(()))
            .unwrap();
        assert_eq!(registry.pending_sends(), 0);

        // A second completion for the same send is stale.
        let again = registry.complete_send(ChannelId(10), send_id, Vec::new(), Ok(()));
        assert_eq!(again, Err(StaleReference::Send(send_id)));
    }

    #[test]
    fn test_send_ids_are_monotonic() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        let first = registry.send(ChannelId(10), b"a\n".to_vec()).unwrap();
        let second = registry.send(ChannelId(10), b"b\n".to_vec()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_send_to_unknown_channel() {
        let mut registry = SessionRegistry::new(1024, false);

        let result = registry.send(ChannelId(5), b"x\n".to_vec());
        assert_eq!(result, Err(SendError::ChannelClosed(ChannelId(5))));
    }

    #[test]
    fn test_send_to_closing_channel() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        registry.close_channel(ChannelId(10), CLOSE_NORMAL, "bye");

        let result = registry.send(ChannelId(10), b"x\n".to_vec());
        assert_eq!(result, Err(SendError::ChannelClosed(ChannelId(10))));
        assert_eq!(registry.pending_sends(), 0);
    }

    #[test]
    fn test_send_rejected_by_transport() {
        let mut registry = SessionRegistry::new(1024, false);
        let (sink, _control) = connected(&mut registry, 1, 10);
        sink.reject.store(true, Ordering::SeqCst);

        let result = registry.send(ChannelId(10), b"x\n".to_vec());
        assert_eq!(result, Err(SendError::QueueClosed(ChannelId(10))));
        assert_eq!(registry.pending_sends(), 0);
    }

    #[test]
    fn test_send_refused_past_queue_limit() {
        let mut registry = SessionRegistry::new(1024, false).with_send_limit(10);
        let (sink, _control) = connected(&mut registry, 1, 10);

        // An idle channel takes a message even when it is over the limit.
        let big = registry.send(ChannelId(10), vec![b'x'; 16]).unwrap();
        assert_eq!(registry.queued_bytes(ChannelId(10)), Some(16));

        let result = registry.send(ChannelId(10), b"y\n".to_vec());
        assert_eq!(
            result,
            Err(SendError::Backlogged {
                channel: ChannelId(10),
                queued: 16
            })
        );
        assert_eq!(registry.pending_sends(), 1);

        let frame = sink.take().pop().unwrap();
        registry
            .complete_send(ChannelId(10), big, frame.payload, Ok(()))
            .unwrap();
        assert_eq!(registry.queued_bytes(ChannelId(10)), Some(0));

        registry.send(ChannelId(10), vec![b'a'; 4]).unwrap();
        registry.send(ChannelId(10), vec![b'b'; 6]).unwrap();
        assert_eq!(registry.queued_bytes(ChannelId(10)), Some(10));
        assert!(registry.send(ChannelId(10), b"c".to_vec()).is_err());
    }

    #[test]
    fn test_stalled_reader_is_dropped_by_broadcast() {
        let mut registry = SessionRegistry::new(1024, false).with_send_limit(64);
        let (stalled, stalled_control) = joined(&mut registry, 1, 10);
        let (reader, _) = joined(&mut registry, 2, 20);

        let mut dropped = Vec::new();
        for _ in 0..100 {
            dropped.extend(registry.broadcast(b"0123456789abcdef\n"));
            // Only the healthy peer ever completes its sends.
            for frame in reader.take() {
                registry
                    .complete_send(ChannelId(20), frame.send_id, frame.payload, Ok(()))
                    .unwrap();
            }
        }

        assert_eq!(dropped, vec![ChannelId(10)]);
        assert_eq!(registry.channel_state(ChannelId(10)), Some(ChannelState::Closed));
        assert_eq!(stalled_control.closes.load(Ordering::SeqCst), 1);
        assert!(stalled.payloads().len() <= 4);
        assert_eq!(registry.pending_sends(), stalled.payloads().len());
        assert_eq!(registry.channel_state(ChannelId(20)), Some(ChannelState::Open));
    }

    #[test]
    fn test_failed_completion_starts_shutdown() {
        let mut registry = SessionRegistry::new(1024, false);
        let (sink, control) = connected(&mut registry, 1, 10);

        let send_id = registry.send(ChannelId(10), b"x\n".to_vec()).unwrap();
        let frame = sink.take().pop().unwrap();
        registry
            .complete_send(ChannelId(10), send_id, frame.payload, Err("reset".into()))
            .unwrap();

        assert_eq!(registry.channel_state(ChannelId(10)), Some(ChannelState::Closed));
        assert_eq!(
            registry.connection_state(ConnectionId(1)),
            Some(ConnectionState::ShuttingDown)
        );
        assert_eq!(control.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_purges_pending_sends() {
        let mut registry = SessionRegistry::new(1024, false);
        let (sink, _control) = connected(&mut registry, 1, 10);

        let send_id = registry.send(ChannelId(10), b"x\n".to_vec()).unwrap();
        registry.unregister(ConnectionId(1));
        assert_eq!(registry.pending_sends(), 0);
        assert!(sink.closed.load(Ordering::SeqCst));

        let frame = sink.take().pop().unwrap();
        let late = registry.complete_send(ChannelId(10), send_id, frame.payload, Ok(()));
        assert_eq!(late, Err(StaleReference::Send(send_id)));
    }

    #[test]
    fn test_broadcast_continues_past_failures() {
        let mut registry = SessionRegistry::new(1024, false);
        let (good_a, _) = joined(&mut registry, 1, 10);
        let (bad, bad_control) = joined(&mut registry, 2, 20);
        let (good_b, _) = joined(&mut registry, 3, 30);
        bad.reject.store(true, Ordering::SeqCst);

        let failed = registry.broadcast(b"snapshot\n");

        assert_eq!(failed, vec![ChannelId(20)]);
        assert_eq!(good_a.payloads(), vec![b"snapshot\n".to_vec()]);
        assert_eq!(good_b.payloads(), vec![b"snapshot\n".to_vec()]);
        assert_eq!(bad_control.closes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.channel_state(ChannelId(20)), Some(ChannelState::Closed));

        // Closed channels are skipped on the next round.
        assert!(registry.broadcast(b"again\n").is_empty());
        assert_eq!(good_a.payloads().len(), 2);
    }

    #[test]
    fn test_broadcast_skips_channels_without_session() {
        let mut registry = SessionRegistry::new(1024, false);
        let (watcher, _) = connected(&mut registry, 1, 10);
        let (player, _) = joined(&mut registry, 2, 20);

        assert!(registry.broadcast(b"snapshot\n").is_empty());
        assert!(watcher.payloads().is_empty());
        assert_eq!(player.payloads().len(), 1);
    }

    #[test]
    fn test_broadcast_skips_unauthenticated_channels() {
        let mut registry = SessionRegistry::new(1024, true);
        let (sink, _control) = joined(&mut registry, 1, 10);

        assert!(!registry.is_authenticated(ChannelId(10)));
        registry.broadcast(b"snapshot\n");
        assert!(sink.payloads().is_empty());

        registry.authenticate(ChannelId(10)).unwrap();
        registry.broadcast(b"snapshot\n");
        assert_eq!(sink.payloads().len(), 1);
    }

    #[test]
    fn test_session_binding() {
        let mut registry = SessionRegistry::new(1024, false);
        let (_sink, _control) = connected(&mut registry, 1, 10);

        assert!(registry.session(ChannelId(10)).is_none());
        registry.bind_session(ChannelId(10), "Alice").unwrap();
        registry.bind_session(ChannelId(10), "Bob").unwrap();

        let session = registry.session(ChannelId(10)).unwrap();
        assert_eq!(session.name, "Alice");
        assert!(session.authenticated);

        let departed = registry.unregister(ConnectionId(1)).unwrap();
        assert_eq!(departed.channel, Some(ChannelId(10)));
        assert_eq!(departed.session.map(|s| s.name), Some("Alice".to_string()));
    }

    #[test]
    fn test_close_all() {
        let mut registry = SessionRegistry::new(1024, false);
        let (sink_a, control_a) = connected(&mut registry, 1, 10);
        let (sink_b, control_b) = connected(&mut registry, 2, 20);

        registry.close_all("server shutting down");

        assert!(sink_a.closed.load(Ordering::SeqCst));
        assert!(sink_b.closed.load(Ordering::SeqCst));
        assert_eq!(control_a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(control_b.closes.load(Ordering::SeqCst), 1);
    }
}
