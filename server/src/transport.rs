//! QUIC transport adapter.
//!
//! quinn drives connections and streams on tokio worker tasks. This module
//! turns everything those tasks observe into [`TransportEvent`]s posted on a
//! single unbounded queue, so the server loop is the only place where session
//! and world state ever change:
//!
//! - one accept task per endpoint, one task per connection
//! - per bidirectional stream, a reader task (copies received bytes out of
//!   quinn's buffers) and a writer task (owns the `SendStream`); closing the
//!   channel's sink ends both
//! - every frame handed to a writer comes back exactly once in a
//!   `SendCompleted` event, successful or not

use crate::config::{CertificateConfig, ServerConfig};
use crate::error::ServerError;
use log::{debug, info, warn};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Endpoint, RecvStream, SendStream, TransportConfig, VarInt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use shared::ALPN_PROTOCOL;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 4096;

/// Application close code used for orderly shutdown.
pub const CLOSE_NORMAL: u32 = 0;
/// Application close code used when the server drops a misbehaving peer.
pub const CLOSE_SEND_FAILED: u32 = 1;

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(ConnectionId, "conn");
id_type!(ChannelId, "chan");
id_type!(SendId, "send");

/// Hands out process-wide identifiers. Called from transport tasks, so atomic.
#[derive(Debug, Default)]
pub struct IdAllocator {
    connections: AtomicU64,
    channels: AtomicU64,
}

impl IdAllocator {
    pub fn next_connection(&self) -> ConnectionId {
        ConnectionId(self.connections.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn next_channel(&self) -> ChannelId {
        ChannelId(self.channels.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// An outbound message. The payload is owned by whoever holds the frame: the
/// registry before submission, the transport while in flight, and the
/// registry again once it comes back in `SendCompleted`.
#[derive(Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    pub send_id: SendId,
    pub payload: Vec<u8>,
}

/// Send half of a channel, as seen by the session registry.
pub trait ChannelSink: Send {
    /// Queues a frame for delivery. A rejected frame is handed back untouched.
    fn submit(&self, frame: OutboundFrame) -> Result<(), OutboundFrame>;

    /// Stops accepting frames, finishes the stream once queued frames are
    /// written and stops reading from it. Safe to call more than once.
    fn close(&self);
}

/// Control half of a connection.
pub trait ConnectionControl: Send {
    /// Closes the connection. Safe to call more than once.
    fn close(&self, code: u32, reason: &str);
}

impl fmt::Debug for dyn ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelSink")
    }
}

impl fmt::Debug for dyn ConnectionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionControl")
    }
}

/// Normalized transport events, in the order the transport observed them.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer started a handshake.
    ConnectionOpened {
        connection: ConnectionId,
        remote: SocketAddr,
    },
    /// The handshake completed.
    ConnectionEstablished {
        connection: ConnectionId,
        control: Box<dyn ConnectionControl>,
    },
    /// The peer opened a bidirectional stream.
    ChannelOpened {
        connection: ConnectionId,
        channel: ChannelId,
        sink: Box<dyn ChannelSink>,
    },
    /// Bytes arrived on a channel. Always a private copy.
    DataReceived { channel: ChannelId, data: Vec<u8> },
    /// The peer finished its send side of a channel.
    ChannelFinished { channel: ChannelId },
    /// A submitted frame left the transport, returning its payload.
    SendCompleted {
        channel: ChannelId,
        send_id: SendId,
        payload: Vec<u8>,
        result: Result<(), String>,
    },
    /// The connection is gone, for whatever reason.
    ConnectionClosed {
        connection: ConnectionId,
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// [`ChannelSink`] backed by a writer task and a reader task.
pub struct QuicChannelSink {
    frames: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    stop_reading: Mutex<Option<oneshot::Sender<()>>>,
}

impl QuicChannelSink {
    pub fn new(
        frames: mpsc::UnboundedSender<OutboundFrame>,
        stop_reading: oneshot::Sender<()>,
    ) -> Self {
        Self {
            frames: Mutex::new(Some(frames)),
            stop_reading: Mutex::new(Some(stop_reading)),
        }
    }
}

impl ChannelSink for QuicChannelSink {
    fn submit(&self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
        let guard = match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(frames) => frames.send(frame).map_err(|e| e.0),
            None => Err(frame),
        }
    }

    fn close(&self) {
        let mut guard = match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Dropping the sender ends the writer loop.
        guard.take();
        drop(guard);

        let mut stop = match self.stop_reading.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(stop) = stop.take() {
            let _ = stop.send(());
        }
    }
}

struct QuicConnectionControl {
    connection: quinn::Connection,
}

impl ConnectionControl for QuicConnectionControl {
    fn close(&self, code: u32, reason: &str) {
        self.connection
            .close(VarInt::from_u32(code), reason.as_bytes());
    }
}

/// Listening QUIC endpoint.
pub struct Transport {
    endpoint: Endpoint,
}

impl Transport {
    /// Binds the UDP socket and configures TLS. Must run inside a tokio runtime.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let server_config = build_server_config(config)?;
        let endpoint = Endpoint::server(server_config, config.bind_addr)?;
        info!("QUIC listener bound on {}", endpoint.local_addr()?);
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Spawns the accept loop. Every event is posted to `events`.
    pub fn start(&self, events: EventSender) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();

        tokio::spawn(async move {
            let ids = Arc::new(IdAllocator::default());

            while let Some(incoming) = endpoint.accept().await {
                let connection = ids.next_connection();
                tokio::spawn(run_connection(
                    incoming,
                    connection,
                    Arc::clone(&ids),
                    events.clone(),
                ));
            }

            info!("QUIC endpoint closed");
        })
    }

    /// Closes every connection and waits for the endpoint to drain.
    pub async fn shutdown(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_NORMAL), b"server shutting down");
        self.endpoint.wait_idle().await;
    }
}

async fn run_connection(
    incoming: quinn::Incoming,
    connection: ConnectionId,
    ids: Arc<IdAllocator>,
    events: EventSender,
) {
    let remote = incoming.remote_address();
    let _ = events.send(TransportEvent::ConnectionOpened { connection, remote });

    let established = match incoming.await {
        Ok(established) => established,
        Err(e) => {
            warn!("Handshake with {} failed: {}", remote, e);
            let _ = events.send(TransportEvent::ConnectionClosed {
                connection,
                reason: e.to_string(),
            });
            return;
        }
    };

    let _ = events.send(TransportEvent::ConnectionEstablished {
        connection,
        control: Box::new(QuicConnectionControl {
            connection: established.clone(),
        }),
    });

    let reason = loop {
        match established.accept_bi().await {
            Ok((send, recv)) => {
                let channel = ids.next_channel();
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                let (stop_tx, stop_rx) = oneshot::channel();

                let opened = TransportEvent::ChannelOpened {
                    connection,
                    channel,
                    sink: Box::new(QuicChannelSink::new(frames_tx, stop_tx)),
                };
                if events.send(opened).is_err() {
                    break "server loop stopped".to_string();
                }

                tokio::spawn(run_channel_writer(channel, send, frames_rx, events.clone()));
                tokio::spawn(run_channel_reader(channel, recv, stop_rx, events.clone()));
            }
            Err(e) => break e.to_string(),
        }
    };

    debug!("Connection {} from {} ended: {}", connection, remote, reason);
    let _ = events.send(TransportEvent::ConnectionClosed { connection, reason });
}

/// Reads until the peer finishes, the stream fails or the sink is closed.
/// A closed sink stops the stream so the peer learns nothing more is read.
async fn run_channel_reader(
    channel: ChannelId,
    mut recv: RecvStream,
    mut stopped: oneshot::Receiver<()>,
    events: EventSender,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            read = recv.read(&mut buffer) => Some(read),
            _ = &mut stopped => None,
        };
        let Some(read) = read else {
            debug!("Stopped reading {}", channel);
            let _ = recv.stop(VarInt::from_u32(CLOSE_NORMAL));
            break;
        };

        match read {
            Ok(Some(len)) => {
                let data = buffer[..len].to_vec();
                if events
                    .send(TransportEvent::DataReceived { channel, data })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(TransportEvent::ChannelFinished { channel });
                break;
            }
            Err(e) => {
                debug!("Read on {} stopped: {}", channel, e);
                break;
            }
        }
    }
}

async fn run_channel_writer(
    channel: ChannelId,
    mut send: SendStream,
    mut frames: mpsc::UnboundedReceiver<OutboundFrame>,
    events: EventSender,
) {
    while let Some(frame) = frames.recv().await {
        let result = send
            .write_all(&frame.payload)
            .await
            .map_err(|e| e.to_string());
        let failed = result.is_err();

        let _ = events.send(TransportEvent::SendCompleted {
            channel,
            send_id: frame.send_id,
            payload: frame.payload,
            result,
        });

        if failed {
            break;
        }
    }

    // Anything still queued never reached the wire; hand it back as failed.
    frames.close();
    while let Ok(frame) = frames.try_recv() {
        let _ = events.send(TransportEvent::SendCompleted {
            channel,
            send_id: frame.send_id,
            payload: frame.payload,
            result: Err("channel closed".to_string()),
        });
    }

    let _ = send.finish();
}

fn build_server_config(config: &ServerConfig) -> Result<quinn::ServerConfig, ServerError> {
    // Another component may have installed a provider already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (cert_chain, private_key) = load_identity(&config.certificate)?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;
    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(server_crypto).map_err(|e| ServerError::Quic(e.to_string()))?,
    ));

    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(
        VarInt::from_u64(config.idle_timeout.as_millis() as u64)
            .map_err(|_| ServerError::Quic("idle timeout out of range".to_string()))?
            .into(),
    ));
    transport_config.keep_alive_interval(Some(config.keep_alive_interval));
    server_config.transport_config(Arc::new(transport_config));

    Ok(server_config)
}

/// Loads or generates the certificate chain and key for the endpoint.
pub fn load_identity(
    certificate: &CertificateConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    match certificate {
        CertificateConfig::SelfSigned { hostnames } => {
            let certified =
                rcgen::generate_simple_self_signed(hostnames.clone()).map_err(|e| {
                    ServerError::Certificate(format!("self-signed generation failed: {}", e))
                })?;
            let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
            Ok((vec![certified.cert.der().clone()], PrivateKeyDer::Pkcs8(key)))
        }
        CertificateConfig::PemFiles {
            cert_path,
            key_path,
        } => {
            let certs = CertificateDer::pem_file_iter(cert_path)
                .map_err(|e| ServerError::Certificate(format!("{}: {}", cert_path.display(), e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ServerError::Certificate(format!("{}: {}", cert_path.display(), e)))?;
            if certs.is_empty() {
                return Err(ServerError::Certificate(format!(
                    "{}: no certificates found",
                    cert_path.display()
                )));
            }
            let key = PrivateKeyDer::from_pem_file(key_path)
                .map_err(|e| ServerError::Certificate(format!("{}: {}", key_path.display(), e)))?;
            Ok((certs, key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Two endpoints on loopback with one bidirectional stream open between them.
    struct Loopback {
        _server: Endpoint,
        _client: Endpoint,
        server_connection: quinn::Connection,
        server_send: SendStream,
        server_recv: RecvStream,
        client_recv: RecvStream,
        _client_send: SendStream,
    }

    async fn loopback() -> Loopback {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = Endpoint::server(build_server_config(&config).unwrap(), config.bind_addr)
            .unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        client.set_default_client_config(crate::dev_client::client_config().unwrap());

        let (client_connection, server_connection) = tokio::join!(
            async { client.connect(addr, "localhost").unwrap().await.unwrap() },
            async { server.accept().await.unwrap().await.unwrap() },
        );

        let (mut client_send, client_recv) = client_connection.open_bi().await.unwrap();
        client_send.write_all(b"hello\n").await.unwrap();
        let (server_send, server_recv) = server_connection.accept_bi().await.unwrap();

        Loopback {
            _server: server,
            _client: client,
            server_connection,
            server_send,
            server_recv,
            client_recv,
            _client_send: client_send,
        }
    }

    fn queued_sink(count: u64) -> (QuicChannelSink, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (stop, _stopped) = oneshot::channel();
        let sink = QuicChannelSink::new(frames_tx, stop);
        for id in 1..=count {
            let frame = OutboundFrame {
                send_id: SendId(id),
                payload: vec![b'x'; 1024],
            };
            assert!(sink.submit(frame).is_ok());
        }
        (sink, frames_rx)
    }

    /// Every completion the writer reported, in order, until it dropped its sender.
    async fn completions(mut events: EventReceiver) -> Vec<(SendId, Result<(), String>)> {
        let mut done = Vec::new();
        while let Some(event) = timeout(WAIT, events.recv()).await.unwrap() {
            match event {
                TransportEvent::SendCompleted {
                    channel,
                    send_id,
                    payload,
                    result,
                } => {
                    assert_eq!(channel, ChannelId(1));
                    assert_eq!(payload.len(), 1024);
                    done.push((send_id, result));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        done
    }

    fn distinct(done: &[(SendId, Result<(), String>)]) -> usize {
        done.iter().map(|(id, _)| *id).collect::<HashSet<_>>().len()
    }

    #[tokio::test]
    async fn test_writer_completes_every_frame_once() {
        let mut pair = loopback().await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sink, frames_rx) = queued_sink(20);
        sink.close();

        let writer = tokio::spawn(run_channel_writer(
            ChannelId(1),
            pair.server_send,
            frames_rx,
            events_tx,
        ));
        timeout(WAIT, writer).await.unwrap().unwrap();

        let done = completions(events_rx).await;
        assert_eq!(done.len(), 20);
        assert_eq!(distinct(&done), 20);
        assert!(done.iter().all(|(_, result)| result.is_ok()));

        // The stream is finished after the last frame.
        let received = timeout(WAIT, pair.client_recv.read_to_end(1 << 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 20 * 1024);
    }

    #[tokio::test]
    async fn test_writer_returns_queued_frames_after_failure() {
        let pair = loopback().await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (_sink, frames_rx) = queued_sink(20);

        pair.server_connection
            .close(VarInt::from_u32(CLOSE_SEND_FAILED), b"gone");

        let writer = tokio::spawn(run_channel_writer(
            ChannelId(1),
            pair.server_send,
            frames_rx,
            events_tx,
        ));
        timeout(WAIT, writer).await.unwrap().unwrap();

        let done = completions(events_rx).await;
        assert_eq!(done.len(), 20);
        assert_eq!(distinct(&done), 20);
        assert!(done.iter().all(|(_, result)| result.is_err()));
    }

    #[tokio::test]
    async fn test_closing_sink_stops_reader() {
        let pair = loopback().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
        let (stop, stopped) = oneshot::channel();
        let sink = QuicChannelSink::new(frames_tx, stop);

        let reader = tokio::spawn(run_channel_reader(
            ChannelId(1),
            pair.server_recv,
            stopped,
            events_tx,
        ));

        match timeout(WAIT, events_rx.recv()).await.unwrap() {
            Some(TransportEvent::DataReceived { channel, data }) => {
                assert_eq!(channel, ChannelId(1));
                assert_eq!(data, b"hello\n".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }

        sink.close();
        timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(events_rx.recv().await.is_none());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ConnectionId(3).to_string(), "conn#3");
        assert_eq!(ChannelId(7).to_string(), "chan#7");
        assert_eq!(SendId(11).to_string(), "send#11");
    }

    #[test]
    fn test_id_allocator_is_monotonic() {
        let ids = IdAllocator::default();

        assert_eq!(ids.next_connection(), ConnectionId(1));
        assert_eq!(ids.next_connection(), ConnectionId(2));
        assert_eq!(ids.next_channel(), ChannelId(1));
        assert_eq!(ids.next_connection(), ConnectionId(3));
        assert_eq!(ids.next_channel(), ChannelId(2));
    }

    #[test]
    fn test_channel_sink_forwards_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, _stopped) = oneshot::channel();
        let sink = QuicChannelSink::new(tx, stop);

        let frame = OutboundFrame {
            send_id: SendId(1),
            payload: b"hello\n".to_vec(),
        };
        assert!(sink.submit(frame).is_ok());

        let received = rx.try_recv().unwrap();
        assert_eq!(received.send_id, SendId(1));
        assert_eq!(received.payload, b"hello\n".to_vec());
    }

    #[test]
    fn test_channel_sink_returns_frame_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, mut stopped) = oneshot::channel();
        let sink = QuicChannelSink::new(tx, stop);

        sink.close();
        sink.close();
        assert!(stopped.try_recv().is_ok());

        let frame = OutboundFrame {
            send_id: SendId(2),
            payload: b"late\n".to_vec(),
        };
        let rejected = sink.submit(frame).unwrap_err();
        assert_eq!(rejected.send_id, SendId(2));
        assert_eq!(rejected.payload, b"late\n".to_vec());

        // The writer side observes the close.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_returns_frame_when_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _stopped) = oneshot::channel();
        let sink = QuicChannelSink::new(tx, stop);
        drop(rx);

        let frame = OutboundFrame {
            send_id: SendId(3),
            payload: vec![1, 2, 3],
        };
        assert_eq!(sink.submit(frame).unwrap_err().payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_self_signed_identity() {
        let (certs, _key) = load_identity(&CertificateConfig::default()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_missing_pem_files() {
        let result = load_identity(&CertificateConfig::PemFiles {
            cert_path: PathBuf::from("/nonexistent/server.crt"),
            key_path: PathBuf::from("/nonexistent/server.key"),
        });

        assert!(matches!(result, Err(ServerError::Certificate(_))));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };

        let transport = Transport::bind(&config).unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        transport.shutdown().await;
    }
}
