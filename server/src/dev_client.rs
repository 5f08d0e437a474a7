//! Minimal QUIC client for development and end-to-end tests.
//!
//! Certificate verification is skipped so it can talk to a server with a
//! self-signed certificate. Never point it at anything you do not control.

use log::debug;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use shared::{ClientMessage, FrameBuffer, FrameError, ProtocolError, ServerFrame, ALPN_PROTOCOL};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub(crate) fn client_config() -> Result<ClientConfig, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Connect(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut config = ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).map_err(|e| ClientError::Connect(e.to_string()))?,
    ));

    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(VarInt::from_u32(30_000).into()));
    transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
    config.transport_config(Arc::new(transport_config));

    Ok(config)
}

/// One connection with its default bidirectional channel.
pub struct DevClient {
    endpoint: Endpoint,
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
    frames: FrameBuffer,
    received: VecDeque<ServerFrame>,
    finished: bool,
}

impl DevClient {
    pub async fn connect(server_addr: SocketAddr, server_name: &str) -> Result<Self, ClientError> {
        let bind_addr: SocketAddr = if server_addr.is_ipv6() {
            "[::]:0".parse().map_err(|_| ClientError::Connect("bad bind address".into()))?
        } else {
            "0.0.0.0:0".parse().map_err(|_| ClientError::Connect("bad bind address".into()))?
        };

        let mut endpoint = Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(client_config()?);

        let connection = endpoint
            .connect(server_addr, server_name)
            .map_err(|e| ClientError::Connect(e.to_string()))?
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        debug!("Connected to {}", connection.remote_address());

        // The server only sees the stream once something is written on it.
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| ClientError::Stream(e.to_string()))?;

        Ok(Self {
            endpoint,
            connection,
            send,
            recv,
            frames: FrameBuffer::new(),
            received: VecDeque::new(),
            finished: false,
        })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let bytes = message.encode()?;
        self.send_raw(&bytes).await
    }

    /// Writes bytes as-is, framing included.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.send
            .write_all(bytes)
            .await
            .map_err(|e| ClientError::Stream(e.to_string()))
    }

    /// Next message from the server, or `None` once the server finished the
    /// stream or the deadline passed.
    pub async fn next_frame(&mut self, wait: Duration) -> Result<Option<ServerFrame>, ClientError> {
        let deadline = Instant::now() + wait;
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if let Some(frame) = self.received.pop_front() {
                return Ok(Some(frame));
            }
            if self.finished {
                return Ok(None);
            }

            let read = match timeout_at(deadline, self.recv.read(&mut buffer)).await {
                Ok(read) => read,
                Err(_elapsed) => return Ok(None),
            };

            match read {
                Ok(Some(len)) => {
                    for message in self.frames.push(&buffer[..len]) {
                        self.received.push_back(ServerFrame::decode(&message?)?);
                    }
                }
                Ok(None) => self.finished = true,
                Err(e) => return Err(ClientError::Stream(e.to_string())),
            }
        }
    }

    /// Skips messages until one matches, or the deadline passes.
    pub async fn wait_for<F>(
        &mut self,
        wait: Duration,
        mut matches: F,
    ) -> Result<Option<ServerFrame>, ClientError>
    where
        F: FnMut(&ServerFrame) -> bool,
    {
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_frame(remaining).await? {
                Some(frame) if matches(&frame) => return Ok(Some(frame)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Closes the connection and waits for the close to reach the server.
    pub async fn close(self) {
        self.connection.close(VarInt::from_u32(0), b"client closing");
        self.endpoint.wait_idle().await;
    }
}
