//! Upstream WebSocket driver.
//!
//! Dials the erssi front-end, authenticates via the `password` URL
//! parameter, and turns decrypted frames into canonical events. Each parsed
//! event is an owned value moved into the outbound channel before the next
//! read, so consumers never observe a reused parse buffer.
//!
//! Certificate policy sits with the deployment (a reverse proxy or a pinned
//! self-signed cert); the driver itself accepts whatever certificate the
//! upstream presents.

use erssi_proto::crypto::FrameCipher;
use erssi_proto::Event;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL '{url}': {reason}")]
    BadUrl { url: String, reason: String },
    #[error("upstream handshake timed out after {HANDSHAKE_TIMEOUT:?}")]
    HandshakeTimeout,
    #[error("WebSocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("serialization: {0}")]
    Proto(#[from] erssi_proto::ProtoError),
}

/// Configuration for one upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `wss://host:port[/path]`, without the password parameter.
    pub url: String,
    /// Shared password; doubles as the frame-encryption secret.
    pub password: String,
}

// ---------------------------------------------------------------------------
// Dial
// ---------------------------------------------------------------------------

/// Build the dial URL with the password appended as a query parameter.
/// Percent-encoding is handled by the URL type, so passwords containing
/// `&` or `#` survive intact.
pub fn build_dial_url(base: &str, password: &str) -> Result<Url, UpstreamError> {
    let mut url = Url::parse(base).map_err(|e| UpstreamError::BadUrl {
        url: base.to_owned(),
        reason: e.to_string(),
    })?;
    url.query_pairs_mut().append_pair("password", password);
    Ok(url)
}

/// Connect and split into a send handle and a read loop.
///
/// The dial (TCP + TLS + WebSocket upgrade) is bounded by a 10-second
/// timeout. A successful upgrade means the upstream accepted the password.
pub async fn connect(
    config: &UpstreamConfig,
) -> Result<(UpstreamHandle, UpstreamReader), UpstreamError> {
    let url = build_dial_url(&config.url, &config.password)?;
    let connector = Connector::Rustls(Arc::new(permissive_tls_config()));

    let dial = tokio_tungstenite::connect_async_tls_with_config(
        url.as_str(),
        None,
        false,
        Some(connector),
    );
    let (ws, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, dial)
        .await
        .map_err(|_| UpstreamError::HandshakeTimeout)??;
    info!(url = %config.url, "upstream connected");

    let (sink, stream) = ws.split();
    let cipher = if config.password.is_empty() {
        None
    } else {
        Some(FrameCipher::new(&config.password))
    };
    Ok((
        UpstreamHandle {
            sink: Arc::new(Mutex::new(sink)),
        },
        UpstreamReader { stream, cipher },
    ))
}

// ---------------------------------------------------------------------------
// Send half
// ---------------------------------------------------------------------------

/// Cloneable sender for outgoing requests. A lock serializes writers so
/// frames from concurrent tasks never interleave.
#[derive(Clone)]
pub struct UpstreamHandle {
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl UpstreamHandle {
    /// Serialize a canonical event and send it as one text frame.
    pub async fn send(&self, event: &Event) -> Result<(), UpstreamError> {
        let json = event.to_json()?;
        debug!(kind = %event.kind, "upstream send");
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into())).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Read half
// ---------------------------------------------------------------------------

/// The inbound loop. Owns the stream and the frame cipher.
pub struct UpstreamReader {
    stream: SplitStream<WsStream>,
    cipher: Option<FrameCipher>,
}

impl UpstreamReader {
    #[cfg(test)]
    fn from_parts(stream: SplitStream<WsStream>, cipher: Option<FrameCipher>) -> Self {
        UpstreamReader { stream, cipher }
    }

    /// Read frames until the upstream closes or errors, pushing each parsed
    /// event into `events`. Returns when the connection is gone; dropping
    /// the sender is the disconnect signal for the consumer.
    pub async fn run(mut self, events: mpsc::Sender<Event>) {
        while let Some(frame) = self.stream.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t.to_string(),
                Ok(Message::Binary(data)) => match &self.cipher {
                    Some(cipher) => match cipher.open(&data) {
                        Ok(plain) => plain,
                        Err(e) => {
                            warn!(error = %e, len = data.len(), "dropping undecryptable frame");
                            continue;
                        }
                    },
                    None => {
                        warn!(len = data.len(), "binary frame without a configured key, dropping");
                        continue;
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => {
                    info!("upstream sent close");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "upstream read error");
                    break;
                }
            };

            let event = match Event::from_json(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable upstream message");
                    continue;
                }
            };
            // Each event is a distinct owned value; ordering is preserved by
            // the channel.
            if events.send(event).await.is_err() {
                debug!("event consumer gone, stopping upstream reader");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// A rustls client config that accepts any server certificate.
fn permissive_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
