//! erssi-bridge: a protocol bridge between the WeeChat relay protocol and
//! the erssi JSON-over-WebSocket front-end.
//!
//! Relay clients connect over plain TCP (TLS belongs to a reverse proxy);
//! the bridge maintains the buffer/line/nick model and translates events in
//! both directions over a single upstream WebSocket.

pub mod bridge;
pub mod config;
pub mod relay;
pub mod store;
pub mod upstream;

use bridge::{Bridge, LinkState};
use config::Config;
use relay::RelayServer;
use store::Store;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("upstream: {0}")]
    Upstream(#[from] upstream::UpstreamError),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("upstream connection lost")]
    UpstreamLost,
}

/// Connect upstream, bind downstream, and run until either side dies.
///
/// No reconnection: an upstream loss unwinds everything and the process
/// exits non-zero, leaving restart policy to the supervisor.
pub async fn run(config: Config) -> Result<(), RunError> {
    let store = std::sync::Arc::new(Store::new());

    let upstream_config = upstream::UpstreamConfig {
        url: config.upstream_url.clone(),
        password: config.password.clone(),
    };
    let (handle, reader) = upstream::connect(&upstream_config).await?;

    // Inbound upstream events; the reader task owns the socket read half.
    let (event_tx, mut event_rx) = mpsc::channel(256);
    tokio::spawn(reader.run(event_tx));

    // Outbound upstream requests; one pump task owns the write half.
    let (request_tx, mut request_rx) = mpsc::channel::<erssi_proto::Event>(256);
    tokio::spawn(async move {
        while let Some(event) = request_rx.recv().await {
            if let Err(e) = handle.send(&event).await {
                warn!(error = %e, "upstream send failed, dropping request");
            }
        }
    });

    // Downstream relay server.
    let (client_tx, mut client_rx) = mpsc::channel(256);
    let server = RelayServer::bind(&config.listen_addr, client_tx)
        .await
        .map_err(|source| RunError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;
    let clients = server.clients();
    tokio::spawn(server.run());

    let bridge = Bridge::new(store, request_tx, clients);
    bridge.set_link_state(LinkState::Connected);
    info!(listen = %config.listen_addr, upstream = %config.upstream_url, "bridge running");

    // Single dispatch loop: upstream events stay ordered because this is
    // their only consumer; client requests interleave freely.
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => bridge.handle_upstream_event(event).await,
                None => {
                    bridge.on_upstream_disconnected();
                    return Err(RunError::UpstreamLost);
                }
            },
            request = client_rx.recv() => match request {
                Some(request) => bridge.handle_client_request(request).await,
                None => {
                    warn!("relay server stopped");
                    return Ok(());
                }
            },
        }
    }
}
