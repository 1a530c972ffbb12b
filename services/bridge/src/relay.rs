//! Downstream relay server.
//!
//! Accepts TCP relay clients and parses newline-delimited commands of the
//! form `[(id)] command args...`. `handshake`, `init`, and `quit` are
//! handled in place; everything else from an authenticated client is
//! forwarded to the bridge. Replies and broadcasts are typed-object
//! messages framed by `relay-codec`.

use relay_codec::{Hashtable, Message, Object};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

/// One parsed relay command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Correlation id from the optional `(id)` prefix; empty when absent.
    pub id: String,
    pub name: String,
    /// Remainder of the line, untokenized; commands split it as they need.
    pub args: String,
}

/// Parse `[(id)] command arg1 arg2 ...`. The id runs to the first `)` and
/// may contain spaces. Returns `None` for blank lines.
pub fn parse_command_line(line: &str) -> Option<ParsedCommand> {
    let mut rest = line.trim();
    if rest.is_empty() {
        return None;
    }
    let mut id = String::new();
    if let Some(after) = rest.strip_prefix('(') {
        let close = after.find(')')?;
        id = after[..close].to_owned();
        rest = after[close + 1..].trim_start();
    }
    if rest.is_empty() {
        return None;
    }
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name.to_owned(), args.trim_start().to_owned()),
        None => (rest.to_owned(), String::new()),
    };
    Some(ParsedCommand { id, name, args })
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// One connected relay client.
///
/// The write half sits behind a lock so replies and broadcasts from
/// different tasks never interleave bytes on the wire.
pub struct RelayClient {
    id: u64,
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    authenticated: AtomicBool,
    nonce: StdMutex<Option<String>>,
}

impl RelayClient {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Encode and write one message. The whole frame goes out in a single
    /// write.
    pub async fn send(&self, msg: &Message) -> std::io::Result<()> {
        let frame = msg.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await
    }
}

/// Shared registry of connected clients; the broadcast surface handed to
/// the bridge.
#[derive(Clone, Default)]
pub struct ClientSet {
    inner: Arc<RwLock<HashMap<u64, Arc<RelayClient>>>>,
}

impl ClientSet {
    /// Write a message to every authenticated client. Clients whose socket
    /// fails are dropped from the set.
    pub async fn broadcast(&self, msg: &Message) {
        let clients: Vec<Arc<RelayClient>> = {
            let set = self.inner.read().await;
            set.values().cloned().collect()
        };
        let mut dead = Vec::new();
        for client in clients {
            if !client.is_authenticated() {
                continue;
            }
            if client.send(msg).await.is_err() {
                dead.push(client.id);
            }
        }
        if !dead.is_empty() {
            let mut set = self.inner.write().await;
            for id in dead {
                if set.remove(&id).is_some() {
                    debug!(client = id, "removed dead client during broadcast");
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    async fn insert(&self, client: Arc<RelayClient>) {
        self.inner.write().await.insert(client.id, client);
    }

    async fn remove(&self, id: u64) {
        self.inner.write().await.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Requests surfaced to the bridge
// ---------------------------------------------------------------------------

/// What the server hands to the bridge once a client is past `init`.
pub enum ClientRequest {
    /// A client completed `init`.
    Init { client: Arc<RelayClient> },
    /// An authenticated command to dispatch.
    Command {
        client: Arc<RelayClient>,
        command: ParsedCommand,
    },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct RelayServer {
    listener: TcpListener,
    clients: ClientSet,
    requests: mpsc::Sender<ClientRequest>,
    next_id: AtomicU64,
}

impl RelayServer {
    pub async fn bind(
        addr: &str,
        requests: mpsc::Sender<ClientRequest>,
    ) -> std::io::Result<RelayServer> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "relay server bound");
        Ok(RelayServer {
            listener,
            clients: ClientSet::default(),
            requests,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The broadcast handle, cloneable and independent of the accept loop.
    pub fn clients(&self) -> ClientSet {
        self.clients.clone()
    }

    /// Accept loop; runs until the listener fails.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (read_half, write_half) = stream.into_split();
                    let client = Arc::new(RelayClient {
                        id,
                        peer,
                        writer: Mutex::new(write_half),
                        authenticated: AtomicBool::new(false),
                        nonce: StdMutex::new(None),
                    });
                    info!(client = id, %peer, "relay client connected");
                    self.clients.insert(client.clone()).await;
                    tokio::spawn(serve_client(
                        client,
                        read_half,
                        self.clients.clone(),
                        self.requests.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "relay accept failed, stopping");
                    break;
                }
            }
        }
    }
}

/// Drive one client until EOF, read error, or `quit`.
async fn serve_client(
    client: Arc<RelayClient>,
    read_half: OwnedReadHalf,
    clients: ClientSet,
    requests: mpsc::Sender<ClientRequest>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(client = client.id, error = %e, "client read error");
                break;
            }
        };
        let Some(command) = parse_command_line(&line) else {
            continue;
        };
        match command.name.as_str() {
            "handshake" => {
                let reply = handshake_reply(&client, &command.id);
                if client.send(&reply).await.is_err() {
                    break;
                }
            }
            "init" => {
                // Password verification is a collaborator concern; any init
                // authenticates.
                client.authenticated.store(true, Ordering::Release);
                info!(client = client.id, "relay client authenticated");
                if requests
                    .send(ClientRequest::Init {
                        client: client.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            "quit" => {
                debug!(client = client.id, "client quit");
                break;
            }
            _ if !client.is_authenticated() => {
                warn!(client = client.id, command = %command.name, "command before init, ignoring");
            }
            _ => {
                if requests
                    .send(ClientRequest::Command {
                        client: client.clone(),
                        command,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    clients.remove(client.id).await;
    info!(client = client.id, "relay client disconnected");
}

/// The fixed handshake response. The nonce is a fresh 16-byte random hex
/// string remembered on the client for the (out-of-scope) password check.
fn handshake_reply(client: &RelayClient, id: &str) -> Message {
    let nonce_bytes: [u8; 16] = rand::random();
    let nonce = hex::encode(nonce_bytes);
    *client.nonce.lock().expect("nonce lock") = Some(nonce.clone());
    let htb = Hashtable::of_strings(&[
        ("password_hash_algo", "plain"),
        ("password_hash_iterations", "100000"),
        ("totp", "off"),
        ("nonce", &nonce),
        ("compression", "off"),
        ("escape_commands", "off"),
    ]);
    Message::new(id, vec![Object::Hashtable(htb)])
}
