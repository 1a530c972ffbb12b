//! Bridge orchestrator.
//!
//! Owns the store and the two protocol edges, and implements the event
//! policies: when to request upstream state, when to announce buffers, and
//! how downstream commands map onto the model. Upstream requests go out
//! through an mpsc queue; a pump task owns the actual socket writes.

use crate::relay::{ClientRequest, ClientSet, ParsedCommand, RelayClient};
use crate::store::{BufferMeta, Store};
use erssi_proto::dump::StateDump;
use erssi_proto::{Event, EventKind};
use relay_codec::{Message, Object};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event ID relay clients dispatch buffer announcements on.
pub const EVENT_BUFFER_OPENED: &str = "_buffer_opened";

/// Lifecycle of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unconnected,
    Connected,
    StateRequested,
    Syncing,
    Disconnected,
}

pub struct Bridge {
    store: Arc<Store>,
    upstream_tx: mpsc::Sender<Event>,
    clients: ClientSet,
    /// One-shot guard: the upstream disconnects clients that repeat
    /// `sync_server`, so the request goes out exactly once per process.
    sync_requested: AtomicBool,
    link: Mutex<LinkState>,
    /// Servers whose state dump is still in flight. A tag leaves the set on
    /// its first event that is neither `state_dump` nor `channel_join`.
    dump_servers: Mutex<HashSet<String>>,
}

impl Bridge {
    pub fn new(store: Arc<Store>, upstream_tx: mpsc::Sender<Event>, clients: ClientSet) -> Arc<Bridge> {
        Arc::new(Bridge {
            store,
            upstream_tx,
            clients,
            sync_requested: AtomicBool::new(false),
            link: Mutex::new(LinkState::Unconnected),
            dump_servers: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.lock().expect("link lock")
    }

    pub fn set_link_state(&self, state: LinkState) {
        *self.link.lock().expect("link lock") = state;
    }

    // -----------------------------------------------------------------------
    // Upstream side
    // -----------------------------------------------------------------------

    pub async fn handle_upstream_event(&self, event: Event) {
        match &event.kind {
            EventKind::StateDump => self.handle_state_dump(&event).await,
            EventKind::SyncServer => {
                debug!("ignoring echoed sync_server");
            }
            _ => self.handle_translated_event(&event).await,
        }
    }

    pub fn on_upstream_disconnected(&self) {
        self.set_link_state(LinkState::Disconnected);
        warn!("upstream disconnected");
    }

    async fn handle_state_dump(&self, event: &Event) {
        let dump = match StateDump::from_event(event) {
            Ok(dump) => dump,
            Err(e) => {
                warn!(error = %e, "malformed state dump, dropping");
                return;
            }
        };
        self.set_link_state(LinkState::Syncing);
        {
            let mut dumping = self.dump_servers.lock().expect("dump lock");
            if let Some(tag) = &event.server_tag {
                dumping.insert(tag.clone());
            }
            for server in &dump.servers {
                dumping.insert(server.tag.clone());
            }
        }
        let outcome = self.store.ingest_state_dump(&dump).await;
        // No announcements: buffers from the dump reach clients through
        // their gui_buffers fetch.
        info!(buffers = outcome.created.len(), "state dump ingested");
    }

    async fn handle_translated_event(&self, event: &Event) {
        let under_dump = self.update_dump_tracking(event);
        let outcome = self.store.translate_event(event, under_dump).await;

        if let Some((server_tag, target)) = &outcome.nicklist_wanted {
            self.request_nicklist(server_tag, target).await;
        }

        if under_dump {
            return;
        }
        // Announce created buffers and title changes, once per buffer.
        let mut announced: HashSet<String> = HashSet::new();
        for meta in &outcome.created {
            if announced.insert(meta.pointer.clone()) {
                self.announce_buffer(meta).await;
            }
        }
        if let Some(meta) = &outcome.title_changed {
            if announced.insert(meta.pointer.clone()) {
                self.announce_buffer(meta).await;
            }
        }
    }

    /// Track the implicit end of a state dump. Returns whether the event's
    /// server is still under dump (so joins are declarations only).
    fn update_dump_tracking(&self, event: &Event) -> bool {
        let Some(tag) = event.server_tag.as_deref() else {
            return false;
        };
        let mut dumping = self.dump_servers.lock().expect("dump lock");
        if !dumping.contains(tag) {
            return false;
        }
        if event.kind == EventKind::ChannelJoin {
            return true;
        }
        // First ordinary event from this server: the dump is over.
        dumping.remove(tag);
        debug!(server = tag, "state dump ended");
        false
    }

    async fn announce_buffer(&self, meta: &BufferMeta) {
        let hda = Store::buffer_opened_hdata(meta);
        let msg = Message::new(EVENT_BUFFER_OPENED, vec![Object::Hdata(hda)]);
        self.clients.broadcast(&msg).await;
    }

    async fn request_nicklist(&self, server_tag: &str, target: &str) {
        let request = Event::nicklist_request(server_tag, target);
        if self.upstream_tx.send(request).await.is_err() {
            warn!("upstream writer gone, dropping nicklist request");
        }
    }

    // -----------------------------------------------------------------------
    // Downstream side
    // -----------------------------------------------------------------------

    pub async fn handle_client_request(&self, request: ClientRequest) {
        match request {
            ClientRequest::Init { .. } => self.on_client_init().await,
            ClientRequest::Command { client, command } => {
                self.dispatch_command(&client, command).await;
            }
        }
    }

    /// The first `init` ever triggers the single state request. Buffers are
    /// not pushed here; clients ask via `hdata buffer:gui_buffers(*)`.
    async fn on_client_init(&self) {
        if self.sync_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_link_state(LinkState::StateRequested);
        info!("first relay init, requesting upstream state");
        if self.upstream_tx.send(Event::state_dump_request()).await.is_err() {
            warn!("upstream writer gone, state request dropped");
        }
    }

    async fn dispatch_command(&self, client: &Arc<RelayClient>, command: ParsedCommand) {
        match command.name.as_str() {
            "hdata" => self.command_hdata(client, &command).await,
            "input" => self.command_input(&command).await,
            "nicklist" => self.command_nicklist(&command).await,
            "sync" | "desync" => {
                // Updates are pushed unconditionally; nothing to track.
                debug!(command = %command.name, "sync state acknowledged");
            }
            other => {
                warn!(command = other, "unknown relay command, ignoring");
            }
        }
    }

    async fn command_hdata(&self, client: &Arc<RelayClient>, command: &ParsedCommand) {
        let path = command.args.split_whitespace().next().unwrap_or_default();
        let hda = if path.contains("gui_buffers") {
            Some(self.store.gui_buffers_hdata().await)
        } else if path.contains("gui_hotlist") {
            Some(Store::hotlist_hdata())
        } else if path.contains("/lines/last_line(") {
            match (extract_pointer(path), extract_count(path)) {
                (Some(pointer), Some(count)) => {
                    let lines = self.store.last_lines_hdata(pointer, count).await;
                    if lines.is_none() {
                        warn!(pointer, "last_line request for unknown buffer");
                    }
                    lines
                }
                _ => {
                    warn!(path, "malformed lines request");
                    None
                }
            }
        } else {
            warn!(path, "unknown hdata path");
            None
        };
        if let Some(hda) = hda {
            let msg = Message::new(&command.id, vec![Object::Hdata(hda)]);
            if let Err(e) = client.send(&msg).await {
                debug!(error = %e, "reply write failed");
            }
        }
    }

    async fn command_input(&self, command: &ParsedCommand) {
        let Some((pointer, text)) = command.args.split_once(char::is_whitespace) else {
            warn!(args = %command.args, "input needs a buffer and text");
            return;
        };
        let Some(meta) = self.store.lookup_by_pointer(pointer).await else {
            warn!(pointer, "input for unknown buffer pointer");
            return;
        };
        let event = Event::message_to(&meta.server_tag, &meta.short_name, text.trim_start());
        if self.upstream_tx.send(event).await.is_err() {
            warn!("upstream writer gone, input dropped");
        }
    }

    async fn command_nicklist(&self, command: &ParsedCommand) {
        let pointer = command.args.split_whitespace().next().unwrap_or_default();
        let Some(meta) = self.store.lookup_by_pointer(pointer).await else {
            warn!(pointer, "nicklist for unknown buffer pointer");
            return;
        };
        self.request_nicklist(&meta.server_tag, &meta.short_name).await;
    }
}

// ---------------------------------------------------------------------------
// hdata path helpers
// ---------------------------------------------------------------------------

/// Pull the embedded `0x...` pointer out of an hdata path.
fn extract_pointer(path: &str) -> Option<&str> {
    let start = path.find("0x")?;
    let hex = &path[start..];
    let end = hex[2..]
        .find(|c: char| !c.is_ascii_hexdigit())
        .map_or(hex.len(), |i| i + 2);
    if end <= 2 {
        return None;
    }
    Some(&hex[..end])
}

/// Pull the signed line count out of `.../last_line(-100)`.
fn extract_count(path: &str) -> Option<i64> {
    let start = path.find("last_line(")? + "last_line(".len();
    let rest = &path[start..];
    let end = rest.find(')')?;
    rest[..end].parse().ok()
}
