//! Canonical buffer/line/nick model and the translation rules that keep it
//! consistent as events arrive from either side of the bridge.
//!
//! The store is the only shared mutable state in the process. One
//! reader/writer lock guards it; every operation below is atomic under that
//! lock and does no I/O. Callers act on the returned [`EventOutcome`]
//! (broadcast announcements, issue nick-list requests) outside the lock.

use erssi_proto::dump::StateDump;
use erssi_proto::{Event, EventKind, NickEntry};
use relay_codec::{Hashtable, Hdata, HdataItem, Object};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Scrollback retained per buffer; oldest lines drop past this.
pub const LINE_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// Pointers
// ---------------------------------------------------------------------------

/// Process-wide pointer sequence. Pointers are identity tokens, not
/// addresses: unique for the process lifetime, rendered as `0x` + hex.
static POINTER_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_pointer() -> String {
    format!("0x{:x}", POINTER_SEQ.fetch_add(1, Ordering::Relaxed))
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Server,
    Channel,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nick {
    pub name: String,
    pub prefix: String,
    pub prefix_color: String,
    pub visible: bool,
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub pointer: String,
    /// Pointer of the owning buffer.
    pub buffer: String,
    pub date: i64,
    pub date_printed: i64,
    pub displayed: bool,
    pub highlight: bool,
    pub tags: String,
    pub prefix: String,
    pub message: String,
}

#[derive(Debug)]
struct Buffer {
    pointer: String,
    number: i32,
    server_tag: String,
    name: String,
    short_name: String,
    title: String,
    kind: BufferKind,
    lines: VecDeque<Line>,
    nicks: Vec<Nick>,
}

/// A cheap snapshot of a buffer's identity, handed out to callers that
/// need to announce or route without holding the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferMeta {
    pub pointer: String,
    pub number: i32,
    pub server_tag: String,
    pub name: String,
    pub short_name: String,
    pub title: String,
    pub kind: BufferKind,
}

impl Buffer {
    fn meta(&self) -> BufferMeta {
        BufferMeta {
            pointer: self.pointer.clone(),
            number: self.number,
            server_tag: self.server_tag.clone(),
            name: self.name.clone(),
            short_name: self.short_name.clone(),
            title: self.title.clone(),
            kind: self.kind,
        }
    }
}

/// What a translated event did, so the orchestrator can follow up outside
/// the store lock.
#[derive(Debug, Default)]
pub struct EventOutcome {
    /// Buffers created while handling the event, in creation order.
    pub created: Vec<BufferMeta>,
    /// Buffer whose title changed (topic events).
    pub title_changed: Option<BufferMeta>,
    /// `(server_tag, target)` to request a nick list for.
    pub nicklist_wanted: Option<(String, String)>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Buffer key inside a server namespace: the short name, lowercased, so
/// `#Chan` and `#chan` land in the same buffer.
fn buffer_key(server_tag: &str, short_name: &str) -> (String, String) {
    (server_tag.to_owned(), short_name.to_lowercase())
}

struct Inner {
    /// Creation order; buffer numbers are `index + 1`.
    buffers: Vec<Buffer>,
    by_key: HashMap<(String, String), usize>,
    core_created: bool,
}

pub struct Store {
    inner: RwLock<Inner>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    pub fn new() -> Store {
        Store {
            inner: RwLock::new(Inner {
                buffers: Vec::new(),
                by_key: HashMap::new(),
                core_created: false,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Buffer creation
    // -----------------------------------------------------------------------

    /// Look up or create the buffer for `(server_tag, short_name)`.
    /// Returns the buffer identity and whether it was created.
    pub async fn ensure_buffer(
        &self,
        server_tag: &str,
        short_name: &str,
        kind: BufferKind,
        title: Option<&str>,
    ) -> (BufferMeta, bool) {
        let mut inner = self.inner.write().await;
        inner.ensure_buffer(server_tag, short_name, kind, title)
    }

    /// The server buffer uses the tag itself as both key and name.
    pub async fn ensure_server_buffer(&self, server_tag: &str) -> (BufferMeta, bool) {
        let mut inner = self.inner.write().await;
        inner.ensure_server_buffer(server_tag)
    }

    /// Resolve a buffer by its opaque pointer.
    pub async fn lookup_by_pointer(&self, pointer: &str) -> Option<BufferMeta> {
        let inner = self.inner.read().await;
        inner
            .buffers
            .iter()
            .find(|b| b.pointer == pointer)
            .map(Buffer::meta)
    }

    /// Resolve a buffer by its key, without creating it.
    pub async fn lookup_by_name(&self, server_tag: &str, short_name: &str) -> Option<BufferMeta> {
        let inner = self.inner.read().await;
        let idx = *inner.by_key.get(&buffer_key(server_tag, short_name))?;
        Some(inner.buffers[idx].meta())
    }

    // -----------------------------------------------------------------------
    // Event translation
    // -----------------------------------------------------------------------

    /// Apply one upstream event to the model.
    ///
    /// The core buffer is ensured before anything else, so it holds number
    /// 1 even when live events beat the first state dump. `declarations_only`
    /// is set while a state dump is in flight: joins then create buffers
    /// without synthesizing join lines.
    pub async fn translate_event(&self, event: &Event, declarations_only: bool) -> EventOutcome {
        let mut inner = self.inner.write().await;
        let mut outcome = EventOutcome::default();
        inner.ensure_core_buffer(&mut outcome);
        let translated = match &event.kind {
            EventKind::Message => inner.apply_message(event),
            EventKind::ChannelJoin => inner.apply_join(event, declarations_only),
            EventKind::ChannelPart => inner.apply_part(event),
            EventKind::UserQuit => inner.apply_quit(event),
            EventKind::Topic => inner.apply_topic(event),
            EventKind::Nicklist => inner.apply_nicklist(event),
            kind => {
                debug!(kind = %kind, "event kind has no translation, skipping");
                EventOutcome::default()
            }
        };
        outcome.created.extend(translated.created);
        outcome.title_changed = translated.title_changed;
        outcome.nicklist_wanted = translated.nicklist_wanted;
        outcome
    }

    /// Ingest a full state dump: core buffer first, then each server's
    /// channels and queries in declared order. Server buffers are not part
    /// of the dump; they appear lazily when an event actually targets the
    /// server. Idempotent on identity; a second ingestion only refreshes
    /// titles.
    pub async fn ingest_state_dump(&self, dump: &StateDump) -> EventOutcome {
        let mut inner = self.inner.write().await;
        let mut outcome = EventOutcome::default();
        inner.ensure_core_buffer(&mut outcome);
        for server in &dump.servers {
            for channel in &server.channels {
                let title = channel.topic.as_deref().filter(|t| !t.is_empty());
                let (meta, created) =
                    inner.ensure_buffer(&server.tag, &channel.name, BufferKind::Channel, title);
                if created {
                    outcome.created.push(meta);
                }
            }
            for query in &server.queries {
                let (meta, created) =
                    inner.ensure_buffer(&server.tag, &query.nick, BufferKind::Private, None);
                if created {
                    outcome.created.push(meta);
                }
            }
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Downstream views
    // -----------------------------------------------------------------------

    /// All buffers as the `gui_buffers` hdata, in creation (number) order.
    pub async fn gui_buffers_hdata(&self) -> Hdata {
        let inner = self.inner.read().await;
        let mut hda = buffer_hdata();
        for buffer in &inner.buffers {
            hda.items.push(buffer_item(&buffer.meta()));
        }
        hda
    }

    /// A single-buffer hdata, used for `_buffer_opened` announcements.
    pub fn buffer_opened_hdata(meta: &BufferMeta) -> Hdata {
        let mut hda = buffer_hdata();
        hda.items.push(buffer_item(meta));
        hda
    }

    /// The hotlist stub: correct schema, zero items.
    pub fn hotlist_hdata() -> Hdata {
        Hdata::new(
            "hotlist",
            Hdata::parse_keys("priority:int,date:tim,date_printed:tim,buffer:ptr,count:int")
                .expect("static key declaration"),
        )
    }

    /// The last `min(|count|, len)` lines of a buffer, oldest first.
    /// `None` when the pointer resolves to no buffer.
    pub async fn last_lines_hdata(&self, pointer: &str, count: i64) -> Option<Hdata> {
        let inner = self.inner.read().await;
        let buffer = inner.buffers.iter().find(|b| b.pointer == pointer)?;
        let take = (count.unsigned_abs() as usize).min(buffer.lines.len());
        let mut hda = Hdata::new(
            "line_data",
            Hdata::parse_keys(
                "buffer:ptr,date:tim,date_printed:tim,displayed:int,highlight:int,tags_array:str,prefix:str,message:str",
            )
            .expect("static key declaration"),
        );
        for line in buffer.lines.iter().skip(buffer.lines.len() - take) {
            hda.items.push(HdataItem {
                pointers: vec![line.pointer.clone()],
                values: vec![
                    Object::Ptr(line.buffer.clone()),
                    Object::Time(line.date),
                    Object::Time(line.date_printed),
                    Object::Int(i32::from(line.displayed)),
                    Object::Int(i32::from(line.highlight)),
                    Object::str(line.tags.clone()),
                    Object::str(line.prefix.clone()),
                    Object::str(line.message.clone()),
                ],
            });
        }
        Some(hda)
    }

    /// Test/diagnostic access: line count of one buffer.
    pub async fn line_count(&self, pointer: &str) -> Option<usize> {
        let inner = self.inner.read().await;
        inner
            .buffers
            .iter()
            .find(|b| b.pointer == pointer)
            .map(|b| b.lines.len())
    }

    /// Test/diagnostic access: nick snapshot of one buffer.
    pub async fn nicks(&self, pointer: &str) -> Option<Vec<Nick>> {
        let inner = self.inner.read().await;
        inner
            .buffers
            .iter()
            .find(|b| b.pointer == pointer)
            .map(|b| b.nicks.clone())
    }
}

impl Inner {
    fn ensure_core_buffer(&mut self, outcome: &mut EventOutcome) {
        if self.core_created {
            return;
        }
        let (meta, created) = self.insert_or_update(
            "core",
            "weechat",
            "core.weechat",
            BufferKind::Server,
            Some("WeeChat core buffer"),
        );
        self.core_created = true;
        if created {
            outcome.created.push(meta);
        }
    }

    fn ensure_server_buffer(&mut self, server_tag: &str) -> (BufferMeta, bool) {
        let title = format!("Server {server_tag}");
        self.insert_or_update(
            server_tag,
            server_tag,
            server_tag,
            BufferKind::Server,
            Some(&title),
        )
    }

    fn ensure_buffer(
        &mut self,
        server_tag: &str,
        short_name: &str,
        kind: BufferKind,
        title: Option<&str>,
    ) -> (BufferMeta, bool) {
        let name = format!("{server_tag}.{short_name}");
        self.insert_or_update(server_tag, short_name, &name, kind, title)
    }

    fn insert_or_update(
        &mut self,
        server_tag: &str,
        short_name: &str,
        name: &str,
        kind: BufferKind,
        title: Option<&str>,
    ) -> (BufferMeta, bool) {
        let key = buffer_key(server_tag, short_name);
        if let Some(&idx) = self.by_key.get(&key) {
            let buffer = &mut self.buffers[idx];
            if let Some(title) = title {
                buffer.title = title.to_owned();
            }
            return (buffer.meta(), false);
        }
        let number = self.buffers.len() as i32 + 1;
        let title = title.map(str::to_owned).unwrap_or_else(|| match kind {
            BufferKind::Private => format!("Conversation with {short_name}"),
            _ => String::new(),
        });
        let buffer = Buffer {
            pointer: next_pointer(),
            number,
            server_tag: server_tag.to_owned(),
            name: name.to_owned(),
            short_name: short_name.to_owned(),
            title,
            kind,
            lines: VecDeque::new(),
            nicks: Vec::new(),
        };
        let meta = buffer.meta();
        self.by_key.insert(key, self.buffers.len());
        self.buffers.push(buffer);
        (meta, true)
    }

    /// Find the buffer an event addresses, creating it lazily. Events with
    /// no target land in the server buffer.
    fn target_buffer(&mut self, event: &Event, kind: BufferKind) -> (BufferMeta, bool) {
        let tag = event.server_tag.clone().unwrap_or_default();
        match event.target.as_deref().filter(|t| !t.is_empty()) {
            Some(target) => self.ensure_buffer(&tag, target, kind, None),
            None => self.ensure_server_buffer(&tag),
        }
    }

    fn push_line(&mut self, meta: &BufferMeta, line: Line) {
        let idx = self
            .by_key
            .get(&buffer_key(&meta.server_tag, &meta.short_name))
            .copied();
        let Some(idx) = idx else {
            warn!(buffer = %meta.name, "line for a buffer that vanished, dropping");
            return;
        };
        let buffer = &mut self.buffers[idx];
        if buffer.lines.len() >= LINE_CAPACITY {
            buffer.lines.pop_front();
        }
        buffer.lines.push_back(line);
    }

    fn new_line(meta: &BufferMeta, event: &Event, prefix: &str, message: String, tags: String) -> Line {
        Line {
            pointer: next_pointer(),
            buffer: meta.pointer.clone(),
            date: event.timestamp.unwrap_or_else(now_epoch),
            date_printed: now_epoch(),
            displayed: true,
            highlight: event.is_highlight,
            tags,
            prefix: prefix.to_owned(),
            message,
        }
    }

    fn apply_message(&mut self, event: &Event) -> EventOutcome {
        let kind = if event
            .target
            .as_deref()
            .is_some_and(|t| t.starts_with('#') || t.starts_with('&'))
        {
            BufferKind::Channel
        } else {
            BufferKind::Private
        };
        let (meta, created) = self.target_buffer(event, kind);
        let nick = event.nick.as_deref().unwrap_or_default();
        let mut tags = vec!["notify_message".to_owned()];
        if event.is_highlight {
            tags.push("notify_highlight".to_owned());
        }
        if !nick.is_empty() {
            tags.push(format!("nick_{nick}"));
        }
        let line = Self::new_line(
            &meta,
            event,
            nick,
            event.text.clone().unwrap_or_default(),
            tags.join(","),
        );
        self.push_line(&meta, line);
        EventOutcome {
            created: if created { vec![meta] } else { Vec::new() },
            ..EventOutcome::default()
        }
    }

    fn apply_join(&mut self, event: &Event, declaration_only: bool) -> EventOutcome {
        let (meta, created) = self.target_buffer(event, BufferKind::Channel);
        let mut outcome = EventOutcome::default();
        if !declaration_only {
            let nick = event.nick.as_deref().unwrap_or_default();
            let target = event.target.as_deref().unwrap_or_default();
            let line = Self::new_line(
                &meta,
                event,
                "--",
                format!("{nick} has joined {target}"),
                String::new(),
            );
            self.push_line(&meta, line);
        }
        outcome.nicklist_wanted = Some((meta.server_tag.clone(), meta.short_name.clone()));
        if created {
            outcome.created.push(meta);
        }
        outcome
    }

    fn apply_part(&mut self, event: &Event) -> EventOutcome {
        let (meta, created) = self.target_buffer(event, BufferKind::Channel);
        let nick = event.nick.as_deref().unwrap_or_default();
        let target = event.target.as_deref().unwrap_or_default();
        let mut message = format!("{nick} has left {target}");
        if let Some(reason) = event.text.as_deref().filter(|t| !t.is_empty()) {
            message.push_str(&format!(" ({reason})"));
        }
        let line = Self::new_line(&meta, event, "--", message, String::new());
        self.push_line(&meta, line);
        let mut outcome = EventOutcome::default();
        outcome.nicklist_wanted = Some((meta.server_tag.clone(), meta.short_name.clone()));
        if created {
            outcome.created.push(meta);
        }
        outcome
    }

    fn apply_quit(&mut self, event: &Event) -> EventOutcome {
        let (meta, created) = self.target_buffer(event, BufferKind::Channel);
        let nick = event.nick.as_deref().unwrap_or_default();
        let mut message = format!("{nick} has quit");
        if let Some(reason) = event.text.as_deref().filter(|t| !t.is_empty()) {
            message.push_str(&format!(" ({reason})"));
        }
        let line = Self::new_line(&meta, event, "--", message, String::new());
        self.push_line(&meta, line);
        EventOutcome {
            created: if created { vec![meta] } else { Vec::new() },
            ..EventOutcome::default()
        }
    }

    fn apply_topic(&mut self, event: &Event) -> EventOutcome {
        let (meta, created) = self.target_buffer(event, BufferKind::Channel);
        let text = event.text.clone().unwrap_or_default();
        let message = match event.nick.as_deref().filter(|n| !n.is_empty()) {
            None => format!("Topic: {text}"),
            Some(nick) => format!("{nick} has changed topic to: {text}"),
        };
        let line = Self::new_line(&meta, event, "--", message, String::new());
        self.push_line(&meta, line);

        // The topic becomes the buffer title; announce the refreshed buffer.
        let key = buffer_key(&meta.server_tag, &meta.short_name);
        let meta = if let Some(&idx) = self.by_key.get(&key) {
            self.buffers[idx].title = text;
            self.buffers[idx].meta()
        } else {
            meta
        };
        EventOutcome {
            created: if created { vec![meta.clone()] } else { Vec::new() },
            title_changed: Some(meta),
            nicklist_wanted: None,
        }
    }

    fn apply_nicklist(&mut self, event: &Event) -> EventOutcome {
        let text = event.text.as_deref().unwrap_or("[]");
        let entries = match erssi_proto::parse_nicklist(text) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "malformed nick list payload, dropping");
                return EventOutcome::default();
            }
        };
        let (meta, created) = self.target_buffer(event, BufferKind::Channel);
        let key = buffer_key(&meta.server_tag, &meta.short_name);
        if let Some(&idx) = self.by_key.get(&key) {
            self.buffers[idx].nicks = entries.iter().map(nick_from_entry).collect();
        }
        EventOutcome {
            created: if created { vec![meta] } else { Vec::new() },
            ..EventOutcome::default()
        }
    }
}

// ---------------------------------------------------------------------------
// hdata shapes
// ---------------------------------------------------------------------------

fn buffer_hdata() -> Hdata {
    Hdata::new(
        "buffer",
        Hdata::parse_keys("number:int,name:str,short_name:str,hidden:int,title:str,local_variables:htb")
            .expect("static key declaration"),
    )
}

fn buffer_item(meta: &BufferMeta) -> HdataItem {
    let local_variables = match meta.kind {
        BufferKind::Server => Hashtable::of_strings(&[("type", "server")]),
        BufferKind::Channel => {
            Hashtable::of_strings(&[("type", "channel"), ("server", &meta.server_tag)])
        }
        BufferKind::Private => {
            Hashtable::of_strings(&[("type", "private"), ("server", &meta.server_tag)])
        }
    };
    HdataItem {
        pointers: vec![meta.pointer.clone()],
        values: vec![
            Object::Int(meta.number),
            Object::str(meta.name.clone()),
            Object::str(meta.short_name.clone()),
            Object::Int(0),
            Object::str(meta.title.clone()),
            Object::Hashtable(local_variables),
        ],
    }
}

/// Mode sigil to nick color, matching what relay clients expect.
fn prefix_color(prefix: &str) -> &'static str {
    match prefix {
        "@" => "lightgreen",
        "+" => "yellow",
        "%" => "lightmagenta",
        _ => "default",
    }
}

fn nick_from_entry(entry: &NickEntry) -> Nick {
    Nick {
        name: entry.nick.clone(),
        prefix: entry.prefix.clone(),
        prefix_color: prefix_color(&entry.prefix).to_owned(),
        visible: true,
        is_group: false,
    }
}
