//! End-to-end relay session tests.
//!
//! The whole bridge runs in-process: a fake erssi upstream (plain-ws
//! loopback server), the real upstream driver, store, orchestrator, and
//! relay server. Relay clients are raw TCP sockets speaking the relay
//! command syntax and decoding typed-object frames with `relay-codec`.
//!
//! # Coverage
//! - State dump fan-out and `gui_buffers` ordering
//! - One-shot `sync_server` across multiple `init`s
//! - Case-folded buffer keys on the live message path
//! - `input` routing through buffer identity
//! - Join lines plus the follow-up nick-list request
//! - Scrollback via `lines/last_line(-N)`
//! - `_buffer_opened` broadcasts for live creations and topic changes

use bridge::bridge::{Bridge, LinkState};
use bridge::relay::RelayServer;
use bridge::store::Store;
use bridge::upstream::{self, UpstreamConfig};
use futures_util::{SinkExt, StreamExt};
use relay_codec::{decode_message, Message, Object};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A loopback stand-in for the erssi front-end: one WebSocket connection,
/// frames pushed from the test, requests surfaced back to it.
struct FakeUpstream {
    push: mpsc::Sender<WsFrame>,
    requests: mpsc::Receiver<serde_json::Value>,
}

async fn start_fake_upstream() -> (String, FakeUpstream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (push_tx, mut push_rx) = mpsc::channel::<WsFrame>(256);
    let (req_tx, req_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                frame = push_rx.recv() => match frame {
                    Some(frame) => {
                        if ws.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                },
                inbound = ws.next() => match inbound {
                    Some(Ok(WsFrame::Text(text))) => {
                        let value: serde_json::Value =
                            serde_json::from_str(&text).expect("bridge sends valid JSON");
                        if req_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
    });
    (
        format!("ws://{addr}"),
        FakeUpstream {
            push: push_tx,
            requests: req_rx,
        },
    )
}

/// Wire the real components the way `bridge::run` does, but with the relay
/// server on an ephemeral port the test can reach.
async fn start_bridge() -> (SocketAddr, FakeUpstream) {
    let (url, fake) = start_fake_upstream().await;
    let config = UpstreamConfig {
        url,
        password: String::new(),
    };
    let (handle, reader) = upstream::connect(&config).await.unwrap();

    let (event_tx, mut event_rx) = mpsc::channel(256);
    tokio::spawn(reader.run(event_tx));

    let (request_tx, mut request_rx) = mpsc::channel::<erssi_proto::Event>(256);
    tokio::spawn(async move {
        while let Some(event) = request_rx.recv().await {
            let _ = handle.send(&event).await;
        }
    });

    let (client_tx, mut client_rx) = mpsc::channel(256);
    let server = RelayServer::bind("127.0.0.1:0", client_tx).await.unwrap();
    let relay_addr = server.local_addr().unwrap();
    let clients = server.clients();
    tokio::spawn(server.run());

    let bridge = Bridge::new(Arc::new(Store::new()), request_tx, clients);
    bridge.set_link_state(LinkState::Connected);
    let upstream_side = bridge.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            upstream_side.handle_upstream_event(event).await;
        }
        upstream_side.on_upstream_disconnected();
    });
    let client_side = bridge;
    tokio::spawn(async move {
        while let Some(request) = client_rx.recv().await {
            client_side.handle_client_request(request).await;
        }
    });

    (relay_addr, fake)
}

/// A raw relay client: writes command lines, reads typed-object frames.
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> TestClient {
        TestClient {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\n").await.unwrap();
    }

    async fn read_message(&mut self) -> Message {
        let mut len_buf = [0u8; 4];
        timeout(Duration::from_secs(2), self.stream.read_exact(&mut len_buf))
            .await
            .expect("frame header timeout")
            .unwrap();
        let total = u32::from_be_bytes(len_buf) as usize;
        let mut rest = vec![0u8; total - 4];
        timeout(Duration::from_secs(2), self.stream.read_exact(&mut rest))
            .await
            .expect("frame body timeout")
            .unwrap();
        let mut frame = len_buf.to_vec();
        frame.extend_from_slice(&rest);
        decode_message(&frame).unwrap()
    }

    /// Read frames until the reply with the given correlation id arrives.
    /// Broadcasts (`_buffer_opened` and friends) may interleave; skip them.
    async fn read_reply(&mut self, id: &str) -> Message {
        loop {
            let msg = self.read_message().await;
            if msg.id == id {
                return msg;
            }
        }
    }

    /// Request `gui_buffers` with the given id and return the reply's hdata.
    async fn fetch_buffers(&mut self, id: &str) -> relay_codec::Hdata {
        self.send_line(&format!("({id}) hdata buffer:gui_buffers(*)")).await;
        let msg = self.read_reply(id).await;
        let Object::Hdata(hda) = msg.objects.into_iter().next().unwrap() else {
            panic!("expected hdata reply");
        };
        hda
    }

    /// Poll until `gui_buffers` reports `want` buffers.
    async fn await_buffer_count(&mut self, want: usize) -> relay_codec::Hdata {
        for attempt in 0..100 {
            let hda = self.fetch_buffers(&format!("poll{attempt}")).await;
            if hda.items.len() == want {
                return hda;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never saw {want} buffers");
    }
}

fn item_name(item: &relay_codec::HdataItem) -> String {
    match &item.values[1] {
        Object::Str(Some(name)) => name.clone(),
        other => panic!("expected name string, got {other:?}"),
    }
}

fn item_number(item: &relay_codec::HdataItem) -> i32 {
    match item.values[0] {
        Object::Int(n) => n,
        _ => panic!("expected int number"),
    }
}

fn item_message(item: &relay_codec::HdataItem) -> String {
    match &item.values[7] {
        Object::Str(Some(text)) => text.clone(),
        other => panic!("expected message string, got {other:?}"),
    }
}

const DUMP: &str = r##"{"type":"state_dump","server":"libera","extra_data":{"servers":[
    {"tag":"libera",
     "channels":[{"name":"#a","topic":"alpha"},{"name":"#b"}],
     "queries":[{"nick":"alice"}]}
]}}"##;

async fn push_json(fake: &FakeUpstream, json: &str) {
    fake.push
        .send(WsFrame::Text(json.to_owned().into()))
        .await
        .unwrap();
}

async fn next_request(fake: &mut FakeUpstream) -> serde_json::Value {
    timeout(Duration::from_secs(2), fake.requests.recv())
        .await
        .expect("upstream request timeout")
        .expect("upstream closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_dump_fans_out_buffers_in_declared_order() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;

    let request = next_request(&mut fake).await;
    assert_eq!(request["type"], "sync_server");
    assert_eq!(request["server"], "*");

    push_json(&fake, DUMP).await;
    let hda = client.await_buffer_count(4).await;
    let names: Vec<String> = hda.items.iter().map(item_name).collect();
    assert_eq!(
        names,
        vec!["core.weechat", "libera.#a", "libera.#b", "libera.alice"]
    );
    let numbers: Vec<i32> = hda.items.iter().map(item_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);

    // The hotlist stub answers with the right schema and zero items.
    client.send_line("(hl) hdata hotlist:gui_hotlist(*)").await;
    let msg = client.read_reply("hl").await;
    let Object::Hdata(hotlist) = &msg.objects[0] else {
        panic!("expected hotlist hdata");
    };
    assert_eq!(
        hotlist.keys_decl(),
        "priority:int,date:tim,date_printed:tim,buffer:ptr,count:int"
    );
    assert!(hotlist.items.is_empty());
}

#[tokio::test]
async fn sync_server_is_requested_exactly_once() {
    let (addr, mut fake) = start_bridge().await;
    let mut first = TestClient::connect(addr).await;
    let mut second = TestClient::connect(addr).await;
    first.send_line("init").await;
    second.send_line("init").await;

    let request = next_request(&mut fake).await;
    assert_eq!(request["type"], "sync_server");
    let extra = timeout(Duration::from_millis(300), fake.requests.recv()).await;
    assert!(extra.is_err(), "second init must not re-request state");
}

#[tokio::test]
async fn input_and_case_folded_messages_share_one_buffer() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;
    let _sync = next_request(&mut fake).await;

    push_json(&fake, DUMP).await;
    let hda = client.await_buffer_count(4).await;
    let chan_a = hda
        .items
        .iter()
        .find(|item| item_name(item) == "libera.#a")
        .unwrap();
    let pointer = chan_a.pointers[0].clone();

    client.send_line(&format!("input {pointer} Hello")).await;
    let request = next_request(&mut fake).await;
    assert_eq!(request["type"], "message");
    assert_eq!(request["server_tag"], "libera");
    assert_eq!(request["target"], "#a");
    assert_eq!(request["text"], "Hello");

    // A differently-cased broadcast lands in the same buffer.
    push_json(
        &fake,
        r##"{"type":"message","channel":"#A","server":"libera","nick":"bob","text":"hi","timestamp":1700000000}"##,
    )
    .await;
    for attempt in 0..100 {
        client
            .send_line(&format!("(l{attempt}) hdata buffer:{pointer}/lines/last_line(-10)"))
            .await;
        let msg = client.read_reply(&format!("l{attempt}")).await;
        let Object::Hdata(lines) = &msg.objects[0] else {
            panic!("expected lines hdata");
        };
        if !lines.items.is_empty() {
            assert_eq!(item_message(&lines.items[0]), "hi");
            break;
        }
        assert!(attempt < 99, "message line never appeared");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let hda = client.fetch_buffers("recheck").await;
    assert_eq!(hda.items.len(), 4, "no new buffer for a case variant");
}

#[tokio::test]
async fn join_appends_system_line_and_requests_nicklist() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;
    let _sync = next_request(&mut fake).await;

    push_json(
        &fake,
        r##"{"type":"channel_join","server":"libera","channel":"#a","nick":"carol"}"##,
    )
    .await;

    let request = next_request(&mut fake).await;
    assert_eq!(request["type"], "nicklist");
    assert_eq!(request["server_tag"], "libera");
    assert_eq!(request["target"], "#a");

    // The first live event also materializes the core buffer.
    let hda = client.await_buffer_count(2).await;
    let pointer = hda
        .items
        .iter()
        .find(|item| item_name(item) == "libera.#a")
        .expect("channel buffer")
        .pointers[0]
        .clone();
    client
        .send_line(&format!("(j) hdata buffer:{pointer}/lines/last_line(-1)"))
        .await;
    let msg = client.read_reply("j").await;
    let Object::Hdata(lines) = &msg.objects[0] else {
        panic!("expected lines hdata");
    };
    assert_eq!(lines.items.len(), 1);
    assert_eq!(item_message(&lines.items[0]), "carol has joined #a");
    match &lines.items[0].values[6] {
        Object::Str(Some(prefix)) => assert_eq!(prefix, "--"),
        other => panic!("expected prefix string, got {other:?}"),
    }
}

#[tokio::test]
async fn scrollback_returns_the_last_lines_in_order() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;
    let _sync = next_request(&mut fake).await;

    for i in 0..600 {
        push_json(
            &fake,
            &format!(
                r##"{{"type":"message","channel":"#a","server":"libera","nick":"bob","text":"msg {i}","timestamp":{}}}"##,
                1_700_000_000 + i
            ),
        )
        .await;
    }
    let hda = client.await_buffer_count(2).await;
    let pointer = hda
        .items
        .iter()
        .find(|item| item_name(item) == "libera.#a")
        .expect("channel buffer")
        .pointers[0]
        .clone();

    // Poll until the tail of the flood is visible, then check the window.
    for attempt in 0..200 {
        client
            .send_line(&format!("(42) hdata buffer:{pointer}/lines/last_line(-100)"))
            .await;
        let msg = client.read_reply("42").await;
        let Object::Hdata(lines) = &msg.objects[0] else {
            panic!("expected lines hdata");
        };
        if lines.items.len() == 100 && item_message(&lines.items[99]) == "msg 599" {
            assert_eq!(item_message(&lines.items[0]), "msg 500");
            assert_eq!(lines.h_path, "line_data");
            return;
        }
        assert!(attempt < 199, "flood never fully ingested");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn live_buffer_creation_broadcasts_buffer_opened() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;
    let _sync = next_request(&mut fake).await;

    push_json(
        &fake,
        r##"{"type":"message","channel":"#new","server":"libera","nick":"bob","text":"hi"}"##,
    )
    .await;

    // No dump has run yet, so this event creates the core buffer too.
    // Each creation is announced on its own, one buffer per message.
    let first = client.read_message().await;
    assert_eq!(first.id, "_buffer_opened");
    let Object::Hdata(core) = &first.objects[0] else {
        panic!("expected hdata broadcast");
    };
    assert_eq!(core.items.len(), 1);
    assert_eq!(item_name(&core.items[0]), "core.weechat");

    let second = client.read_message().await;
    assert_eq!(second.id, "_buffer_opened");
    let Object::Hdata(hda) = &second.objects[0] else {
        panic!("expected hdata broadcast");
    };
    assert_eq!(hda.items.len(), 1);
    assert_eq!(item_name(&hda.items[0]), "libera.#new");
}

#[tokio::test]
async fn topic_change_rebroadcasts_the_buffer_with_its_title() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;
    let _sync = next_request(&mut fake).await;

    push_json(
        &fake,
        r##"{"type":"message","channel":"#t","server":"libera","nick":"bob","text":"hi"}"##,
    )
    .await;
    // Creation announcements: the core buffer, then the channel.
    let core = client.read_message().await;
    assert_eq!(core.id, "_buffer_opened");
    let created = client.read_message().await;
    assert_eq!(created.id, "_buffer_opened");

    push_json(
        &fake,
        r##"{"type":"topic","channel":"#t","server":"libera","nick":"oper","text":"fresh topic"}"##,
    )
    .await;
    let announced = client.read_message().await;
    assert_eq!(announced.id, "_buffer_opened");
    let Object::Hdata(hda) = &announced.objects[0] else {
        panic!("expected hdata broadcast");
    };
    match &hda.items[0].values[4] {
        Object::Str(Some(title)) => assert_eq!(title, "fresh topic"),
        other => panic!("expected title string, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_commands_and_sync_are_silent() {
    let (addr, mut fake) = start_bridge().await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("init").await;
    let _sync = next_request(&mut fake).await;

    client.send_line("sync").await;
    client.send_line("desync").await;
    client.send_line("(x) frobnicate now").await;
    client.send_line("(u) input 0xdead nothing there").await;

    // None of those produce frames; a follow-up request still works and is
    // the next thing on the wire.
    let hda = client.fetch_buffers("after").await;
    assert!(hda.items.is_empty());
}
