//! Encrypted upstream path, end to end.
//!
//! The fake upstream seals its JSON frames with the same key derivation
//! the bridge uses (PBKDF2 over the shared password), sends them as binary
//! WebSocket frames, and the bridge must decrypt, translate, and serve the
//! result to a relay client. Undecryptable frames must not kill the link.

use bridge::bridge::{Bridge, LinkState};
use bridge::relay::RelayServer;
use bridge::store::Store;
use bridge::upstream::{self, UpstreamConfig};
use erssi_proto::crypto::FrameCipher;
use futures_util::{SinkExt, StreamExt};
use relay_codec::{decode_message, Message, Object};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

const PASSWORD: &str = "hunter2";

async fn start_sealed_upstream() -> (String, mpsc::Sender<WsFrame>, mpsc::Receiver<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (push_tx, mut push_rx) = mpsc::channel::<WsFrame>(64);
    let (req_tx, req_rx) = mpsc::channel(64);
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
                    None => break,
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
    (format!("ws://{addr}"), push_tx, req_rx)
}

async fn start_bridge(url: String) -> SocketAddr {
    let config = UpstreamConfig {
        url,
        password: PASSWORD.to_owned(),
    };
    let (handle, reader) = upstream::connect(&config).await.unwrap();
    let (event_tx, mut event_rx) = mpsc::channel(64);
    tokio::spawn(reader.run(event_tx));
    let (request_tx, mut request_rx) = mpsc::channel::<erssi_proto::Event>(64);
    tokio::spawn(async move {
        while let Some(event) = request_rx.recv().await {
            let _ = handle.send(&event).await;
        }
    });
    let (client_tx, mut client_rx) = mpsc::channel(64);
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
    });
    let client_side = bridge;
    tokio::spawn(async move {
        while let Some(request) = client_rx.recv().await {
            client_side.handle_client_request(request).await;
        }
    });
    relay_addr
}

async fn read_frame(stream: &mut TcpStream) -> Message {
    let mut len_buf = [0u8; 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut len_buf))
        .await
        .expect("frame header timeout")
        .unwrap();
    let total = u32::from_be_bytes(len_buf) as usize;
    let mut rest = vec![0u8; total - 4];
    stream.read_exact(&mut rest).await.unwrap();
    let mut frame = len_buf.to_vec();
    frame.extend_from_slice(&rest);
    decode_message(&frame).unwrap()
}

fn sealed(cipher: &FrameCipher, counter: u8, json: &str) -> WsFrame {
    let mut nonce = [0u8; 12];
    nonce[11] = counter;
    WsFrame::Binary(cipher.seal(&nonce, json.as_bytes()).into())
}

#[tokio::test]
async fn encrypted_frames_drive_the_model_and_garbage_is_survivable() {
    let (url, push, mut requests) = start_sealed_upstream().await;
    let relay_addr = start_bridge(url).await;
    let cipher = FrameCipher::new(PASSWORD);

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"init\n").await.unwrap();

    // The init's one-shot state request marks the client authenticated and
    // the pipeline live before any frames are pushed.
    let sync = timeout(Duration::from_secs(2), requests.recv())
        .await
        .expect("state request timeout")
        .unwrap();
    assert_eq!(sync["type"], "sync_server");

    // Garbage first: too short, then a tampered tag. Both are dropped.
    push.send(WsFrame::Binary(vec![1, 2, 3].into())).await.unwrap();
    let mut tampered = cipher.seal(&[9u8; 12], br#"{"type":"topic"}"#);
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    push.send(WsFrame::Binary(tampered.into())).await.unwrap();

    // A real sealed message follows and must still be translated.
    push.send(sealed(
        &cipher,
        1,
        r##"{"type":"message","channel":"#sec","server":"libera","nick":"bob","text":"secret","timestamp":1700000000}"##,
    ))
    .await
    .unwrap();

    // The live creations reach the authenticated client as broadcasts:
    // first the core buffer (no dump has run), then the channel.
    let core = read_frame(&mut client).await;
    assert_eq!(core.id, "_buffer_opened");
    let msg = read_frame(&mut client).await;
    assert_eq!(msg.id, "_buffer_opened");
    let Object::Hdata(hda) = &msg.objects[0] else {
        panic!("expected hdata broadcast");
    };
    assert_eq!(hda.items.len(), 1);
    match &hda.items[0].values[1] {
        Object::Str(Some(name)) => assert_eq!(name, "libera.#sec"),
        other => panic!("expected name, got {other:?}"),
    }

    // And the line is served back over the relay protocol.
    let pointer = hda.items[0].pointers[0].clone();
    client
        .write_all(format!("(q) hdata buffer:{pointer}/lines/last_line(-5)\n").as_bytes())
        .await
        .unwrap();
    let reply = read_frame(&mut client).await;
    assert_eq!(reply.id, "q");
    let Object::Hdata(lines) = &reply.objects[0] else {
        panic!("expected lines hdata");
    };
    assert_eq!(lines.items.len(), 1);
    match &lines.items[0].values[7] {
        Object::Str(Some(text)) => assert_eq!(text, "secret"),
        other => panic!("expected message, got {other:?}"),
    }
}
