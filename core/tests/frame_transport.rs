//! End-to-end coverage of the frame-stream (WebSocket) transport: no
//! trailing newlines, one frame per message, binary payloads tagged binary.

use riotp_core::transport::byte::{ByteReader, ByteWriter};
use riotp_core::transport::frame;
use riotp_core::{Broker, Connection, DefaultPolicy};

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::LocalSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn run_local<F: Future>(fut: F) -> F::Output {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = LocalSet::new();
    local.block_on(&runtime, async {
        tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .expect("scenario timed out")
    })
}

async fn ws_connect(broker: &Rc<Broker>, server_id: usize) -> WsClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_broker = Rc::clone(broker);
    tokio::task::spawn_local(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (reader, writer) = frame::split(ws);
        Connection::spawn(
            accept_broker,
            Box::new(reader),
            Box::new(writer),
            false,
            server_id,
        );
    });
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    client
}

async fn next_data_frame(ws: &mut WsClient) -> Message {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            frame @ (Message::Text(_) | Message::Binary(_)) => return frame,
            _ => continue,
        }
    }
}

async fn expect_text(ws: &mut WsClient, expected: &str) {
    match next_data_frame(ws).await {
        Message::Text(text) => assert_eq!(text, expected),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

#[test]
fn frame_transport_replies_without_newlines() {
    run_local(async {
        let broker = Broker::new(Box::new(DefaultPolicy::new()));
        let mut ws = ws_connect(&broker, 1).await;

        send_text(&mut ws, "riotp300").await;
        expect_text(&mut ws, "ok").await;
        send_text(&mut ws, "name: wsdev").await;
        send_text(&mut ws, "END").await;
        expect_text(&mut ws, "ok").await;
        assert_eq!(broker.registry().len(), 1);

        send_text(&mut ws, "subscribe .*").await;
        expect_text(&mut ws, "ok 1").await;
    });
}

#[test]
fn frame_transport_binary_delivery() {
    run_local(async {
        let broker = Broker::new(Box::new(DefaultPolicy::new()));
        let mut ws = ws_connect(&broker, 1).await;

        send_text(&mut ws, "riotp300").await;
        expect_text(&mut ws, "ok").await;
        send_text(&mut ws, "name: wsdev").await;
        send_text(&mut ws, "END").await;
        expect_text(&mut ws, "ok").await;
        send_text(&mut ws, "subscribe .*").await;
        expect_text(&mut ws, "ok 1").await;

        // a byte-stream peer publishes to the frame-stream subscriber
        let (client_side, server_side) = duplex(4096);
        let (read, write) = tokio::io::split(server_side);
        Connection::spawn(
            Rc::clone(&broker),
            Box::new(ByteReader::new(read)),
            Box::new(ByteWriter::new(write)),
            true,
            0,
        );
        let (read, mut write) = tokio::io::split(client_side);
        let mut reader = BufReader::new(read);
        let mut line = String::new();

        for msg in ["riotp300\n", "name: dev1\nEND\n"] {
            write.write_all(msg.as_bytes()).await.unwrap();
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "ok\n");
        }
        write.write_all(b"tb 2 EVT_B\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ok\n");
        write.write_all(b"xy").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ok\n");

        // the sender is a byte stream, so its trailing-newline slot is part
        // of the payload and the advertised size
        expect_text(&mut ws, "eb 3 EVT_B dev1 1").await;
        match next_data_frame(&mut ws).await {
            Message::Binary(data) => assert_eq!(data, b"xy\n"),
            other => panic!("expected binary frame, got {:?}", other),
        }
    });
}

#[test]
fn frame_transport_empty_event() {
    run_local(async {
        let broker = Broker::new(Box::new(DefaultPolicy::new()));
        let mut publisher = ws_connect(&broker, 1).await;
        let mut subscriber = ws_connect(&broker, 1).await;

        for (ws, name) in [(&mut publisher, "wspub"), (&mut subscriber, "wssub")] {
            send_text(ws, "riotp300").await;
            expect_text(ws, "ok").await;
            send_text(ws, &format!("name: {}", name)).await;
            send_text(ws, "END").await;
            expect_text(ws, "ok").await;
        }

        send_text(&mut subscriber, "subscribe EVT_.*").await;
        expect_text(&mut subscriber, "ok 1").await;

        // frame senders have no trailing-newline slot anywhere
        send_text(&mut publisher, "te EVT_PING").await;
        expect_text(&mut publisher, "ok").await;
        expect_text(&mut subscriber, "ee EVT_PING wspub 1").await;
    });
}
