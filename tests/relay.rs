//! End-to-end relay tests over real WebSocket connections

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ptt_radio::audio::buffer::SampleQueue;
use ptt_radio::audio::CapturePipeline;
use ptt_radio::config::{RelayConfig, TalkerConfig};
use ptt_radio::error::NetworkError;
use ptt_radio::network::{ClientEvent, ClientSession};
use ptt_radio::protocol::{encode_frame, PttState};
use ptt_radio::server::RelayServer;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUIET: Duration = Duration::from_millis(200);

async fn start_relay() -> SocketAddr {
    let config = RelayConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        ..RelayConfig::default()
    };
    let server = RelayServer::new(config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    server.start_background(listener);
    addr
}

async fn open(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn recv(ws: &mut Ws) -> Option<Message> {
    match timeout(QUIET, ws.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        _ => None,
    }
}

async fn recv_text(ws: &mut Ws) -> String {
    match recv(ws).await {
        Some(Message::Text(text)) => text,
        other => panic!("expected text, got {:?}", other),
    }
}

async fn recv_json(ws: &mut Ws) -> Value {
    serde_json::from_str(&recv_text(ws).await).unwrap()
}

async fn join(ws: &mut Ws, channel: Value) -> Value {
    let join = json!({"type": "join", "channel": channel, "role": "client"});
    ws.send(Message::Text(join.to_string())).await.unwrap();
    recv_json(ws).await
}

async fn joined(addr: SocketAddr, channel: u8) -> Ws {
    let mut ws = open(addr).await;
    let reply = join(&mut ws, json!(channel)).await;
    assert_eq!(reply, json!({"type": "joined", "channel": channel}));
    ws
}

#[tokio::test]
async fn test_transmission_reaches_channel_peers_only() {
    let addr = start_relay().await;
    let mut a = joined(addr, 1).await;
    let mut b = joined(addr, 1).await;
    let mut c = joined(addr, 2).await;

    let start = r#"{"type":"ptt","state":"start","format":{"encoding":"pcm_s16le","sampleRate":16000,"channels":1},"talker":"A"}"#;
    let stop = r#"{"type":"ptt","state":"stop"}"#;
    a.send(Message::Text(start.to_string())).await.unwrap();

    let frames: Vec<Vec<u8>> = (0..10i16)
        .map(|n| {
            let samples: Vec<i16> = (0..320).map(|i| (i as i16).wrapping_mul(n + 1)).collect();
            encode_frame(&samples).to_vec()
        })
        .collect();
    for frame in &frames {
        a.send(Message::Binary(frame.clone())).await.unwrap();
    }
    a.send(Message::Text(stop.to_string())).await.unwrap();

    assert_eq!(recv_text(&mut b).await, start);
    for frame in &frames {
        match recv(&mut b).await {
            Some(Message::Binary(data)) => assert_eq!(&data, frame),
            other => panic!("expected audio frame, got {:?}", other),
        }
    }
    assert_eq!(recv_text(&mut b).await, stop);

    assert!(recv(&mut a).await.is_none(), "sender must not hear itself");
    assert!(recv(&mut c).await.is_none(), "other channels must stay silent");
}

#[tokio::test]
async fn test_join_channel_is_coerced() {
    let addr = start_relay().await;

    for (requested, expected) in [
        (json!(0), 1),
        (json!(-3), 1),
        (json!("abc"), 1),
        (json!(300), 255),
        (json!("12"), 12),
        (json!(7.9), 7),
    ] {
        let mut ws = open(addr).await;
        let reply = join(&mut ws, requested.clone()).await;
        assert_eq!(reply["channel"], expected, "join with {}", requested);
    }
}

#[tokio::test]
async fn test_unjoined_connection_defaults_to_channel_one() {
    let addr = start_relay().await;
    let mut listener = joined(addr, 1).await;
    let mut silent = open(addr).await;

    silent.send(Message::Binary(vec![1, 0, 2, 0])).await.unwrap();
    assert_eq!(recv(&mut listener).await, Some(Message::Binary(vec![1, 0, 2, 0])));
}

#[tokio::test]
async fn test_unknown_messages_are_ignored() {
    let addr = start_relay().await;
    let mut a = joined(addr, 4).await;
    let mut b = joined(addr, 4).await;

    a.send(Message::Text("not json".to_string())).await.unwrap();
    a.send(Message::Text(r#"{"type":"kick","who":"b"}"#.to_string()))
        .await
        .unwrap();
    let busy = r#"{"type":"busy","since":1712,"by":"gw"}"#;
    a.send(Message::Text(busy.to_string())).await.unwrap();

    assert_eq!(recv_text(&mut b).await, busy);
    assert!(recv(&mut b).await.is_none());
}

#[tokio::test]
async fn test_client_session_talks_and_listens() {
    let addr = start_relay().await;
    let config = TalkerConfig {
        server_url: format!("ws://{}/ws", addr),
        channel: 7,
        ..TalkerConfig::default()
    };

    let inbound = Arc::new(SampleQueue::new(4096));
    let mut session = ClientSession::connect(&config, inbound.clone()).await.unwrap();
    assert_eq!(session.channel(), 7);

    let mut peer = joined(addr, 7).await;

    // Outgoing: control before audio, in order
    session.start_talking().await.unwrap();
    assert!(session.is_talking());
    session.send_frame(&[1, -1, 256]).await.unwrap();
    session.stop_talking().await.unwrap();

    let start = recv_json(&mut peer).await;
    assert_eq!(start["type"], "ptt");
    assert_eq!(start["state"], "start");
    assert_eq!(start["format"]["sampleRate"], 16000);
    assert_eq!(
        recv(&mut peer).await,
        Some(Message::Binary(vec![0x01, 0x00, 0xff, 0xff, 0x00, 0x01]))
    );
    assert_eq!(recv_json(&mut peer).await["state"], "stop");

    // Incoming: audio into the queue, control as events
    peer.send(Message::Binary(encode_frame(&[100, -200]).to_vec()))
        .await
        .unwrap();
    peer.send(Message::Text(r#"{"type":"ptt","state":"stop"}"#.to_string()))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), session.next_event()).await.unwrap();
    assert_eq!(event, Some(ClientEvent::RemotePtt(PttState::Stop)));
    assert_eq!(inbound.pop(), Some(100));
    assert_eq!(inbound.pop(), Some(-200));

    session.close().await;
}

#[tokio::test]
async fn test_stop_follows_block_captured_before_release() {
    let addr = start_relay().await;
    let config = TalkerConfig {
        server_url: format!("ws://{}/ws", addr),
        channel: 3,
        ..TalkerConfig::default()
    };
    let session = ClientSession::connect(&config, Arc::new(SampleQueue::new(16)))
        .await
        .unwrap();
    let mut peer = joined(addr, 3).await;

    let gate = session.transmit_gate();
    let emitter = session.frame_emitter();
    let mut pipeline = CapturePipeline::new(48_000, 1);
    session.start_talking().await.unwrap();

    // A capture block starts while PTT is held; release lands mid-block
    let pass = gate.enter();
    let frame = pipeline.process(&[0.5; 960], pass.is_some()).unwrap();

    {
        let stop = session.stop_talking();
        tokio::pin!(stop);
        assert!(timeout(Duration::from_millis(50), &mut stop).await.is_err());

        assert!(emitter.emit(frame));
        drop(pass);
        stop.await.unwrap();
    }

    assert_eq!(recv_json(&mut peer).await["state"], "start");
    match recv(&mut peer).await {
        Some(Message::Binary(data)) => assert_eq!(data.len(), 640),
        other => panic!("expected audio frame before stop, got {:?}", other),
    }
    assert_eq!(recv_json(&mut peer).await["state"], "stop");

    // Blocks after release are not sent
    let pass = gate.enter();
    assert!(pass.is_none());
    assert!(pipeline.process(&[0.5; 960], pass.is_some()).is_none());
    assert!(recv(&mut peer).await.is_none());

    session.close().await;
}

#[tokio::test]
async fn test_join_times_out_without_acknowledgement() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = TalkerConfig {
        server_url: format!("ws://{}/ws", addr),
        join_timeout_ms: 200,
        ..TalkerConfig::default()
    };
    let result = ClientSession::connect(&config, Arc::new(SampleQueue::new(16))).await;
    assert!(matches!(result, Err(NetworkError::JoinTimeout(200))));
}
