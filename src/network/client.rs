//! WebSocket connection from a participant to the relay
//!
//! The session joins a channel, then runs two tasks: a writer draining the
//! ordered [`Outgoing`] queue onto the socket, and a reader that hands audio
//! frames to the playback queue and surfaces control messages as
//! [`ClientEvent`]s.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::Outgoing;
use crate::audio::buffer::{FramePool, SharedFramePool, SharedSampleQueue};
use crate::audio::capture::{FrameEmitter, SharedTransmitGate};
use crate::config::TalkerConfig;
use crate::constants::{DEFAULT_OUTBOUND_QUEUE, FRAME_POOL_SIZE, TRANSPORT_FRAME_SAMPLES};
use crate::error::NetworkError;
use crate::protocol::{decode_frame, encode_frame, ControlMessage, PttState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the relay told us
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Joined(u8),
    RemotePtt(PttState),
    Busy(serde_json::Map<String, serde_json::Value>),
    Closed,
}

impl ClientEvent {
    fn from_text(text: &str) -> Option<Self> {
        match ControlMessage::from_json(text)? {
            ControlMessage::Joined { channel } => Some(ClientEvent::Joined(channel)),
            ControlMessage::Ptt { state, .. } => Some(ClientEvent::RemotePtt(state)),
            ControlMessage::Busy { extra } => Some(ClientEvent::Busy(extra)),
            ControlMessage::Join { .. } => None,
        }
    }
}

/// A joined connection to the relay
pub struct ClientSession {
    channel: u8,
    outgoing: mpsc::Sender<Outgoing>,
    events: mpsc::Receiver<ClientEvent>,
    gate: SharedTransmitGate,
    pool: SharedFramePool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientSession {
    /// Connect, join the configured channel and wait for the relay to
    /// acknowledge. Received audio is pushed into `inbound`.
    pub async fn connect(
        config: &TalkerConfig,
        inbound: SharedSampleQueue,
    ) -> Result<Self, NetworkError> {
        let (socket, _) = connect_async(config.server_url.as_str())
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", config.server_url, e)))?;
        let (mut sink, mut stream) = socket.split();

        let join = ControlMessage::join(config.channel, config.role);
        sink.send(Message::Text(join.to_json()))
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        let channel = tokio::time::timeout(
            Duration::from_millis(config.join_timeout_ms),
            wait_joined(&mut stream),
        )
        .await
        .map_err(|_| NetworkError::JoinTimeout(config.join_timeout_ms))??;

        tracing::info!("Joined channel {} as {}", channel, config.role);

        let pool = Arc::new(FramePool::new(FRAME_POOL_SIZE, TRANSPORT_FRAME_SAMPLES * 4));
        let (outgoing, outgoing_rx) = mpsc::channel(DEFAULT_OUTBOUND_QUEUE);
        let (events_tx, events) = mpsc::channel(64);

        let writer = tokio::spawn(write_loop(sink, outgoing_rx, pool.clone()));
        let reader = tokio::spawn(read_loop(stream, inbound, events_tx));

        Ok(Self {
            channel,
            outgoing,
            events,
            gate: SharedTransmitGate::default(),
            pool,
            reader,
            writer,
        })
    }

    /// Channel the relay placed us on
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Emitter for the capture callback, feeding this session's queue
    pub fn frame_emitter(&self) -> FrameEmitter {
        FrameEmitter::new(self.pool.clone(), self.outgoing.clone())
    }

    /// Gate the capture callback passes through to decide whether to emit
    pub fn transmit_gate(&self) -> SharedTransmitGate {
        self.gate.clone()
    }

    pub fn is_talking(&self) -> bool {
        self.gate.is_open()
    }

    /// Announce a transmission, then let captured frames through
    pub async fn start_talking(&self) -> Result<(), NetworkError> {
        if self.is_talking() {
            return Ok(());
        }
        self.send(Outgoing::Control(ControlMessage::ptt_start())).await?;
        self.gate.open();
        tracing::info!("PTT start on channel {}", self.channel);
        Ok(())
    }

    /// Stop letting frames through, wait for any block already passed by
    /// the gate to be queued, then announce the end of transmission
    pub async fn stop_talking(&self) -> Result<(), NetworkError> {
        if !self.is_talking() {
            return Ok(());
        }
        self.gate.close().await;
        self.send(Outgoing::Control(ControlMessage::ptt_stop())).await?;
        tracing::info!("PTT stop on channel {}", self.channel);
        Ok(())
    }

    /// Queue a frame that did not come from the capture callback
    pub async fn send_frame(&self, samples: &[i16]) -> Result<(), NetworkError> {
        self.send(Outgoing::Frame(samples.to_vec())).await
    }

    /// Next event from the relay; `None` once the session is gone
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Flush queued messages, close the socket and wait for both tasks
    pub async fn close(self) {
        let _ = self.outgoing.send(Outgoing::Close).await;
        let _ = self.writer.await;
        self.reader.abort();
    }

    async fn send(&self, message: Outgoing) -> Result<(), NetworkError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| NetworkError::Closed)
    }
}

/// Read until the relay acknowledges our join
async fn wait_joined<S>(stream: &mut S) -> Result<u8, NetworkError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(ControlMessage::Joined { channel }) = ControlMessage::from_json(&text) {
                    return Ok(channel);
                }
            }
            Ok(Message::Close(_)) => return Err(NetworkError::Closed),
            // Audio relayed on the default channel before the join landed
            Ok(_) => {}
            Err(e) => return Err(NetworkError::ConnectionFailed(e.to_string())),
        }
    }
    Err(NetworkError::Closed)
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    pool: SharedFramePool,
) {
    while let Some(item) = outgoing.recv().await {
        let message = match item {
            Outgoing::Control(control) => Message::Text(control.to_json()),
            Outgoing::Frame(samples) => {
                let frame = encode_frame(&samples);
                pool.recycle(samples);
                Message::Binary(frame.into())
            }
            Outgoing::Close => break,
        };

        if let Err(e) = sink.send(message).await {
            tracing::warn!("Send to relay failed: {}", e);
            return;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    inbound: SharedSampleQueue,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(frame)) => inbound.push_frame(decode_frame(&frame)),
            Ok(Message::Text(text)) => {
                if let Some(event) = ClientEvent::from_text(&text) {
                    if events.try_send(event).is_err() {
                        tracing::debug!("Dropping relay event, nobody is listening");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Relay connection error: {}", e);
                break;
            }
        }
    }

    let _ = events.try_send(ClientEvent::Closed);
}
