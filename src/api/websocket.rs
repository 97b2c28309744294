//! WebSocket relay between a client socket and a bridge
//!
//! Text messages are JSON tagged by `type`; binary messages are PCM16 at the wire
//! rate (capture audio inbound, upstream audio outbound). The client only toggles its
//! microphone when told to, so arbitration stays inside the bridge.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::ApiState;
use crate::realtime::{
    Bridge, BridgeEvent, BridgeHandle, BridgeSettings, Role, SessionId, SessionState,
};
use crate::voice::{AudioFrame, CaptureControl, FrameCodec};
use crate::{Error, ErrorKind, Result};

const OUTBOUND_BUFFER: usize = 256;

/// Incoming WebSocket message from client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Open or reuse the upstream session
    Connect {
        #[serde(default)]
        voice: Option<String>,
    },
    /// Speak text verbatim
    SendText { text: String },
    StartCapture,
    StopCapture,
    /// Halt playback and drop queued requests
    Interrupt,
    /// Interrupt and disable capture
    Stop,
    /// Ping to keep connection alive
    Ping,
}

/// Outgoing WebSocket message to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Session configured
    Ready { session_id: SessionId, voice: String },
    /// Session state changed
    State {
        session_id: SessionId,
        state: SessionState,
    },
    Transcript {
        role: Role,
        text: String,
        is_final: bool,
    },
    /// One request finished speaking
    ResponseComplete {
        #[serde(default)]
        response_id: Option<String>,
    },
    /// Stop sending microphone audio
    CapturePaused,
    /// Start sending microphone audio
    CaptureResumed,
    /// Error occurred
    Error {
        kind: ErrorKind,
        code: String,
        message: String,
    },
    /// Pong response
    Pong,
}

impl WsOutgoing {
    /// Map a bridge event onto the client protocol
    ///
    /// Capture toggles are sent by [`RemoteCapture`] and audio travels as binary, so
    /// those events map to `None`.
    #[must_use]
    pub fn from_event(event: &BridgeEvent) -> Option<Self> {
        match event {
            BridgeEvent::StateChanged { session_id, state } => Some(Self::State {
                session_id: session_id.clone(),
                state: *state,
            }),
            BridgeEvent::Ready { session_id, voice } => Some(Self::Ready {
                session_id: session_id.clone(),
                voice: voice.clone(),
            }),
            BridgeEvent::Transcript(t) => Some(Self::Transcript {
                role: t.role,
                text: t.text.clone(),
                is_final: t.is_final,
            }),
            BridgeEvent::ResponseComplete { response_id, .. } => Some(Self::ResponseComplete {
                response_id: response_id.clone(),
            }),
            BridgeEvent::Error(e) => Some(Self::Error {
                kind: e.kind,
                code: e.code.clone(),
                message: e.message.clone(),
            }),
            BridgeEvent::AudioChunk(_) | BridgeEvent::CapturePaused | BridgeEvent::CaptureResumed => {
                None
            }
        }
    }
}

/// What the send task writes to the socket
#[derive(Debug)]
enum Outbound {
    Json(WsOutgoing),
    Audio(Bytes),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capture gate shared between the bridge and the socket reader
struct RemoteGate {
    active: bool,
    codec: FrameCodec,
}

/// Capture control for a microphone on the far side of the socket
struct RemoteCapture {
    gate: Arc<Mutex<RemoteGate>>,
    tx: mpsc::Sender<Outbound>,
}

impl RemoteCapture {
    fn notify(&self, msg: WsOutgoing) {
        if self.tx.try_send(Outbound::Json(msg)).is_err() {
            tracing::warn!("client queue full, capture toggle not delivered");
        }
    }
}

impl CaptureControl for RemoteCapture {
    fn resume(&mut self, session: &SessionId) -> Result<()> {
        {
            let mut gate = lock(&self.gate);
            gate.codec.rebind(session);
            gate.active = true;
        }
        self.notify(WsOutgoing::CaptureResumed);
        Ok(())
    }

    fn pause(&mut self) {
        lock(&self.gate).active = false;
        self.notify(WsOutgoing::CapturePaused);
    }

    fn is_active(&self) -> bool {
        lock(&self.gate).active
    }
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, peer: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

    let mut settings = BridgeSettings::from_config(&state.config);
    settings.client_key = peer.ip().to_string();

    let gate = Arc::new(Mutex::new(RemoteGate {
        active: false,
        codec: FrameCodec::new(SessionId::from("pending"), settings.wire_rate),
    }));
    let capture = RemoteCapture {
        gate: Arc::clone(&gate),
        tx: tx.clone(),
    };
    let handle = Bridge::builder(settings, Arc::clone(&state.connector))
        .limiter(state.limiter.clone())
        .capture(Box::new(capture))
        .spawn();
    let events = handle.subscribe();

    tracing::info!(peer = %peer, "relay client connected");

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                Outbound::Json(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode relay message");
                        continue;
                    }
                },
                Outbound::Audio(data) => Message::Binary(data),
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut forward_task = tokio::spawn(forward_events(events, tx.clone()));

    let bridge = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Err(e) = handle_message(text.as_str(), &bridge, &tx).await {
                        let error = WsOutgoing::Error {
                            kind: e.kind(),
                            code: "invalid_message".to_string(),
                            message: e.to_string(),
                        };
                        let _ = tx.send(Outbound::Json(error)).await;
                    }
                }
                Message::Binary(data) => forward_capture(&gate, &bridge, data),
                Message::Close(_) => {
                    tracing::info!(peer = %peer, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for any task to complete
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            forward_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
            forward_task.abort();
        }
        _ = &mut forward_task => {
            send_task.abort();
            recv_task.abort();
        }
    }

    handle.close().await;
    state.limiter.retain_recent();
    tracing::info!(
        peer = %peer,
        tracked_clients = state.limiter.tracked(),
        "relay client disconnected"
    );
}

/// Relay bridge events to the client until either side goes away
async fn forward_events(
    events: tokio::sync::broadcast::Receiver<BridgeEvent>,
    tx: mpsc::Sender<Outbound>,
) {
    let mut stream = BroadcastStream::new(events);
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "relay client lagging, events dropped");
                continue;
            }
        };
        let outbound = match event {
            BridgeEvent::AudioChunk(frame) => Outbound::Audio(frame.into_bytes()),
            other => match WsOutgoing::from_event(&other) {
                Some(msg) => Outbound::Json(msg),
                None => continue,
            },
        };
        if tx.send(outbound).await.is_err() {
            return;
        }
    }
}

/// Stamp client microphone audio and hand it to the bridge
fn forward_capture(gate: &Mutex<RemoteGate>, bridge: &BridgeHandle, data: Bytes) {
    let frame: Option<AudioFrame> = {
        let mut gate = lock(gate);
        if !gate.active {
            tracing::trace!(bytes = data.len(), "capture paused, dropping client audio");
            return;
        }
        gate.codec.stamp(data)
    };
    if let Some(frame) = frame {
        if bridge.capture_sink().try_send(frame).is_err() {
            tracing::warn!("capture queue full, dropping client audio");
        }
    }
}

/// Handle a single incoming message
async fn handle_message(
    text: &str,
    bridge: &BridgeHandle,
    tx: &mpsc::Sender<Outbound>,
) -> Result<()> {
    let incoming: WsIncoming = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid message: {e}")))?;

    match incoming {
        WsIncoming::Ping => {
            tx.send(Outbound::Json(WsOutgoing::Pong))
                .await
                .map_err(|_| Error::Closed)?;
        }
        WsIncoming::Connect { voice } => {
            // Readiness is reported through the `ready` event
            let bridge = bridge.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.connect(voice.as_deref()).await {
                    tracing::warn!(error = %e, "relay connect failed");
                }
            });
        }
        WsIncoming::SendText { text } => bridge.send_text(text).await?,
        WsIncoming::StartCapture => {
            if let Err(e) = bridge.start_capture().await {
                tracing::debug!(error = %e, "capture not started");
            }
        }
        WsIncoming::StopCapture => bridge.stop_capture().await?,
        WsIncoming::Interrupt => bridge.interrupt().await?,
        WsIncoming::Stop => bridge.stop().await?,
    }

    Ok(())
}
