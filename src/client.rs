//! Client-facing voice transport
//!
//! [`VoiceClient`] talks to a relay server (`voice-relay serve`) over WebSocket. It
//! reconnects on its own after transport failures and replays only session
//! establishment (`connect`); a request that was in flight when the link dropped is
//! reported through `on_error` and must be resent by the caller.
//!
//! Local capture is toggled only when the relay says so, which keeps the microphone
//! and speaker from running at the same time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::api::websocket::{WsIncoming, WsOutgoing};
use crate::realtime::{
    ConnectLimiter, RetryPolicy, Role, SessionId, SessionState, Transcript, delay_for_attempt,
};
use crate::voice::{AudioFrame, CaptureControl, FrameCodec, PlaybackScheduler, WIRE_SAMPLE_RATE};
use crate::{BridgeError, Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

type AudioCallback = Box<dyn Fn(&AudioFrame) + Send + Sync>;
type TranscriptCallback = Box<dyn Fn(&Transcript) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&BridgeError) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(Option<&str>) + Send + Sync>;

const LIMITER_KEY: &str = "relay";

/// Connection and session status as last reported by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    /// Socket to the relay is open
    pub connected: bool,
    pub state: SessionState,
    pub session_id: Option<SessionId>,
    pub voice: Option<String>,
    /// Set when the voice became unavailable
    pub error: Option<BridgeError>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            connected: false,
            state: SessionState::Disconnected,
            session_id: None,
            voice: None,
            error: None,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    audio: Option<AudioCallback>,
    transcript: Option<TranscriptCallback>,
    error: Option<ErrorCallback>,
    complete: Option<CompleteCallback>,
}

enum ClientCommand {
    Connect {
        voice: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Send {
        msg: WsIncoming,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

enum Exit {
    Closed,
    Lost,
}

/// Builder for [`VoiceClient`]
pub struct VoiceClientBuilder {
    url: Url,
    retry: RetryPolicy,
    limiter: ConnectLimiter,
    handshake_timeout: Duration,
    wire_rate: u32,
    playback: Option<Arc<PlaybackScheduler>>,
    capture: Option<Box<dyn CaptureControl>>,
    capture_tx: mpsc::Sender<AudioFrame>,
    capture_rx: mpsc::Receiver<AudioFrame>,
    callbacks: Callbacks,
}

impl VoiceClientBuilder {
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Throttle reconnect attempts
    #[must_use]
    pub fn limiter(mut self, limiter: ConnectLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Render received audio through a local scheduler
    #[must_use]
    pub fn playback(mut self, playback: Arc<PlaybackScheduler>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Local capture side, toggled by the relay
    #[must_use]
    pub fn capture(mut self, capture: Box<dyn CaptureControl>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Sender a local capture pipeline should push its frames into
    #[must_use]
    pub fn capture_frames(&self) -> mpsc::Sender<AudioFrame> {
        self.capture_tx.clone()
    }

    /// Called for every audio frame, in arrival order
    #[must_use]
    pub fn on_audio_chunk(mut self, cb: impl Fn(&AudioFrame) + Send + Sync + 'static) -> Self {
        self.callbacks.audio = Some(Box::new(cb));
        self
    }

    /// Called for interim and final transcripts
    #[must_use]
    pub fn on_transcript(mut self, cb: impl Fn(&Transcript) + Send + Sync + 'static) -> Self {
        self.callbacks.transcript = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn on_error(mut self, cb: impl Fn(&BridgeError) + Send + Sync + 'static) -> Self {
        self.callbacks.error = Some(Box::new(cb));
        self
    }

    /// Called once per completed request with the upstream response id
    #[must_use]
    pub fn on_response_complete(mut self, cb: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        self.callbacks.complete = Some(Box::new(cb));
        self
    }

    /// Start the client; it dials the relay immediately
    #[must_use]
    pub fn spawn(self) -> VoiceClient {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());

        let worker = ClientWorker {
            url: self.url,
            retry: self.retry,
            limiter: self.limiter,
            handshake_timeout: self.handshake_timeout,
            playback: self.playback,
            capture: self.capture,
            capture_rx: self.capture_rx,
            capturing: false,
            callbacks: self.callbacks,
            commands: commands_rx,
            status: status_tx,
            codec: FrameCodec::new(SessionId::from("pending"), self.wire_rate),
            connect_requested: false,
            voice: None,
        };
        tokio::spawn(worker.run());

        VoiceClient {
            commands: commands_tx,
            status: status_rx,
        }
    }
}

/// Handle to a running client
#[derive(Clone)]
pub struct VoiceClient {
    commands: mpsc::Sender<ClientCommand>,
    status: watch::Receiver<ClientStatus>,
}

impl VoiceClient {
    /// Start building a client for the relay at `url`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `url` is not a valid WebSocket URL
    pub fn builder(url: &str) -> Result<VoiceClientBuilder> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid relay url {url}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!("relay url must be ws:// or wss://, got {url}")));
        }
        let (capture_tx, capture_rx) = mpsc::channel(32);
        Ok(VoiceClientBuilder {
            url,
            retry: RetryPolicy::default(),
            limiter: ConnectLimiter::new(Duration::from_secs(1)),
            handshake_timeout: Duration::from_secs(10),
            wire_rate: WIRE_SAMPLE_RATE,
            playback: None,
            capture: None,
            capture_tx,
            capture_rx,
            callbacks: Callbacks::default(),
        })
    }

    /// Open the session and wait until it is ready
    ///
    /// # Errors
    ///
    /// Returns a transport error if the voice is unavailable, or `Error::Closed`
    /// if the client has shut down
    pub async fn connect(&self, voice: Option<&str>) -> Result<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Connect {
                voice: voice.map(str::to_string),
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?;

        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if let Some(err) = &current.error {
                    return Err(Error::Transport(err.message.clone()));
                }
                let voice_matches =
                    voice.is_none_or(|v| current.voice.as_deref() == Some(v));
                if current.state == SessionState::Ready && voice_matches {
                    if let Some(id) = &current.session_id {
                        return Ok(id.clone());
                    }
                }
            }
            status.changed().await.map_err(|_| Error::Closed)?;
        }
    }

    /// Speak `text` verbatim
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the session is not ready
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let state = self.status.borrow().state;
        if !matches!(state, SessionState::Ready | SessionState::Speaking) {
            return Err(Error::Protocol(format!("session is {state}, not ready")));
        }
        self.send(WsIncoming::SendText { text: text.into() }).await
    }

    /// Ask the relay to run capture whenever playback is idle
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is unreachable
    pub async fn start_capture(&self) -> Result<()> {
        self.send(WsIncoming::StartCapture).await
    }

    /// # Errors
    ///
    /// Returns an error if the relay is unreachable
    pub async fn stop_capture(&self) -> Result<()> {
        self.send(WsIncoming::StopCapture).await
    }

    /// Halt playback and drop queued requests
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is unreachable
    pub async fn interrupt(&self) -> Result<()> {
        self.send(WsIncoming::Interrupt).await
    }

    /// Halt playback and capture immediately
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is unreachable
    pub async fn stop(&self) -> Result<()> {
        self.send(WsIncoming::Stop).await
    }

    /// Latest status
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Close the socket and stop reconnecting
    pub async fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close).await;
    }

    async fn send(&self, msg: WsIncoming) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Send { msg, reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

struct ClientWorker {
    url: Url,
    retry: RetryPolicy,
    limiter: ConnectLimiter,
    handshake_timeout: Duration,
    playback: Option<Arc<PlaybackScheduler>>,
    capture: Option<Box<dyn CaptureControl>>,
    capture_rx: mpsc::Receiver<AudioFrame>,
    capturing: bool,
    callbacks: Callbacks,
    commands: mpsc::Receiver<ClientCommand>,
    status: watch::Sender<ClientStatus>,
    codec: FrameCodec,
    /// `connect` was called; replayed after every reconnect
    connect_requested: bool,
    voice: Option<String>,
}

impl ClientWorker {
    async fn run(mut self) {
        while let Some(socket) = self.dial().await {
            match self.session(socket).await {
                Exit::Closed => break,
                Exit::Lost => {
                    tracing::warn!(url = %self.url, "relay connection lost, reconnecting");
                    self.on_disconnect();
                }
            }
        }
        self.on_disconnect();
        tracing::info!(url = %self.url, "voice client stopped");
    }

    fn update(&self, f: impl FnOnce(&mut ClientStatus)) {
        self.status.send_modify(f);
    }

    fn report(&self, err: &BridgeError) {
        tracing::warn!(code = %err.code, message = %err.message, "voice error");
        if let Some(cb) = &self.callbacks.error {
            cb(err);
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        self.status.borrow().session_id.clone()
    }

    /// Open the socket, backing off between failures
    ///
    /// Returns `None` when the client is closed or retries are exhausted.
    async fn dial(&mut self) -> Option<Socket> {
        let mut attempt = 0;
        loop {
            self.limiter.acquire(LIMITER_KEY).await;
            tracing::debug!(url = %self.url, attempt, "dialing relay");

            let result = tokio::time::timeout(
                self.handshake_timeout,
                tokio_tungstenite::connect_async(self.url.as_str()),
            )
            .await;
            let err = match result {
                Ok(Ok((socket, _))) => {
                    tracing::info!(url = %self.url, "relay connected");
                    return Some(socket);
                }
                Ok(Err(e)) => Error::from(e),
                Err(_) => Error::Transport("relay handshake timed out".to_string()),
            };
            tracing::warn!(url = %self.url, attempt, error = %err, "relay connection failed");

            if self.retry.exhausted(attempt) {
                let err = BridgeError::voice_unavailable(err.to_string());
                self.report(&err);
                self.update(|s| {
                    s.state = SessionState::Error;
                    s.error = Some(err);
                });
                return None;
            }

            let delay = delay_for_attempt(&self.retry, attempt);
            attempt += 1;
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    cmd = self.commands.recv() => match cmd {
                        None | Some(ClientCommand::Close) => return None,
                        Some(cmd) => self.offline(cmd),
                    },
                }
            }
        }
    }

    /// Handle a command while no socket is open
    fn offline(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Connect { voice, reply } => {
                self.request_connect(voice);
                let _ = reply.send(());
            }
            ClientCommand::Send { reply, .. } => {
                let _ = reply.send(Err(Error::Transport("relay not connected".to_string())));
            }
            ClientCommand::Close => {}
        }
    }

    fn request_connect(&mut self, voice: Option<String>) {
        self.connect_requested = true;
        if voice.is_some() {
            self.voice = voice;
        }
        self.update(|s| {
            s.state = SessionState::Connecting;
            s.error = None;
        });
    }

    async fn session(&mut self, socket: Socket) -> Exit {
        let (mut sink, mut stream) = socket.split();
        self.update(|s| s.connected = true);

        if self.connect_requested {
            let replay = WsIncoming::Connect {
                voice: self.voice.clone(),
            };
            if send_json(&mut sink, &replay).await.is_err() {
                return Exit::Lost;
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(ClientCommand::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Exit::Closed;
                    }
                    Some(ClientCommand::Connect { voice, reply }) => {
                        self.request_connect(voice);
                        let msg = WsIncoming::Connect { voice: self.voice.clone() };
                        let sent = send_json(&mut sink, &msg).await;
                        let _ = reply.send(());
                        if sent.is_err() {
                            return Exit::Lost;
                        }
                    }
                    Some(ClientCommand::Send { msg, reply }) => {
                        self.apply_locally(&msg);
                        let sent = send_json(&mut sink, &msg).await;
                        let lost = sent.is_err();
                        let _ = reply.send(sent);
                        if lost {
                            return Exit::Lost;
                        }
                    }
                },
                Some(frame) = self.capture_rx.recv() => {
                    if self.capturing && Some(frame.session_id()) == self.session_id().as_ref() {
                        let data = frame.into_bytes().to_vec();
                        if sink.send(Message::Binary(data)).await.is_err() {
                            return Exit::Lost;
                        }
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_message(&text),
                    Some(Ok(Message::Binary(data))) => self.on_audio(Bytes::from(data)),
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "relay receive failed");
                        return Exit::Lost;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Local side effects that must not wait for the relay
    fn apply_locally(&mut self, msg: &WsIncoming) {
        match msg {
            WsIncoming::Interrupt => self.stop_playback(),
            WsIncoming::Stop => {
                self.stop_playback();
                self.pause_capture();
            }
            WsIncoming::StopCapture => self.pause_capture(),
            _ => {}
        }
    }

    fn on_disconnect(&mut self) {
        self.pause_capture();
        self.stop_playback();
        self.update(|s| {
            s.connected = false;
            if s.state != SessionState::Error {
                s.state = SessionState::Disconnected;
            }
        });
    }

    fn stop_playback(&self) {
        if let (Some(playback), Some(id)) = (&self.playback, self.session_id()) {
            playback.stop(&id);
        }
    }

    fn pause_capture(&mut self) {
        self.capturing = false;
        if let Some(capture) = self.capture.as_mut() {
            capture.pause();
        }
    }

    fn resume_capture(&mut self) {
        let Some(id) = self.session_id() else {
            return;
        };
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        match capture.resume(&id) {
            Ok(()) => self.capturing = true,
            Err(e) => {
                self.capturing = false;
                self.report(&BridgeError::capture_unavailable(e.to_string()));
            }
        }
    }

    fn on_message(&mut self, text: &str) {
        let msg: WsOutgoing = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparsable relay message");
                return;
            }
        };

        match msg {
            WsOutgoing::Ready { session_id, voice } => {
                tracing::info!(session_id = %session_id, voice = %voice, "session ready");
                self.codec.reset(session_id.clone());
                self.update(|s| {
                    s.state = SessionState::Ready;
                    s.session_id = Some(session_id);
                    s.voice = Some(voice);
                    s.error = None;
                });
            }
            WsOutgoing::State { session_id, state } => {
                tracing::debug!(session_id = %session_id, state = %state, "session state");
                if self.session_id().as_ref() != Some(&session_id) {
                    self.codec.reset(session_id.clone());
                }
                self.update(|s| {
                    s.state = state;
                    s.session_id = Some(session_id);
                });
            }
            WsOutgoing::Transcript {
                role,
                text,
                is_final,
            } => {
                if let Some(cb) = &self.callbacks.transcript {
                    let transcript = Transcript {
                        session_id: self.session_id().unwrap_or_else(|| SessionId::from("")),
                        role,
                        text,
                        is_final,
                    };
                    cb(&transcript);
                }
            }
            WsOutgoing::ResponseComplete { response_id } => {
                if let (Some(playback), Some(id)) = (&self.playback, self.session_id()) {
                    playback.request_pause(&id);
                }
                if let Some(cb) = &self.callbacks.complete {
                    cb(response_id.as_deref());
                }
            }
            WsOutgoing::CapturePaused => self.pause_capture(),
            WsOutgoing::CaptureResumed => self.resume_capture(),
            WsOutgoing::Error {
                kind,
                code,
                message,
            } => {
                let err = BridgeError::new(kind, code, message);
                self.report(&err);
                if err.code == "voice_unavailable" {
                    self.update(|s| s.error = Some(err));
                }
            }
            WsOutgoing::Pong => tracing::trace!("pong"),
        }
    }

    fn on_audio(&mut self, data: Bytes) {
        let Some(frame) = self.codec.stamp(data) else {
            return;
        };
        if let Some(playback) = &self.playback {
            let samples = self.codec.decode(&frame, playback.sample_rate());
            playback.enqueue(frame.session_id(), samples);
        }
        if let Some(cb) = &self.callbacks.audio {
            cb(&frame);
        }
    }
}

async fn send_json<S>(sink: &mut S, msg: &WsIncoming) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Role label used in console output
#[must_use]
pub const fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "voice",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn rejects_non_websocket_urls() {
        let err = VoiceClient::builder("http://localhost:1").err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(VoiceClient::builder("not a url").is_err());
        assert!(VoiceClient::builder("ws://127.0.0.1:18795/voice").is_ok());
    }

    #[test]
    fn status_starts_disconnected() {
        let status = ClientStatus::default();
        assert!(!status.connected);
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn unreachable_relay_reports_voice_unavailable() {
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let client = VoiceClient::builder("ws://127.0.0.1:9/voice")
            .unwrap()
            .retry(RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            })
            .limiter(ConnectLimiter::unlimited())
            .on_error(move |e| seen.lock().unwrap().push(e.code.clone()))
            .spawn();

        let err = client.connect(Some("alloy")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(errors.lock().unwrap().as_slice(), ["voice_unavailable"]);
    }
}
