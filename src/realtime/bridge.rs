//! Session/protocol bridge
//!
//! One actor task owns the session, the upstream link, the device arbiter, and every
//! protocol timer. Callers talk to it through a [`BridgeHandle`]; upstream messages,
//! timer expiries, and capture frames arrive on channels drained by the same loop, so
//! session state is never touched from two places at once.
//!
//! Text-to-speech requests run one at a time:
//!
//! ```text
//! Ready ─ send_text ─▶ Speaking: pause capture, create item ─(generate delay)─▶ generate response
//!   ▲                                                                              │
//!   └──────────── response complete (capture resumes after the settle delay) ◀───┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::limiter::ConnectLimiter;
use super::protocol::{ClientEvent, ErrorBody, ServerEvent};
use super::retry::{RetryPolicy, delay_for_attempt, is_recoverable};
use super::session::{Session, SessionId, SessionInfo};
use super::state::SessionState;
use super::upstream::{Connector, UpstreamLink, WireMessage};
use crate::config::Config;
use crate::voice::{
    AudioFrame, CaptureControl, DeviceSide, FrameCodec, PlaybackScheduler, ResourceArbiter,
    WIRE_SAMPLE_RATE,
};
use crate::{BridgeError, Error, Result};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 512;

/// Bridge tuning
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Voice used when `connect` names none
    pub voice: String,
    pub instructions: Option<String>,
    pub wire_rate: u32,
    pub generate_delay: Duration,
    pub ack_timeout: Duration,
    pub settle: Duration,
    pub idle_timeout: Duration,
    pub reconnect: RetryPolicy,
    pub capture_queue: usize,
    /// Rate-limiter key identifying this logical client
    pub client_key: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            voice: crate::config::DEFAULT_VOICE.to_string(),
            instructions: None,
            wire_rate: WIRE_SAMPLE_RATE,
            generate_delay: Duration::from_millis(300),
            ack_timeout: Duration::from_secs(3),
            settle: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(300),
            reconnect: RetryPolicy::default(),
            capture_queue: 32,
            client_key: "local".to_string(),
        }
    }
}

impl BridgeSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice: config.upstream.voice.clone(),
            instructions: config.upstream.instructions.clone(),
            wire_rate: config.audio.wire_sample_rate,
            generate_delay: config.timing.generate_delay,
            ack_timeout: config.timing.ack_timeout,
            settle: config.timing.settle,
            idle_timeout: config.timing.idle_timeout,
            reconnect: config.reconnect.clone(),
            capture_queue: config.audio.capture_queue,
            client_key: "local".to_string(),
        }
    }
}

/// Who is speaking in a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Interim or final transcript text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: SessionId,
    pub role: Role,
    pub text: String,
    pub is_final: bool,
}

/// Notifications published by the bridge
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    /// Session configured and accepting requests
    Ready {
        session_id: SessionId,
        voice: String,
    },
    /// One upstream audio frame, in arrival order
    AudioChunk(AudioFrame),
    Transcript(Transcript),
    /// Fired exactly once per completed request
    ResponseComplete {
        session_id: SessionId,
        response_id: Option<String>,
    },
    Error(BridgeError),
    CapturePaused,
    CaptureResumed,
}

enum Command {
    Connect {
        voice: Option<String>,
        reply: oneshot::Sender<Result<SessionInfo>>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StartCapture {
        reply: oneshot::Sender<Result<()>>,
    },
    StopCapture,
    Interrupt,
    Stop,
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    /// Configuration acknowledgement deadline
    Ack,
    /// Create-item to generate-response delay
    Generate,
    /// Device release before capture resumes
    Settle,
    Reconnect,
    Idle,
}

enum Internal {
    Connected {
        attempt: u64,
        result: Result<UpstreamLink>,
    },
    Inbound {
        link: u64,
        msg: WireMessage,
    },
    LinkClosed {
        link: u64,
    },
    Timer {
        kind: TimerKind,
        token: u64,
    },
}

struct Link {
    id: u64,
    outbound: mpsc::Sender<WireMessage>,
    reader: JoinHandle<()>,
}

/// Caller side of a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<BridgeEvent>,
    capture: mpsc::Sender<AudioFrame>,
}

impl BridgeHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    async fn notify(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| Error::Closed)
    }

    /// Open (or reuse) the upstream session and wait until it is ready
    ///
    /// A different `voice` tears down the current connection and starts a new session.
    ///
    /// # Errors
    ///
    /// Returns a transport error if reconnect attempts are exhausted, or
    /// `Error::Closed` if the bridge has shut down
    pub async fn connect(&self, voice: Option<&str>) -> Result<SessionInfo> {
        let voice = voice.map(str::to_string);
        self.request(|reply| Command::Connect { voice, reply }).await?
    }

    /// Queue `text` to be spoken verbatim
    ///
    /// Returns once queued; completion is reported by `ResponseComplete`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` if the bridge has shut down
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await?
    }

    /// Enable capture; it runs whenever playback does not hold the device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no capture side is available
    pub async fn start_capture(&self) -> Result<()> {
        self.request(|reply| Command::StartCapture { reply }).await?
    }

    /// Disable capture
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` if the bridge has shut down
    pub async fn stop_capture(&self) -> Result<()> {
        self.notify(Command::StopCapture).await
    }

    /// Halt playback, cancel the in-flight response, and drop queued requests
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` if the bridge has shut down
    pub async fn interrupt(&self) -> Result<()> {
        self.notify(Command::Interrupt).await
    }

    /// [`interrupt`](Self::interrupt) and disable capture
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` if the bridge has shut down
    pub async fn stop(&self) -> Result<()> {
        self.notify(Command::Stop).await
    }

    /// Snapshot of the current session
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` if the bridge has shut down
    pub async fn info(&self) -> Result<SessionInfo> {
        self.request(|reply| Command::Info { reply }).await
    }

    /// Close the session and stop the bridge
    pub async fn close(&self) {
        let _ = self.notify(Command::Close).await;
    }

    /// Receive bridge events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Queue that capture frames are pushed into
    #[must_use]
    pub fn capture_sink(&self) -> mpsc::Sender<AudioFrame> {
        self.capture.clone()
    }
}

/// Builds and spawns a bridge actor
pub struct BridgeBuilder {
    settings: BridgeSettings,
    connector: Arc<dyn Connector>,
    limiter: Option<ConnectLimiter>,
    playback: Option<Arc<PlaybackScheduler>>,
    capture: Option<Box<dyn CaptureControl>>,
    capture_tx: mpsc::Sender<AudioFrame>,
    capture_rx: mpsc::Receiver<AudioFrame>,
}

impl BridgeBuilder {
    /// Throttle connection attempts
    #[must_use]
    pub fn limiter(mut self, limiter: ConnectLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Render upstream audio locally
    #[must_use]
    pub fn playback(mut self, playback: Arc<PlaybackScheduler>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Capture side driven by the arbiter
    #[must_use]
    pub fn capture(mut self, capture: Box<dyn CaptureControl>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Sender a capture pipeline should push its frames into
    #[must_use]
    pub fn capture_frames(&self) -> mpsc::Sender<AudioFrame> {
        self.capture_tx.clone()
    }

    /// Start the actor
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> BridgeHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let session = Session::new(self.settings.voice.clone());
        let codec = FrameCodec::new(session.id().clone(), self.settings.wire_rate);

        let bridge = Bridge {
            connector: self.connector,
            limiter: self.limiter,
            playback: self.playback,
            capture: self.capture,
            capture_rx: self.capture_rx,
            commands: commands_rx,
            internal_tx,
            internal_rx,
            events: events.clone(),
            session,
            codec,
            arbiter: ResourceArbiter::new(),
            link: None,
            next_link: 0,
            connecting: None,
            connect_task: None,
            next_attempt: 0,
            waiters: Vec::new(),
            retry_attempt: 0,
            timers: HashMap::new(),
            next_token: 0,
            response_requested: false,
            current_response: None,
            cancelled: None,
            discard_audio: false,
            abandoned: HashSet::new(),
            abandon_unseen: false,
            responses_completed: 0,
            settings: self.settings,
        };
        tokio::spawn(bridge.run());

        BridgeHandle {
            commands: commands_tx,
            events,
            capture: self.capture_tx,
        }
    }
}

/// The bridge actor
pub struct Bridge {
    settings: BridgeSettings,
    connector: Arc<dyn Connector>,
    limiter: Option<ConnectLimiter>,
    playback: Option<Arc<PlaybackScheduler>>,
    capture: Option<Box<dyn CaptureControl>>,
    capture_rx: mpsc::Receiver<AudioFrame>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<BridgeEvent>,

    session: Session,
    codec: FrameCodec,
    arbiter: ResourceArbiter,

    link: Option<Link>,
    next_link: u64,
    /// Attempt id of the single connection attempt allowed in flight
    connecting: Option<u64>,
    connect_task: Option<JoinHandle<()>>,
    next_attempt: u64,
    waiters: Vec<oneshot::Sender<Result<SessionInfo>>>,
    retry_attempt: u32,

    timers: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_token: u64,

    /// "generate response" sent for the in-flight request
    response_requested: bool,
    current_response: Option<String>,
    /// A cancel is outstanding; the inner id is filled once the response is known
    cancelled: Option<Option<String>>,
    discard_audio: bool,
    /// Responses still running upstream after their request was released
    abandoned: HashSet<String>,
    /// An abandoned response has not been announced yet
    abandon_unseen: bool,
    responses_completed: u64,
}

impl Bridge {
    /// Start building a bridge over `connector`
    #[must_use]
    pub fn builder(settings: BridgeSettings, connector: Arc<dyn Connector>) -> BridgeBuilder {
        let (capture_tx, capture_rx) = mpsc::channel(settings.capture_queue.max(1));
        BridgeBuilder {
            settings,
            connector,
            limiter: None,
            playback: None,
            capture: None,
            capture_tx,
            capture_rx,
        }
    }

    async fn run(mut self) {
        tracing::info!(
            session_id = %self.session.id(),
            voice = self.session.voice(),
            "bridge started"
        );

        loop {
            tokio::select! {
                biased;
                Some(event) = self.internal_rx.recv() => self.on_internal(event).await,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if !self.on_command(command).await {
                        break;
                    }
                }
                Some(frame) = self.capture_rx.recv() => self.on_capture_frame(frame),
            }
        }

        tracing::info!(session_id = %self.session.id(), "bridge stopped");
    }

    // -- plumbing -------------------------------------------------------------

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: BridgeError) {
        tracing::warn!(
            session_id = %self.session.id(),
            state = %self.session.state(),
            code = %err.code,
            message = %err.message,
            "session error"
        );
        self.emit(BridgeEvent::Error(err));
    }

    fn set_state(&mut self, next: SessionState) {
        match self.session.transition(next) {
            Ok(previous) if previous != next => {
                self.emit(BridgeEvent::StateChanged {
                    session_id: self.session.id().clone(),
                    state: next,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %self.session.id(),
                    state = %self.session.state(),
                    error = %e,
                    "rejected state change"
                );
            }
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        self.cancel_timer(kind);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Internal::Timer { kind, token });
        });
        self.timers.insert(kind, (token, handle));
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&kind) {
            handle.abort();
        }
    }

    /// Whether a fired timer is still the armed one
    fn take_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        match self.timers.get(&kind) {
            Some((armed, _)) if *armed == token => {
                self.timers.remove(&kind);
                true
            }
            _ => false,
        }
    }

    async fn send_control(&mut self, event: ClientEvent) -> bool {
        let Some(outbound) = self.link.as_ref().map(|l| l.outbound.clone()) else {
            return false;
        };
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode control message");
                return false;
            }
        };
        tracing::debug!(
            session_id = %self.session.id(),
            kind = ?event.control_kind(),
            "sending control message"
        );
        if outbound.send(WireMessage::Text(text)).await.is_err() {
            self.on_transport_failure(Error::Transport("upstream connection closed".to_string()));
            return false;
        }
        self.session.touch();
        true
    }

    // -- connection lifecycle -------------------------------------------------

    fn ensure_connected(&mut self) {
        if self.link.is_some() || self.connecting.is_some() || self.session.state().is_terminal() {
            return;
        }
        self.cancel_timer(TimerKind::Reconnect);
        self.set_state(SessionState::Connecting);

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.connecting = Some(attempt);

        let connector = Arc::clone(&self.connector);
        let limiter = self.limiter.clone();
        let key = self.settings.client_key.clone();
        let voice = self.session.voice().to_string();
        let tx = self.internal_tx.clone();
        tracing::debug!(session_id = %self.session.id(), attempt, "connection attempt");

        self.connect_task = Some(tokio::spawn(async move {
            if let Some(limiter) = limiter {
                limiter.acquire(&key).await;
            }
            let result = connector.connect(&voice).await;
            let _ = tx.send(Internal::Connected { attempt, result });
        }));
    }

    async fn on_connected(&mut self, attempt: u64, result: Result<UpstreamLink>) {
        if self.connecting != Some(attempt) {
            tracing::debug!(attempt, "discarding stale connection attempt");
            return;
        }
        self.connecting = None;
        self.connect_task = None;

        match result {
            Ok(link) => self.attach(link).await,
            Err(e) => self.on_transport_failure(e),
        }
    }

    async fn attach(&mut self, link: UpstreamLink) {
        self.next_link += 1;
        let id = self.next_link;
        let UpstreamLink {
            outbound,
            mut inbound,
        } = link;

        let tx = self.internal_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if tx.send(Internal::Inbound { link: id, msg }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Internal::LinkClosed { link: id });
        });
        self.link = Some(Link {
            id,
            outbound,
            reader,
        });

        self.set_state(SessionState::Configuring);
        let update = ClientEvent::session_update(
            self.session.voice(),
            self.settings.instructions.clone(),
        );
        if self.send_control(update).await {
            self.arm_timer(TimerKind::Ack, self.settings.ack_timeout);
        }
    }

    fn teardown_link(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.connecting = None;
        if let Some(link) = self.link.take() {
            link.reader.abort();
            tracing::debug!(session_id = %self.session.id(), link = link.id, "upstream link closed");
        }
    }

    async fn on_configured(&mut self, acknowledged: bool) {
        self.cancel_timer(TimerKind::Ack);
        if acknowledged {
            tracing::debug!(session_id = %self.session.id(), "configuration acknowledged");
        } else {
            tracing::warn!(
                session_id = %self.session.id(),
                "no configuration acknowledgement, assuming configured"
            );
        }

        self.set_state(SessionState::Ready);
        self.retry_attempt = 0;
        self.session.touch();
        self.emit(BridgeEvent::Ready {
            session_id: self.session.id().clone(),
            voice: self.session.voice().to_string(),
        });
        tracing::info!(
            session_id = %self.session.id(),
            voice = self.session.voice(),
            "session ready"
        );

        let info = self.session.info();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(info.clone()));
        }

        if self.arbiter.holder().is_none() {
            self.arbiter.settle();
            let _ = self.resume_capture();
        }
        self.arm_timer(TimerKind::Idle, self.settings.idle_timeout);
        self.pump().await;
    }

    fn on_transport_failure(&mut self, err: Error) {
        tracing::warn!(
            session_id = %self.session.id(),
            state = %self.session.state(),
            error = %err,
            "upstream transport failure"
        );

        self.teardown_link();
        for kind in [TimerKind::Ack, TimerKind::Generate, TimerKind::Settle] {
            self.cancel_timer(kind);
        }

        if self.session.pending_request() {
            self.session.finish_request();
            self.report(BridgeError::request_aborted(
                "connection lost during a request; retry it",
            ));
        }
        self.forget_responses();

        self.stop_playback();
        self.arbiter.release_playback();
        if self.arbiter.capture_active() {
            self.pause_capture();
            self.arbiter.release_capture();
        }
        self.set_state(SessionState::Disconnected);

        if !is_recoverable(&err) || self.settings.reconnect.exhausted(self.retry_attempt) {
            self.give_up(&err);
            return;
        }

        let delay = delay_for_attempt(&self.settings.reconnect, self.retry_attempt);
        self.retry_attempt += 1;
        tracing::info!(
            session_id = %self.session.id(),
            attempt = self.retry_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        self.arm_timer(TimerKind::Reconnect, delay);
    }

    fn give_up(&mut self, err: &Error) {
        self.retry_attempt = 0;
        self.set_state(SessionState::Error);
        let dropped = self.session.clear_queue();
        if dropped > 0 {
            tracing::warn!(session_id = %self.session.id(), dropped, "dropping queued requests");
        }
        self.report(BridgeError::voice_unavailable(err.to_string()));
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Transport(format!("voice unavailable: {err}"))));
        }
    }

    /// Start a fresh session, carrying queued requests over
    fn replace_session(&mut self, voice: String) {
        let queued = self.session.take_queue();
        let mut session = Session::new(voice);
        for text in queued {
            session.enqueue(text);
        }
        tracing::info!(
            old_session_id = %self.session.id(),
            session_id = %session.id(),
            voice = session.voice(),
            "session replaced"
        );
        self.session = session;
        self.codec.reset(self.session.id().clone());
        self.forget_responses();
        self.responses_completed = 0;
        self.emit(BridgeEvent::StateChanged {
            session_id: self.session.id().clone(),
            state: self.session.state(),
        });
    }

    /// Tear everything down and report the session as disconnected
    fn release_session(&mut self) {
        self.teardown_link();
        for kind in [
            TimerKind::Ack,
            TimerKind::Generate,
            TimerKind::Settle,
            TimerKind::Reconnect,
            TimerKind::Idle,
        ] {
            self.cancel_timer(kind);
        }
        if self.session.pending_request() {
            self.session.finish_request();
            self.report(BridgeError::request_aborted("session replaced during a request"));
        }
        self.stop_playback();
        self.arbiter.release_playback();
        if self.arbiter.capture_active() {
            self.pause_capture();
            self.arbiter.release_capture();
        }
        self.set_state(SessionState::Disconnected);
    }

    fn check_idle(&mut self) {
        if self.link.is_none() {
            return;
        }
        let timeout = self.settings.idle_timeout;
        let idle = self.session.idle_for(Instant::now());
        let busy = self.session.pending_request()
            || self.session.queued() > 0
            || self.arbiter.holder().is_some();

        if busy {
            self.arm_timer(TimerKind::Idle, timeout);
        } else if idle >= timeout {
            tracing::info!(
                session_id = %self.session.id(),
                idle_secs = idle.as_secs(),
                "idle timeout, destroying session"
            );
            self.release_session();
            let voice = self.session.voice().to_string();
            self.replace_session(voice);
        } else {
            self.arm_timer(
                TimerKind::Idle,
                (timeout - idle).max(Duration::from_millis(1)),
            );
        }
    }

    fn shutdown(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
        self.teardown_link();
        self.stop_playback();
        if self.arbiter.capture_active() {
            if let Some(capture) = self.capture.as_mut() {
                capture.pause();
            }
        }
        self.set_state(SessionState::Closed);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Closed));
        }
    }

    // -- requests -------------------------------------------------------------

    fn reset_response_tracking(&mut self) {
        self.response_requested = false;
        self.current_response = None;
        self.cancelled = None;
        self.discard_audio = false;
    }

    fn forget_responses(&mut self) {
        self.reset_response_tracking();
        self.abandoned.clear();
        self.abandon_unseen = false;
    }

    /// Whether a completion belongs to the request in flight
    ///
    /// Nothing completes a request before its "generate response" went out, and a
    /// known response id must match.
    fn owns_response(&self, response_id: Option<&str>) -> bool {
        if !self.session.pending_request() || !self.response_requested {
            return false;
        }
        match (self.current_response.as_deref(), response_id) {
            (Some(current), Some(id)) => current == id,
            _ => true,
        }
    }

    /// Start the next queued request if the session is free
    async fn pump(&mut self) {
        if self.link.is_none() {
            return;
        }
        let Some(text) = self.session.begin_request() else {
            return;
        };

        self.set_state(SessionState::Speaking);
        if self.arbiter.claim_playback() {
            self.pause_capture();
        }
        self.cancel_timer(TimerKind::Settle);
        if self.responses_completed > 0 {
            if let Some(playback) = &self.playback {
                playback.request_pause(self.session.id());
            }
        }
        self.response_requested = false;

        tracing::debug!(
            session_id = %self.session.id(),
            chars = text.chars().count(),
            queued = self.session.queued(),
            "request started"
        );
        if self.send_control(ClientEvent::verbatim_item(&text)).await {
            self.arm_timer(TimerKind::Generate, self.settings.generate_delay);
        }
    }

    async fn on_response_done(&mut self, response_id: Option<String>) {
        if !self.owns_response(response_id.as_deref()) {
            tracing::debug!(
                session_id = %self.session.id(),
                response_id = ?response_id,
                pending = self.session.pending_request(),
                "response complete outside the request in flight"
            );
            // Unrequested replies (server-side turn detection) still hand the device back
            self.settle_if_idle();
            return;
        }

        self.cancel_timer(TimerKind::Generate);
        self.reset_response_tracking();
        self.session.finish_request();
        self.set_state(SessionState::Ready);
        self.responses_completed += 1;
        self.emit(BridgeEvent::ResponseComplete {
            session_id: self.session.id().clone(),
            response_id,
        });

        if self.arbiter.playback_active() {
            let delay = self.settle_delay();
            self.arm_timer(TimerKind::Settle, delay);
        }
        self.pump().await;
    }

    /// Schedule the device handback once no request needs playback
    fn settle_if_idle(&mut self) {
        if !self.session.pending_request() && self.arbiter.playback_active() {
            let delay = self.settle_delay();
            self.arm_timer(TimerKind::Settle, delay);
        }
    }

    /// Settle delay, extended by whatever local audio is still scheduled
    fn settle_delay(&self) -> Duration {
        let remaining = self
            .playback
            .as_ref()
            .map_or(Duration::ZERO, |p| p.remaining(self.session.id()));
        self.settings.settle + remaining
    }

    async fn on_upstream_error(&mut self, error: ErrorBody) {
        tracing::warn!(
            session_id = %self.session.id(),
            state = %self.session.state(),
            code = ?error.code,
            message = %error.message,
            "upstream reported error"
        );
        self.cancelled = None;
        self.discard_audio = false;
        self.report(BridgeError::upstream(error.message));

        if self.session.state() == SessionState::Speaking {
            self.cancel_timer(TimerKind::Generate);
            self.session.finish_request();
            if self.response_requested {
                // The response may keep running; its late completion is not ours
                match self.current_response.take() {
                    Some(id) => {
                        self.abandoned.insert(id);
                    }
                    None => self.abandon_unseen = true,
                }
            }
            self.response_requested = false;
            self.current_response = None;
            self.set_state(SessionState::Ready);
            if self.arbiter.playback_active() {
                let delay = self.settle_delay();
                self.arm_timer(TimerKind::Settle, delay);
            }
            self.pump().await;
        }
    }

    async fn interrupt(&mut self) {
        self.cancel_timer(TimerKind::Generate);
        let dropped = self.session.clear_queue();

        let mut cancel = false;
        if self.session.pending_request() {
            cancel = self.response_requested;
            if cancel {
                self.cancelled = Some(self.current_response.take());
                self.discard_audio = true;
            }
            self.session.finish_request();
            self.response_requested = false;
            if self.session.state() == SessionState::Speaking {
                self.set_state(SessionState::Ready);
            }
        }

        self.stop_playback();
        if self.arbiter.playback_active() {
            self.arm_timer(TimerKind::Settle, self.settings.settle);
        }
        tracing::info!(session_id = %self.session.id(), dropped, cancel, "interrupted");

        if cancel {
            self.send_control(ClientEvent::ResponseCancel).await;
        }
    }

    // -- audio ----------------------------------------------------------------

    fn stop_playback(&self) {
        if let Some(playback) = &self.playback {
            playback.stop(self.session.id());
        }
    }

    fn on_audio(&mut self, data: Bytes) {
        if self.discard_audio {
            tracing::trace!(session_id = %self.session.id(), "discarding cancelled audio");
            return;
        }
        if !self.session.state().is_connected() {
            return;
        }
        let Some(frame) = self.codec.stamp(data) else {
            return;
        };

        if self.arbiter.holder() != Some(DeviceSide::Playback) && self.arbiter.claim_playback() {
            self.pause_capture();
        }
        self.cancel_timer(TimerKind::Settle);

        if let Some(playback) = &self.playback {
            let samples = self.codec.decode(&frame, playback.sample_rate());
            playback.enqueue(self.session.id(), samples);
        }
        tracing::trace!(
            session_id = %self.session.id(),
            sequence = frame.sequence(),
            bytes = frame.data().len(),
            "audio frame"
        );
        self.emit(BridgeEvent::AudioChunk(frame));
    }

    /// Stop the capture side and drop anything it already queued
    fn pause_capture(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.pause();
        }
        let mut dropped = 0usize;
        while self.capture_rx.try_recv().is_ok() {
            dropped += 1;
        }
        tracing::debug!(session_id = %self.session.id(), dropped, "capture paused");
        self.emit(BridgeEvent::CapturePaused);
    }

    fn resume_capture(&mut self) -> Result<()> {
        if self.capture.is_none() || !self.arbiter.acquire_capture() {
            return Ok(());
        }
        let result = match self.capture.as_mut() {
            Some(capture) => capture.resume(self.session.id()),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                tracing::debug!(session_id = %self.session.id(), "capture resumed");
                self.emit(BridgeEvent::CaptureResumed);
                Ok(())
            }
            Err(e) => {
                self.arbiter.release_capture();
                self.arbiter.set_capture_enabled(false);
                self.report(BridgeError::capture_unavailable(e.to_string()));
                Err(e)
            }
        }
    }

    fn start_capture(&mut self) -> Result<()> {
        if self.capture.is_none() {
            let err = Error::Device("no capture device configured".to_string());
            self.report(BridgeError::capture_unavailable(err.to_string()));
            return Err(err);
        }
        self.arbiter.set_capture_enabled(true);

        match self.arbiter.holder() {
            Some(DeviceSide::Capture) => Ok(()),
            Some(DeviceSide::Playback) => {
                self.arbiter.defer_capture();
                Ok(())
            }
            None if self.link.is_some()
                && matches!(
                    self.session.state(),
                    SessionState::Ready | SessionState::Speaking
                ) =>
            {
                self.resume_capture()
            }
            None => {
                if self.session.state() == SessionState::Error {
                    self.retry_attempt = 0;
                }
                // Capture starts once the session is ready
                self.ensure_connected();
                Ok(())
            }
        }
    }

    fn stop_capture(&mut self) {
        self.arbiter.set_capture_enabled(false);
        if self.arbiter.capture_active() {
            self.pause_capture();
            self.arbiter.release_capture();
        }
    }

    fn on_capture_frame(&mut self, frame: AudioFrame) {
        if !self.arbiter.capture_active()
            || !self.session.state().is_connected()
            || frame.session_id() != self.session.id()
        {
            tracing::trace!(sequence = frame.sequence(), "dropping capture frame");
            return;
        }
        let Some(link) = &self.link else {
            return;
        };
        match link.outbound.try_send(WireMessage::Binary(frame.into_bytes())) {
            Ok(()) => self.session.touch(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.session.id(), "upstream busy, dropping capture frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // -- dispatch -------------------------------------------------------------

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Connected { attempt, result } => self.on_connected(attempt, result).await,
            Internal::Inbound { link, msg } => self.on_inbound(link, msg).await,
            Internal::LinkClosed { link } => {
                if self.link.as_ref().is_some_and(|l| l.id == link) {
                    self.on_transport_failure(Error::Transport(
                        "upstream connection lost".to_string(),
                    ));
                }
            }
            Internal::Timer { kind, token } => {
                if self.take_timer(kind, token) {
                    self.on_timer(kind).await;
                }
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Ack => {
                if self.session.state() == SessionState::Configuring {
                    self.on_configured(false).await;
                }
            }
            TimerKind::Generate => {
                if self.session.state() == SessionState::Speaking
                    && self.session.pending_request()
                    && self.send_control(ClientEvent::generate_response()).await
                {
                    self.response_requested = true;
                }
            }
            TimerKind::Settle => {
                self.arbiter.release_playback();
                if self.arbiter.settle() {
                    let _ = self.resume_capture();
                }
            }
            TimerKind::Reconnect => self.ensure_connected(),
            TimerKind::Idle => self.check_idle(),
        }
    }

    async fn on_inbound(&mut self, link: u64, msg: WireMessage) {
        if self.link.as_ref().map(|l| l.id) != Some(link) {
            return;
        }
        self.session.touch();

        match msg {
            WireMessage::Binary(data) => self.on_audio(data),
            WireMessage::Text(text) => match ServerEvent::parse(&text) {
                Ok(event) => self.on_server_event(event).await,
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session.id(),
                        state = %self.session.state(),
                        error = %e,
                        "ignoring unparsable upstream message"
                    );
                }
            },
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session } => {
                tracing::debug!(upstream_id = ?session.id, "upstream session created");
                self.session.set_upstream_id(session.id);
            }
            ServerEvent::SessionUpdated { .. } => {
                if self.session.state() == SessionState::Configuring {
                    self.on_configured(true).await;
                }
            }
            ServerEvent::ItemCreated { item } => {
                tracing::debug!(item_id = ?item.id, "content item created");
            }
            ServerEvent::ResponseCreated { response } => {
                if matches!(self.cancelled, Some(None)) {
                    self.cancelled = Some(response.id);
                } else if self.abandon_unseen {
                    self.abandon_unseen = false;
                    if let Some(id) = response.id {
                        self.abandoned.insert(id);
                    }
                } else {
                    self.current_response = response.id;
                }
            }
            ServerEvent::AudioDelta { delta } => match BASE64.decode(delta.as_bytes()) {
                Ok(bytes) => self.on_audio(Bytes::from(bytes)),
                Err(e) => {
                    tracing::warn!(session_id = %self.session.id(), error = %e, "invalid audio delta");
                }
            },
            ServerEvent::TranscriptDelta { delta } => {
                if !self.discard_audio {
                    self.emit_transcript(Role::Assistant, delta, false);
                }
            }
            ServerEvent::TranscriptDone { transcript } => {
                if !self.discard_audio {
                    self.emit_transcript(Role::Assistant, transcript, true);
                }
            }
            ServerEvent::InputTranscript { transcript } => {
                self.emit_transcript(Role::User, transcript, true);
            }
            ServerEvent::ResponseDone { response } => {
                let swallow = self.cancelled.as_ref().is_some_and(|id| {
                    id.is_none() || *id == response.id || response.is_cancelled()
                });
                let abandoned = response
                    .id
                    .as_ref()
                    .is_some_and(|id| self.abandoned.remove(id));
                if swallow {
                    tracing::debug!(response_id = ?response.id, "cancelled response finished");
                    self.cancelled = None;
                    self.discard_audio = false;
                    self.pump().await;
                } else if abandoned {
                    tracing::debug!(response_id = ?response.id, "abandoned response finished");
                    self.settle_if_idle();
                } else {
                    self.on_response_done(response.id).await;
                }
            }
            ServerEvent::Error { error } => self.on_upstream_error(error).await,
            ServerEvent::Unknown => {
                tracing::debug!(session_id = %self.session.id(), "ignoring unrecognised upstream message");
            }
        }
    }

    fn emit_transcript(&self, role: Role, text: String, is_final: bool) {
        self.emit(BridgeEvent::Transcript(Transcript {
            session_id: self.session.id().clone(),
            role,
            text,
            is_final,
        }));
    }

    /// Returns `false` once the actor should exit
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { voice, reply } => self.on_connect(voice, reply),
            Command::SendText { text, reply } => {
                let result = self.on_send_text(text);
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued {
                    if self.link.is_some() {
                        self.pump().await;
                    } else {
                        self.ensure_connected();
                    }
                }
            }
            Command::StartCapture { reply } => {
                let _ = reply.send(self.start_capture());
            }
            Command::StopCapture => self.stop_capture(),
            Command::Interrupt => self.interrupt().await,
            Command::Stop => {
                self.interrupt().await;
                self.stop_capture();
            }
            Command::Info { reply } => {
                let _ = reply.send(self.session.info());
            }
            Command::Close => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn on_connect(&mut self, voice: Option<String>, reply: oneshot::Sender<Result<SessionInfo>>) {
        if self.session.state().is_terminal() {
            let _ = reply.send(Err(Error::Closed));
            return;
        }

        if let Some(voice) = voice.filter(|v| v != self.session.voice()) {
            tracing::info!(
                session_id = %self.session.id(),
                from = self.session.voice(),
                to = %voice,
                "voice changed"
            );
            self.release_session();
            self.replace_session(voice);
        }

        match self.session.state() {
            SessionState::Ready | SessionState::Speaking => {
                let _ = reply.send(Ok(self.session.info()));
            }
            state => {
                if state == SessionState::Error {
                    self.retry_attempt = 0;
                }
                self.waiters.push(reply);
                self.ensure_connected();
            }
        }
    }

    fn on_send_text(&mut self, text: String) -> Result<()> {
        if self.session.state().is_terminal() {
            return Err(Error::Closed);
        }
        if text.trim().is_empty() {
            tracing::debug!(session_id = %self.session.id(), "ignoring empty request");
            return Ok(());
        }
        if self.session.pending_request() {
            tracing::debug!(
                session_id = %self.session.id(),
                queued = self.session.queued() + 1,
                "request queued behind in-flight response"
            );
        }
        if self.session.state() == SessionState::Error {
            self.retry_attempt = 0;
        }
        self.session.enqueue(text);
        self.session.touch();
        Ok(())
    }
}
