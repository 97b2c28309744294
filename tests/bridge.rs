//! Bridge behaviour against a scripted upstream

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::{
    FakeConnector, FakeUpstream, RecordingCapture, RecordingSink, Toggle, drain, test_settings,
    wait_for,
};
use voice_relay::realtime::{ConnectLimiter, Role, SessionInfo, VERBATIM_PREAMBLE, WireMessage};
use voice_relay::voice::{AudioFrame, PlaybackScheduler, SchedulerConfig};
use voice_relay::{Bridge, BridgeEvent, BridgeHandle, BridgeSettings, ErrorKind, SessionState};

struct Harness {
    bridge: BridgeHandle,
    connector: Arc<FakeConnector>,
    links: mpsc::UnboundedReceiver<FakeUpstream>,
}

impl Harness {
    fn new(settings: BridgeSettings) -> Self {
        let (connector, links) = FakeConnector::new();
        let bridge = Bridge::builder(settings, connector.clone()).spawn();
        Self {
            bridge,
            connector,
            links,
        }
    }

    fn with_capture(settings: BridgeSettings, capture: RecordingCapture) -> Self {
        let (connector, links) = FakeConnector::new();
        let bridge = Bridge::builder(settings, connector.clone())
            .capture(Box::new(capture))
            .spawn();
        Self {
            bridge,
            connector,
            links,
        }
    }

    /// Connect with `voice`, acknowledging the configuration
    async fn connect(&mut self, voice: &str) -> (FakeUpstream, SessionInfo) {
        let bridge = self.bridge.clone();
        let voice_name = voice.to_string();
        let pending = tokio::spawn(async move { bridge.connect(Some(&voice_name)).await });

        let mut upstream = self.links.recv().await.expect("no connection attempt");
        assert_eq!(upstream.voice, voice);
        let update = upstream.accept().await;
        assert_eq!(update["session"]["voice"], voice);

        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.state, SessionState::Ready);
        (upstream, info)
    }
}

fn item_text(event: &serde_json::Value) -> &str {
    assert_eq!(event["type"], "conversation.item.create");
    event["item"]["content"][0]["text"].as_str().unwrap()
}

fn is_error(event: &BridgeEvent, code: &str) -> bool {
    matches!(event, BridgeEvent::Error(e) if e.code == code)
}

#[tokio::test(start_paused = true)]
async fn test_speaks_text_verbatim() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, info) = h.connect("A").await;

    h.bridge.send_text("Hello world").await.unwrap();

    let item = up.next_event().await;
    let created_at = Instant::now();
    let text = item_text(&item);
    assert!(text.starts_with(VERBATIM_PREAMBLE));
    assert!(text.ends_with("Hello world"));
    assert_eq!(item["item"]["role"], "user");

    let generate = up.next_event().await;
    assert_eq!(generate["type"], "response.create");
    assert!(created_at.elapsed() >= Duration::from_millis(300));

    for chunk in [[1u8, 0, 2, 0], [3, 0, 4, 0], [5, 0, 6, 0]] {
        up.send_audio(&chunk).await;
    }
    up.finish_response("resp_1").await;

    let mut sequences = Vec::new();
    loop {
        match wait_for(&mut events, |_| true).await {
            BridgeEvent::AudioChunk(frame) => {
                assert_eq!(frame.session_id(), &info.session_id);
                sequences.push(frame.sequence());
            }
            BridgeEvent::ResponseComplete { response_id, .. } => {
                assert_eq!(response_id.as_deref(), Some("resp_1"));
                break;
            }
            _ => {}
        }
    }
    assert_eq!(sequences, vec![0, 1, 2]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(up.sent.try_recv().is_err());
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, BridgeEvent::ResponseComplete { .. }))
    );
    assert_eq!(h.bridge.info().await.unwrap().state, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_one_request_in_flight() {
    let mut h = Harness::new(BridgeSettings::default());
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("one").await.unwrap();
    h.bridge.send_text("two").await.unwrap();

    assert!(item_text(&up.next_event().await).ends_with("one"));
    assert_eq!(up.next_event().await["type"], "response.create");

    let info = h.bridge.info().await.unwrap();
    assert_eq!(info.state, SessionState::Speaking);
    assert!(info.pending_request);
    assert_eq!(info.queued_requests, 1);

    // Nothing else goes out until the first response completes
    let early = tokio::time::timeout(Duration::from_secs(10), up.next_event()).await;
    assert!(early.is_err());

    up.finish_response("resp_1").await;
    assert!(item_text(&up.next_event().await).ends_with("two"));
}

#[tokio::test(start_paused = true)]
async fn test_configuration_timeout_assumes_ready() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let started = Instant::now();

    let bridge = h.bridge.clone();
    let pending = tokio::spawn(async move { bridge.connect(None).await });
    let mut up = h.links.recv().await.unwrap();
    assert_eq!(up.next_event().await["type"], "session.update");

    // Never acknowledged
    let info = pending.await.unwrap().unwrap();
    assert_eq!(info.state, SessionState::Ready);
    assert!(started.elapsed() >= Duration::from_secs(3));

    let states: Vec<SessionState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            BridgeEvent::StateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Connecting,
            SessionState::Configuring,
            SessionState::Ready
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_acknowledgement_skips_timeout() {
    let mut h = Harness::new(BridgeSettings::default());
    let started = Instant::now();
    let (_up, info) = h.connect("A").await;
    assert_eq!(info.voice, "A");
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_capture_pauses_for_speech() {
    let capture = RecordingCapture::default();
    let mut h = Harness::with_capture(BridgeSettings::default(), capture.clone());
    let mut events = h.bridge.subscribe();
    let (mut up, info) = h.connect("A").await;

    h.bridge.start_capture().await.unwrap();
    assert!(matches!(
        capture.toggles().as_slice(),
        [Toggle::Resumed(_, id)] if *id == info.session_id
    ));

    h.bridge.send_text("Hello").await.unwrap();
    item_text(&up.next_event().await);
    let item_seen = Instant::now();
    let toggles = capture.toggles();
    let Some(Toggle::Paused(paused_at)) = toggles.last() else {
        panic!("capture not paused before speech: {toggles:?}");
    };
    assert!(*paused_at <= item_seen);

    assert_eq!(up.next_event().await["type"], "response.create");
    up.send_audio(&[1, 0, 2, 0]).await;
    up.finish_response("resp_1").await;
    let done_at = Instant::now();
    wait_for(&mut events, |e| matches!(e, BridgeEvent::ResponseComplete { .. })).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let toggles = capture.toggles();
    assert_eq!(toggles.len(), 3, "{toggles:?}");
    let Toggle::Resumed(resumed_at, _) = toggles[2] else {
        panic!("capture did not resume: {toggles:?}");
    };
    assert!(resumed_at.duration_since(done_at) >= Duration::from_millis(500));
    assert!(resumed_at.duration_since(done_at) < Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_capture_resumes_after_unrequested_reply() {
    let capture = RecordingCapture::default();
    let mut h = Harness::with_capture(BridgeSettings::default(), capture.clone());
    let mut events = h.bridge.subscribe();
    let (up, _) = h.connect("A").await;
    h.bridge.start_capture().await.unwrap();

    // The upstream answers speech on its own, without a text request
    up.send_audio(&[1, 0, 2, 0]).await;
    wait_for(&mut events, |e| matches!(e, BridgeEvent::AudioChunk(_))).await;
    assert!(matches!(
        capture.toggles().as_slice(),
        [Toggle::Resumed(..), Toggle::Paused(_)]
    ));
    up.finish_response("resp_turn").await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let toggles = capture.toggles();
    assert!(
        matches!(
            toggles.as_slice(),
            [Toggle::Resumed(..), Toggle::Paused(_), Toggle::Resumed(..)]
        ),
        "capture never resumed: {toggles:?}"
    );
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, BridgeEvent::ResponseComplete { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_capture_stays_off_when_stopped_during_speech() {
    let capture = RecordingCapture::default();
    let mut h = Harness::with_capture(BridgeSettings::default(), capture.clone());
    let (mut up, _) = h.connect("A").await;

    h.bridge.start_capture().await.unwrap();
    h.bridge.send_text("Hello").await.unwrap();
    item_text(&up.next_event().await);
    h.bridge.stop_capture().await.unwrap();

    assert_eq!(up.next_event().await["type"], "response.create");
    up.finish_response("resp_1").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let toggles = capture.toggles();
    assert!(matches!(
        toggles.as_slice(),
        [Toggle::Resumed(..), Toggle::Paused(_)]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_capture_frames_forwarded_only_while_listening() {
    let capture = RecordingCapture::default();
    let mut h = Harness::with_capture(BridgeSettings::default(), capture);
    let (mut up, info) = h.connect("A").await;
    let frames = h.bridge.capture_sink();

    h.bridge.start_capture().await.unwrap();
    frames
        .send(AudioFrame::new("stale".into(), 0, vec![9u8, 9]))
        .await
        .unwrap();
    frames
        .send(AudioFrame::new(info.session_id.clone(), 0, vec![1u8, 0]))
        .await
        .unwrap();
    assert_eq!(up.next_binary().await.as_ref(), &[1u8, 0]);

    h.bridge.send_text("Hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    frames
        .send(AudioFrame::new(info.session_id.clone(), 1, vec![2u8, 0]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    while let Ok(msg) = up.sent.try_recv() {
        assert!(matches!(msg, WireMessage::Text(_)), "audio sent during speech");
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_capture_without_device() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (_up, _) = h.connect("A").await;

    let err = h.bridge.start_capture().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    wait_for(&mut events, |e| is_error(e, "capture_unavailable")).await;
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_aborts_request_and_reconnects() {
    let mut h = Harness::new(test_settings());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("Hello").await.unwrap();
    item_text(&up.next_event().await);
    drop(up);

    wait_for(&mut events, |e| is_error(e, "request_aborted")).await;
    wait_for(&mut events, |e| {
        matches!(e, BridgeEvent::StateChanged { state: SessionState::Disconnected, .. })
    })
    .await;

    let mut again = h.links.recv().await.unwrap();
    again.accept().await;
    wait_for(&mut events, |e| matches!(e, BridgeEvent::Ready { .. })).await;
    assert_eq!(h.connector.attempts(), 2);

    // The aborted request is not replayed
    let replay = tokio::time::timeout(Duration::from_secs(5), again.next_event()).await;
    assert!(replay.is_err());
    assert_eq!(h.bridge.info().await.unwrap().state, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_connection_attempt() {
    let mut h = Harness::new(BridgeSettings::default());
    let (a, b, c) = (h.bridge.clone(), h.bridge.clone(), h.bridge.clone());
    let first = tokio::spawn(async move { a.connect(None).await });
    let second = tokio::spawn(async move { b.connect(None).await });
    let text = tokio::spawn(async move { c.send_text("racing").await });

    let mut up = h.links.recv().await.unwrap();
    up.accept().await;
    text.await.unwrap().unwrap();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.session_id, second.session_id);
    assert!(item_text(&up.next_event().await).ends_with("racing"));

    assert_eq!(h.connector.attempts(), 1);
    assert!(h.links.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_respect_minimum_interval() {
    let (connector, mut links) = FakeConnector::new();
    let bridge = Bridge::builder(test_settings(), connector.clone())
        .limiter(ConnectLimiter::new(Duration::from_secs(1)))
        .spawn();

    let pending = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.connect(None).await })
    };
    let mut up = links.recv().await.unwrap();
    let first_attempt = Instant::now();
    up.accept().await;
    pending.await.unwrap().unwrap();

    // Backoff alone would retry after 100 ms and then 200 ms
    connector.fail_next(1);
    drop(up);

    let mut again = links.recv().await.unwrap();
    let third_attempt = Instant::now();
    assert_eq!(connector.attempts(), 3);
    let spacing = third_attempt.duration_since(first_attempt);
    assert!(spacing >= Duration::from_secs(2), "attempts too close: {spacing:?}");
    assert!(spacing < Duration::from_millis(2500));

    again.accept().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bridge.info().await.unwrap().state, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_reports_voice_unavailable() {
    let mut h = Harness::new(test_settings());
    let mut events = h.bridge.subscribe();
    h.connector.fail_next(100);

    let err = h.bridge.connect(Some("A")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(h.connector.attempts(), 4);
    wait_for(&mut events, |e| is_error(e, "voice_unavailable")).await;
    assert_eq!(h.bridge.info().await.unwrap().state, SessionState::Error);

    // A later connect starts over
    h.connector.fail_next(0);
    let (_up, info) = h.connect("A").await;
    assert_eq!(info.state, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_cancels_response() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("one").await.unwrap();
    h.bridge.send_text("two").await.unwrap();
    item_text(&up.next_event().await);
    assert_eq!(up.next_event().await["type"], "response.create");
    drain(&mut events);

    h.bridge.interrupt().await.unwrap();
    assert_eq!(up.next_event().await, json!({"type": "response.cancel"}));

    // Late audio and the cancelled completion are swallowed
    up.send_audio(&[1, 0, 2, 0]).await;
    up.send_json(json!({
        "type": "response.done",
        "response": { "id": "resp_1", "status": "cancelled" }
    }))
    .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!drain(&mut events).iter().any(|e| matches!(
        e,
        BridgeEvent::AudioChunk(_) | BridgeEvent::ResponseComplete { .. }
    )));

    let info = h.bridge.info().await.unwrap();
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(info.queued_requests, 0);

    // Queue was dropped; the next request goes straight out
    h.bridge.send_text("three").await.unwrap();
    assert!(item_text(&up.next_event().await).ends_with("three"));
    assert_eq!(up.next_event().await["type"], "response.create");
    up.send_audio(&[1, 0]).await;
    up.finish_response("resp_2").await;
    wait_for(&mut events, |e| matches!(e, BridgeEvent::AudioChunk(_))).await;
    wait_for(&mut events, |e| matches!(e, BridgeEvent::ResponseComplete { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_before_generation_sends_no_cancel() {
    let mut h = Harness::new(BridgeSettings::default());
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("one").await.unwrap();
    item_text(&up.next_event().await);
    h.bridge.interrupt().await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(2), up.next_event()).await;
    assert!(next.is_err(), "unexpected message {next:?}");
    assert_eq!(h.bridge.info().await.unwrap().state, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_voice_change_replaces_connection() {
    let mut h = Harness::new(BridgeSettings::default());
    let (mut first, info_a) = h.connect("A").await;

    let (mut second, info_b) = h.connect("B").await;
    assert_eq!(second.voice, "B");
    assert_eq!(info_b.voice, "B");
    assert_ne!(info_a.session_id, info_b.session_id);
    assert!(first.sent.recv().await.is_none());

    // Same voice reuses the session
    let bridge = h.bridge.clone();
    let info = bridge.connect(Some("B")).await.unwrap();
    assert_eq!(info.session_id, info_b.session_id);
    assert!(second.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unrecognised_messages_are_ignored() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    up.send_json(json!({"type": "rate_limits.updated", "rate_limits": []}))
        .await;
    up.send_raw("not json").await;
    up.send_json(json!({"no_type": true})).await;
    up.send_json(json!({"type": "response.audio.delta"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, BridgeEvent::Error(_)))
    );
    assert_eq!(h.bridge.info().await.unwrap().state, SessionState::Ready);

    h.bridge.send_text("still here").await.unwrap();
    assert!(item_text(&up.next_event().await).ends_with("still here"));
}

#[tokio::test(start_paused = true)]
async fn test_upstream_error_releases_request() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("one").await.unwrap();
    h.bridge.send_text("two").await.unwrap();
    item_text(&up.next_event().await);
    assert_eq!(up.next_event().await["type"], "response.create");

    up.send_json(json!({
        "type": "error",
        "error": { "code": "server_error", "message": "boom" }
    }))
    .await;

    let BridgeEvent::Error(err) = wait_for(&mut events, |e| is_error(e, "upstream_error")).await
    else {
        unreachable!()
    };
    assert_eq!(err.kind, ErrorKind::Protocol);
    assert_eq!(err.message, "boom");
    assert!(item_text(&up.next_event().await).ends_with("two"));
}

#[tokio::test(start_paused = true)]
async fn test_late_completion_after_error_is_not_misattributed() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("one").await.unwrap();
    h.bridge.send_text("two").await.unwrap();
    item_text(&up.next_event().await);
    assert_eq!(up.next_event().await["type"], "response.create");
    up.send_json(json!({"type": "response.created", "response": {"id": "resp_1"}}))
        .await;
    up.send_json(json!({
        "type": "error",
        "error": { "code": "invalid_value", "message": "input audio rejected" }
    }))
    .await;
    assert!(item_text(&up.next_event().await).ends_with("two"));

    // The first response keeps running and finishes before "two" is generated
    up.finish_response("resp_1").await;
    assert_eq!(up.next_event().await["type"], "response.create");

    let info = h.bridge.info().await.unwrap();
    assert_eq!(info.state, SessionState::Speaking);
    assert!(info.pending_request);

    up.finish_response("resp_2").await;
    let BridgeEvent::ResponseComplete { response_id, .. } =
        wait_for(&mut events, |e| matches!(e, BridgeEvent::ResponseComplete { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(response_id.as_deref(), Some("resp_2"));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_response_finishing_late_is_swallowed() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("one").await.unwrap();
    h.bridge.send_text("two").await.unwrap();
    item_text(&up.next_event().await);
    assert_eq!(up.next_event().await["type"], "response.create");
    up.send_json(json!({"type": "response.created", "response": {"id": "resp_1"}}))
        .await;
    up.send_json(json!({
        "type": "error",
        "error": { "code": "invalid_value", "message": "input audio rejected" }
    }))
    .await;
    assert!(item_text(&up.next_event().await).ends_with("two"));
    assert_eq!(up.next_event().await["type"], "response.create");

    // "two" is generating but its response is not announced yet
    up.finish_response("resp_1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, BridgeEvent::ResponseComplete { .. }))
    );
    assert!(h.bridge.info().await.unwrap().pending_request);

    up.finish_response("resp_2").await;
    let BridgeEvent::ResponseComplete { response_id, .. } =
        wait_for(&mut events, |e| matches!(e, BridgeEvent::ResponseComplete { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(response_id.as_deref(), Some("resp_2"));
}

#[tokio::test(start_paused = true)]
async fn test_audio_delta_in_control_message() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.send_text("Hello").await.unwrap();
    item_text(&up.next_event().await);
    let delta = base64::engine::general_purpose::STANDARD.encode([1u8, 0, 2, 0]);
    up.send_json(json!({"type": "response.audio.delta", "delta": delta}))
        .await;

    let BridgeEvent::AudioChunk(frame) =
        wait_for(&mut events, |e| matches!(e, BridgeEvent::AudioChunk(_))).await
    else {
        unreachable!()
    };
    assert_eq!(frame.data(), &[1u8, 0, 2, 0]);
    assert_eq!(frame.sample_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_are_published() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (up, _) = h.connect("A").await;

    up.send_json(json!({"type": "response.audio_transcript.delta", "delta": "Hel"}))
        .await;
    up.send_json(json!({"type": "response.audio_transcript.done", "transcript": "Hello"}))
        .await;
    up.send_json(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "transcript": "hi there"
    }))
    .await;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        if let BridgeEvent::Transcript(t) =
            wait_for(&mut events, |e| matches!(e, BridgeEvent::Transcript(_))).await
        {
            seen.push((t.role, t.text, t.is_final));
        }
    }
    assert_eq!(
        seen,
        vec![
            (Role::Assistant, "Hel".to_string(), false),
            (Role::Assistant, "Hello".to_string(), true),
            (Role::User, "hi there".to_string(), true),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_destroyed() {
    let settings = BridgeSettings {
        idle_timeout: Duration::from_secs(10),
        ..BridgeSettings::default()
    };
    let mut h = Harness::new(settings);
    let (mut up, info) = h.connect("A").await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(up.sent.recv().await.is_none());
    let idle = h.bridge.info().await.unwrap();
    assert_eq!(idle.state, SessionState::Disconnected);
    assert_ne!(idle.session_id, info.session_id);
    assert_eq!(idle.voice, "A");

    // The next request reconnects on demand
    h.bridge.send_text("back again").await.unwrap();
    let mut fresh = h.links.recv().await.unwrap();
    fresh.accept().await;
    assert!(item_text(&fresh.next_event().await).ends_with("back again"));
}

#[tokio::test(start_paused = true)]
async fn test_local_playback_receives_audio() {
    let sink = RecordingSink::new(24_000);
    let scheduler = Arc::new(PlaybackScheduler::new(
        sink.clone(),
        SchedulerConfig::default(),
    ));
    let (connector, mut links) = FakeConnector::new();
    let bridge = Bridge::builder(BridgeSettings::default(), connector)
        .playback(scheduler)
        .spawn();
    let mut events = bridge.subscribe();

    let pending = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.connect(None).await })
    };
    let mut up = links.recv().await.unwrap();
    up.accept().await;
    let info = pending.await.unwrap().unwrap();

    bridge.send_text("Hello").await.unwrap();
    item_text(&up.next_event().await);
    up.send_audio(&[0, 16, 0, 16, 0, 16, 0, 16]).await;
    wait_for(&mut events, |e| matches!(e, BridgeEvent::AudioChunk(_))).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(sink.sample_counts(), vec![4]);

    bridge.interrupt().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sink.halted.lock().unwrap().contains(&info.session_id));
}

#[tokio::test(start_paused = true)]
async fn test_close_is_terminal() {
    let mut h = Harness::new(BridgeSettings::default());
    let mut events = h.bridge.subscribe();
    let (mut up, _) = h.connect("A").await;

    h.bridge.close().await;
    wait_for(&mut events, |e| {
        matches!(e, BridgeEvent::StateChanged { state: SessionState::Closed, .. })
    })
    .await;
    assert!(up.sent.recv().await.is_none());
    assert!(h.bridge.send_text("late").await.is_err());
    assert!(h.bridge.info().await.is_err());
}
