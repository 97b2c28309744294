//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use voice_relay::realtime::{Connector, RetryPolicy, UpstreamLink, WireMessage};
use voice_relay::voice::{AudioSink, CaptureControl};
use voice_relay::{BridgeEvent, BridgeSettings, Error, Result, SessionId};

/// Server side of one fake upstream connection
pub struct FakeUpstream {
    pub voice: String,
    /// Everything the bridge sent on this link
    pub sent: mpsc::Receiver<WireMessage>,
    /// Inject messages as if the vendor sent them; drop to close the link
    pub push: mpsc::Sender<WireMessage>,
}

impl FakeUpstream {
    /// Next control message from the bridge, skipping audio
    pub async fn next_event(&mut self) -> Value {
        loop {
            match self.sent.recv().await.expect("link closed") {
                WireMessage::Text(text) => {
                    return serde_json::from_str(&text).expect("bridge sent invalid json");
                }
                WireMessage::Binary(_) => {}
            }
        }
    }

    /// Next audio frame from the bridge, skipping control messages
    pub async fn next_binary(&mut self) -> Bytes {
        loop {
            match self.sent.recv().await.expect("link closed") {
                WireMessage::Binary(data) => return data,
                WireMessage::Text(_) => {}
            }
        }
    }

    pub async fn send_json(&self, value: Value) {
        self.push
            .send(WireMessage::Text(value.to_string()))
            .await
            .expect("bridge dropped link");
    }

    pub async fn send_raw(&self, text: &str) {
        self.push
            .send(WireMessage::Text(text.to_string()))
            .await
            .expect("bridge dropped link");
    }

    pub async fn send_audio(&self, data: &[u8]) {
        self.push
            .send(WireMessage::Binary(Bytes::copy_from_slice(data)))
            .await
            .expect("bridge dropped link");
    }

    /// Expect the configuration message and acknowledge it
    pub async fn accept(&mut self) -> Value {
        let update = self.next_event().await;
        assert_eq!(update["type"], "session.update");
        self.send_json(serde_json::json!({
            "type": "session.updated",
            "session": { "id": "sess_fake" }
        }))
        .await;
        update
    }

    pub async fn finish_response(&self, id: &str) {
        self.send_json(serde_json::json!({
            "type": "response.done",
            "response": { "id": id, "status": "completed" }
        }))
        .await;
    }
}

/// Connector handing each new link to the test
pub struct FakeConnector {
    links: mpsc::UnboundedSender<FakeUpstream>,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeUpstream>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            links,
            failures: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, voice: &str) -> Result<UpstreamLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (outbound, sent) = mpsc::channel(256);
        let (push, inbound) = mpsc::channel(256);
        self.links
            .send(FakeUpstream {
                voice: voice.to_string(),
                sent,
                push,
            })
            .map_err(|_| Error::Transport("test harness gone".to_string()))?;
        Ok(UpstreamLink { outbound, inbound })
    }
}

/// Bridge settings with quick retries
pub fn test_settings() -> BridgeSettings {
    BridgeSettings {
        reconnect: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        ..BridgeSettings::default()
    }
}

/// Capture toggle as observed by [`RecordingCapture`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toggle {
    Resumed(Instant, SessionId),
    Paused(Instant),
}

/// Capture side that only records when it is switched
#[derive(Clone, Default)]
pub struct RecordingCapture {
    pub log: Arc<Mutex<Vec<Toggle>>>,
    active: Arc<Mutex<bool>>,
}

impl RecordingCapture {
    pub fn toggles(&self) -> Vec<Toggle> {
        self.log.lock().unwrap().clone()
    }
}

impl CaptureControl for RecordingCapture {
    fn resume(&mut self, session: &SessionId) -> Result<()> {
        *self.active.lock().unwrap() = true;
        self.log
            .lock()
            .unwrap()
            .push(Toggle::Resumed(Instant::now(), session.clone()));
        Ok(())
    }

    fn pause(&mut self) {
        *self.active.lock().unwrap() = false;
        self.log.lock().unwrap().push(Toggle::Paused(Instant::now()));
    }

    fn is_active(&self) -> bool {
        *self.active.lock().unwrap()
    }
}

/// Output device that renders instantly and records what it was given
pub struct RecordingSink {
    pub rate: u32,
    pub submitted: Mutex<Vec<(SessionId, usize, f64)>>,
    pub halted: Mutex<Vec<SessionId>>,
}

impl RecordingSink {
    pub fn new(rate: u32) -> Arc<Self> {
        Arc::new(Self {
            rate,
            submitted: Mutex::new(Vec::new()),
            halted: Mutex::new(Vec::new()),
        })
    }

    pub fn sample_counts(&self) -> Vec<usize> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, len, _)| *len)
            .collect()
    }
}

impl AudioSink for RecordingSink {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn now(&self) -> f64 {
        0.0
    }

    fn submit(&self, session: &SessionId, samples: Arc<[f32]>, start_at: f64) -> oneshot::Receiver<()> {
        self.submitted
            .lock()
            .unwrap()
            .push((session.clone(), samples.len(), start_at));
        let (done, rx) = oneshot::channel();
        let _ = done.send(());
        rx
    }

    fn halt(&self, session: &SessionId) {
        self.halted.lock().unwrap().push(session.clone());
    }
}

/// Wait for the first event matching `pred`, failing after a minute of virtual time
pub async fn wait_for<F>(events: &mut broadcast::Receiver<BridgeEvent>, mut pred: F) -> BridgeEvent
where
    F: FnMut(&BridgeEvent) -> bool,
{
    let deadline = Duration::from_secs(60);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("bridge stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for bridge event")
}

/// Everything already published, without waiting
pub fn drain(events: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
