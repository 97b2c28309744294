//! Voice Relay - real-time voice streaming between local audio devices and a
//! realtime speech API
//!
//! This library provides:
//! - PCM16 framing and resampling for the wire format
//! - Gapless playback scheduling on a device clock
//! - Microphone capture with silence filtering
//! - A session bridge that sequences text-to-speech requests upstream
//! - Half-duplex arbitration so capture and playback never share the device
//! - A WebSocket relay server and a reconnecting client for it
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        VoiceClient  ◀── ws ──▶  Relay server (api)   │
//! └────────────────────────────────┬─────────────────────┘
//!                                  │
//! ┌────────────────────────────────▼─────────────────────┐
//! │                  Bridge (realtime)                    │
//! │  Session state  │  Sequencing  │  Arbiter  │ Retry   │
//! └──────┬─────────────────────────────────────┬─────────┘
//!        │                                     │
//! ┌──────▼───────────────┐          ┌──────────▼─────────┐
//! │ Capture │ Playback   │          │ Upstream realtime  │
//! │   (voice, cpal)      │          │ endpoint (ws)      │
//! └──────────────────────┘          └────────────────────┘
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod realtime;
pub mod voice;

pub use client::{ClientStatus, VoiceClient, VoiceClientBuilder};
pub use config::Config;
pub use error::{BridgeError, Error, ErrorKind, Result};
pub use realtime::{Bridge, BridgeEvent, BridgeHandle, BridgeSettings, SessionId, SessionState};
