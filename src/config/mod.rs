//! Configuration management for the voice relay
//!
//! Values resolve as environment > TOML file > defaults.

pub mod file;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::realtime::RetryPolicy;
use crate::voice::{CaptureConfig, SchedulerConfig, WIRE_SAMPLE_RATE};
use crate::{Error, Result};

pub use file::{ConfigFile, config_file_path, load_config_file};

/// Default upstream realtime endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Default voice identity
pub const DEFAULT_VOICE: &str = "alloy";

/// Default relay server port
pub const DEFAULT_PORT: u16 = 18795;

/// Voice relay configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub audio: AudioConfig,
    pub timing: TimingConfig,
    pub reconnect: RetryPolicy,
    pub server: ServerConfig,
}

/// Realtime endpoint configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    /// From `VOICE_RELAY_API_KEY`, `OPENAI_API_KEY`, or the file
    pub api_key: Option<SecretString>,
    pub voice: String,
    pub instructions: Option<String>,
    pub handshake_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            voice: DEFAULT_VOICE.to_string(),
            instructions: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Capture and playback configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub wire_sample_rate: u32,
    pub capture_frame_size: usize,
    pub silence_threshold: f32,
    /// Frames buffered between the capture callback and the bridge
    pub capture_queue: usize,
    pub min_lead: Duration,
    pub max_outstanding: usize,
    pub sentence_pause: Duration,
    pub input_device: Option<String>,
    /// Microphone allowed (`--no-capture` clears it)
    pub capture_enabled: bool,
    /// Speaker output suppressed (`--mute`)
    pub muted: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            wire_sample_rate: WIRE_SAMPLE_RATE,
            capture_frame_size: 4096,
            silence_threshold: 0.01,
            capture_queue: 32,
            min_lead: Duration::from_millis(5),
            max_outstanding: 2,
            sentence_pause: Duration::from_millis(500),
            input_device: None,
            capture_enabled: true,
            muted: false,
        }
    }
}

impl AudioConfig {
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_lead: self.min_lead,
            sentence_pause: self.sentence_pause,
            max_outstanding: self.max_outstanding,
        }
    }

    #[must_use]
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            frame_size: self.capture_frame_size,
            silence_threshold: self.silence_threshold,
            wire_rate: self.wire_sample_rate,
        }
    }
}

/// Protocol timers
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Between "create content item" and "generate response"
    pub generate_delay: Duration,
    /// How long to wait for the configuration acknowledgement
    pub ack_timeout: Duration,
    /// After playback before capture resumes
    pub settle: Duration,
    pub min_connect_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            generate_delay: Duration::from_millis(300),
            ack_timeout: Duration::from_secs(3),
            settle: Duration::from_millis(500),
            min_connect_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn ms(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

impl Config {
    /// Load from the environment and the config file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a value is present but invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve a config from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a value is present but invalid
    pub fn from_sources(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let api_key = env("VOICE_RELAY_API_KEY")
            .or_else(|| env("OPENAI_API_KEY"))
            .or(fc.upstream.api_key)
            .filter(|k| !k.is_empty())
            .map(SecretString::from);

        let upstream = UpstreamConfig {
            url: env("VOICE_RELAY_URL")
                .or(fc.upstream.url)
                .unwrap_or(defaults.upstream.url),
            model: env("VOICE_RELAY_MODEL")
                .or(fc.upstream.model)
                .unwrap_or(defaults.upstream.model),
            api_key,
            voice: env("VOICE_RELAY_VOICE")
                .or(fc.upstream.voice)
                .unwrap_or(defaults.upstream.voice),
            instructions: fc.upstream.instructions,
            handshake_timeout: ms(
                fc.upstream.handshake_timeout_ms,
                defaults.upstream.handshake_timeout,
            ),
        };

        let audio = AudioConfig {
            wire_sample_rate: fc
                .audio
                .wire_sample_rate
                .unwrap_or(defaults.audio.wire_sample_rate),
            capture_frame_size: fc
                .audio
                .capture_frame_size
                .unwrap_or(defaults.audio.capture_frame_size),
            silence_threshold: fc
                .audio
                .silence_threshold
                .unwrap_or(defaults.audio.silence_threshold),
            capture_queue: fc
                .audio
                .capture_queue
                .unwrap_or(defaults.audio.capture_queue),
            min_lead: ms(fc.audio.min_lead_ms, defaults.audio.min_lead),
            max_outstanding: fc
                .audio
                .max_outstanding
                .unwrap_or(defaults.audio.max_outstanding),
            sentence_pause: ms(fc.audio.sentence_pause_ms, defaults.audio.sentence_pause),
            input_device: fc.audio.input_device,
            ..defaults.audio
        };

        let timing = TimingConfig {
            generate_delay: ms(fc.timing.generate_delay_ms, defaults.timing.generate_delay),
            ack_timeout: ms(fc.timing.ack_timeout_ms, defaults.timing.ack_timeout),
            settle: ms(fc.timing.settle_ms, defaults.timing.settle),
            min_connect_interval: ms(
                fc.timing.min_connect_interval_ms,
                defaults.timing.min_connect_interval,
            ),
            idle_timeout: fc
                .timing
                .idle_timeout_secs
                .map_or(defaults.timing.idle_timeout, Duration::from_secs),
        };

        let reconnect = RetryPolicy {
            max_retries: fc
                .reconnect
                .max_retries
                .unwrap_or(defaults.reconnect.max_retries),
            base_delay: ms(fc.reconnect.base_delay_ms, defaults.reconnect.base_delay),
            max_delay: ms(fc.reconnect.max_delay_ms, defaults.reconnect.max_delay),
        };

        let bind = match fc.server.bind {
            Some(addr) => addr
                .parse()
                .map_err(|e| Error::Config(format!("invalid bind address {addr}: {e}")))?,
            None => defaults.server.bind,
        };
        let server = ServerConfig {
            bind,
            port: env("VOICE_RELAY_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
        };

        let config = Self {
            upstream,
            audio,
            timing,
            reconnect,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the engine misbehave
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.audio.wire_sample_rate == 0 {
            return Err(Error::Config("wire_sample_rate must be positive".to_string()));
        }
        if self.audio.capture_frame_size == 0 {
            return Err(Error::Config("capture_frame_size must be positive".to_string()));
        }
        if self.audio.capture_queue == 0 {
            return Err(Error::Config("capture_queue must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.audio.silence_threshold) {
            return Err(Error::Config(
                "silence_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.upstream.voice.trim().is_empty() {
            return Err(Error::Config("voice must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(ConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.upstream.url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.upstream.voice, "alloy");
        assert!(config.upstream.api_key.is_none());
        assert_eq!(config.audio.capture_frame_size, 4096);
        assert_eq!(config.timing.generate_delay, Duration::from_millis(300));
        assert_eq!(config.timing.settle, Duration::from_millis(500));
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.reconnect.max_retries, 5);
    }

    #[test]
    fn env_beats_file() {
        let mut fc = ConfigFile::default();
        fc.upstream.voice = Some("verse".into());
        fc.server.port = Some(9000);
        let config = Config::from_sources(
            fc,
            env_of(&[("VOICE_RELAY_VOICE", "shimmer"), ("VOICE_RELAY_PORT", "9100")]),
        )
        .unwrap();
        assert_eq!(config.upstream.voice, "shimmer");
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn file_beats_default() {
        let mut fc = ConfigFile::default();
        fc.timing.ack_timeout_ms = Some(1200);
        fc.audio.silence_threshold = Some(0.05);
        let config = Config::from_sources(fc, env_of(&[])).unwrap();
        assert_eq!(config.timing.ack_timeout, Duration::from_millis(1200));
        assert!((config.audio.silence_threshold - 0.05).abs() < f32::EPSILON);
    }

    #[test]
    fn api_key_prefers_relay_variable() {
        let config = Config::from_sources(
            ConfigFile::default(),
            env_of(&[("OPENAI_API_KEY", "sk-openai"), ("VOICE_RELAY_API_KEY", "sk-relay")]),
        )
        .unwrap();
        let key = config.upstream.api_key.unwrap();
        assert_eq!(key.expose_secret(), "sk-relay");
    }

    #[test]
    fn unparsable_port_falls_back() {
        let config =
            Config::from_sources(ConfigFile::default(), env_of(&[("VOICE_RELAY_PORT", "nope")]))
                .unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut fc = ConfigFile::default();
        fc.audio.capture_frame_size = Some(0);
        assert!(Config::from_sources(fc, env_of(&[])).is_err());

        let mut fc = ConfigFile::default();
        fc.server.bind = Some("not-an-ip".into());
        assert!(matches!(
            Config::from_sources(fc, env_of(&[])),
            Err(Error::Config(_))
        ));
    }
}
