//! TOML configuration file loading
//!
//! Supports `<config_dir>/voice-relay/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Realtime endpoint
    #[serde(default)]
    pub upstream: UpstreamFileConfig,

    /// Capture and playback tuning
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Protocol timers
    #[serde(default)]
    pub timing: TimingFileConfig,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Relay server
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Upstream endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct UpstreamFileConfig {
    /// WebSocket URL (e.g. "wss://api.openai.com/v1/realtime")
    pub url: Option<String>,

    /// Model identifier appended as `?model=`
    pub model: Option<String>,

    pub api_key: Option<String>,

    /// Voice identity (e.g. "alloy")
    pub voice: Option<String>,

    /// Session instructions sent with the voice configuration
    pub instructions: Option<String>,

    pub handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub wire_sample_rate: Option<u32>,
    pub capture_frame_size: Option<usize>,
    pub silence_threshold: Option<f32>,
    pub capture_queue: Option<usize>,
    pub min_lead_ms: Option<u64>,
    pub max_outstanding: Option<usize>,
    pub sentence_pause_ms: Option<u64>,
    /// Input device name; host default when unset
    pub input_device: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub generate_delay_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    pub min_connect_interval_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Relay server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Listen port
    pub port: Option<u16>,

    /// Listen address
    pub bind: Option<String>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> ConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `<config_dir>/voice-relay/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-relay").join("config.toml"))
}
