//! Configuration system for sluice.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SLUICE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sluice/config.toml
//!   3. ~/.config/sluice/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkConfig, CHUNK_HEADER_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub gatt: GattConfig,
    pub broker: BrokerConfig,
    pub security: SecurityConfig,
}

/// Short-range GATT transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Name carried in advertising packets.
    pub device_name: String,
    /// Fast advertising interval bounds (ms), used at baseline backoff.
    pub adv_fast_interval_min_ms: u32,
    pub adv_fast_interval_max_ms: u32,
    /// Fast advertising duration (ms).
    pub adv_fast_duration_ms: u32,
    /// Slow advertising interval bounds (ms), used once backoff has grown.
    pub adv_slow_interval_min_ms: u32,
    pub adv_slow_interval_max_ms: u32,
    /// Slow advertising duration (ms).
    pub adv_slow_duration_ms: u32,
    /// Peer connection supervision timeout (ms).
    pub connection_timeout_ms: u32,
    /// Re-advertising backoff bounds (ms).
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Pause between notifications of one chunked response (ms).
    pub inter_chunk_delay_ms: u64,
    /// Default chunking geometry; the live chunk size follows the MTU.
    pub chunk: ChunkSettings,
}

/// Broker (publish/subscribe) transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URI, e.g. `mqtt://broker.example:1883`.
    pub uri: String,
    /// Keepalive interval (s).
    pub keepalive_secs: u16,
    /// Reconnect backoff bounds (ms).
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Delivery QoS level, 0..=2.
    pub qos: u8,
    /// Prefix for every topic this device uses.
    pub topic_prefix: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    pub auth: BrokerAuth,
}

/// Broker authentication methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BrokerAuth {
    None,
    UserPass { username: String, password: String },
    Certificate { cert_path: PathBuf, key_path: PathBuf },
    Psk { identity: String, key_hex: String },
}

/// Security1 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Proof-of-possession string. Empty disables Security1.
    pub pop: String,
    /// When Security1 is disabled, allow plaintext legacy topics.
    pub fallback_to_legacy: bool,
}

/// Chunk manager settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub max_chunk_size: usize,
    /// 1..=8 concurrent reassembly contexts.
    pub max_concurrent_frames: usize,
    pub reassembly_timeout_ms: u64,
}

impl ChunkSettings {
    pub fn to_chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            max_chunk_size: self.max_chunk_size,
            header_size: CHUNK_HEADER_SIZE,
            max_concurrent_frames: self.max_concurrent_frames,
            reassembly_timeout: Duration::from_millis(self.reassembly_timeout_ms),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            gatt: GattConfig::default(),
            broker: BrokerConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            device_name: "sluice".into(),
            adv_fast_interval_min_ms: 20,
            adv_fast_interval_max_ms: 50,
            adv_fast_duration_ms: 30_000,
            adv_slow_interval_min_ms: 100,
            adv_slow_interval_max_ms: 300,
            adv_slow_duration_ms: 10_000,
            connection_timeout_ms: 10_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 32_000,
            inter_chunk_delay_ms: 20,
            chunk: ChunkSettings::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: "mqtt://localhost:1883".into(),
            keepalive_secs: 60,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 32_000,
            qos: 1,
            topic_prefix: "sluice/dev".into(),
            client_id: "sluice-controller".into(),
            auth: BrokerAuth::None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pop: String::new(),
            fallback_to_legacy: true,
        }
    }
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 256,
            max_concurrent_frames: 4,
            reassembly_timeout_ms: 2_000,
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Check a proof-of-possession string: 6..=64 chars of `[A-Za-z0-9_-]`.
pub fn validate_pop(pop: &str) -> Result<(), ConfigError> {
    if pop.len() < 6 || pop.len() > 64 {
        return Err(ConfigError::BadPop("length must be 6..=64"));
    }
    if !pop
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(ConfigError::BadPop(
            "only alphanumeric characters, '-' and '_' allowed",
        ));
    }
    Ok(())
}

impl SecurityConfig {
    /// Security1 is on when a PoP is configured.
    pub fn enabled(&self) -> bool {
        !self.pop.is_empty()
    }
}

impl SluiceConfig {
    /// Validate cross-field constraints after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.enabled() {
            validate_pop(&self.security.pop)?;
        } else if !self.security.fallback_to_legacy {
            return Err(ConfigError::Invalid(
                "no PoP configured and legacy fallback disabled",
            ));
        }
        if self.broker.qos > 2 {
            return Err(ConfigError::Invalid("broker qos must be 0..=2"));
        }
        if self.broker.topic_prefix.is_empty() {
            return Err(ConfigError::Invalid("broker topic_prefix must be set"));
        }
        let chunk = &self.gatt.chunk;
        if chunk.max_concurrent_frames == 0 || chunk.max_concurrent_frames > 8 {
            return Err(ConfigError::Invalid("chunk max_concurrent_frames must be 1..=8"));
        }
        if chunk.max_chunk_size <= CHUNK_HEADER_SIZE {
            return Err(ConfigError::Invalid("chunk max_chunk_size too small"));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("sluice")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid proof-of-possession string: {0}")]
    BadPop(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SluiceConfig {
    /// Load config: env vars → file → defaults. Validates before returning.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SluiceConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SLUICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SluiceConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SLUICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLUICE_GATT__DEVICE_NAME") {
            self.gatt.device_name = v;
        }
        if let Ok(v) = std::env::var("SLUICE_BROKER__URI") {
            self.broker.uri = v;
        }
        if let Ok(v) = std::env::var("SLUICE_BROKER__TOPIC_PREFIX") {
            self.broker.topic_prefix = v;
        }
        if let Ok(v) = std::env::var("SLUICE_BROKER__CLIENT_ID") {
            self.broker.client_id = v;
        }
        if let Ok(v) = std::env::var("SLUICE_SECURITY__POP") {
            self.security.pop = v;
        }
        if let Ok(v) = std::env::var("SLUICE_SECURITY__FALLBACK_TO_LEGACY") {
            self.security.fallback_to_legacy = v == "true" || v == "1";
        }
    }
}
