//! Configuration system for ident.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $IDENT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ident/config.toml
//!   3. ~/.config/ident/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_MESSAGE_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub identify: IdentifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the X25519 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
    /// Announce our public key in identify payloads. When false the node
    /// behaves like an unauthenticated transport.
    pub announce_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address to listen on.
    pub listen_addr: String,
    /// Peers dialed at start-up.
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyConfig {
    /// Agent version announced to peers.
    pub agent_version: String,
    /// Deadline for one broadcast round (push or delta).
    pub push_timeout_secs: u64,
    /// Largest identify or delta payload we send or accept.
    pub max_message_size: usize,
    /// Extra attempts after a failed protocol negotiation. 0 = no retry.
    pub negotiation_retries: u32,
    /// Event bus channel capacity.
    pub event_buffer: usize,
}

impl IdentifyConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
            announce_key: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4001".to_string(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            agent_version: concat!("ident/", env!("CARGO_PKG_VERSION")).to_string(),
            push_timeout_secs: 30,
            max_message_size: MAX_MESSAGE_SIZE,
            negotiation_retries: 0,
            event_buffer: 128,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ident")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl IdentConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            IdentConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("IDENT_CONFIG")
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
            let text = toml::to_string_pretty(&IdentConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply IDENT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("IDENT_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("IDENT_IDENTITY__ANNOUNCE_KEY") {
            self.identity.announce_key = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("IDENT_IDENTIFY__AGENT_VERSION") {
            self.identify.agent_version = v;
        }
        if let Ok(v) = std::env::var("IDENT_IDENTIFY__PUSH_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.identify.push_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("IDENT_IDENTIFY__NEGOTIATION_RETRIES") {
            if let Ok(n) = v.parse() {
                self.identify.negotiation_retries = n;
            }
        }
    }
}
