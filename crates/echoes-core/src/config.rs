//! Configuration resolution for Echoes.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/echoes/settings.json)
//! 3. Explicit config file (e.g. `--config` on the CLI)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Configuration never carries key material; session keys live only in memory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete Echoes configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub keyx: KeyxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Key exchange negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyxConfig {
    /// Whether this client can negotiate the elliptic-curve key exchange family.
    /// When false, incoming `keyx` offers are answered with `keyx_unsupported`.
    pub key_exchange_supported: bool,
    /// Prefer key exchange over the legacy asymmetric family when both work.
    pub prefer_key_exchange: bool,
    /// Capacity of the encryption-state broadcast channel.
    pub event_capacity: usize,
}

impl Default for KeyxConfig {
    fn default() -> Self {
        Self {
            key_exchange_supported: true,
            prefer_key_exchange: true,
            event_capacity: 256,
        }
    }
}

impl KeyxConfig {
    /// True when new negotiations should start with the key exchange family.
    pub const fn prefers_key_exchange(&self) -> bool {
        self.key_exchange_supported && self.prefer_key_exchange
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
        debug!(path = %global_path.display(), "Loaded global config");
    }

    // Load explicitly requested config; a missing file here is an error
    if let Some(path) = explicit_path {
        let explicit = load_config_file(path)?;
        merge_config(&mut config, explicit);
        debug!(path = %path.display(), "Loaded config file");
    }

    // Apply environment overrides
    apply_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".echoes").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/echoes/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("echoes").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.keyx = overlay.keyx;
    base.logging = overlay.logging;
}

/// Apply `ECHOES_*` overrides. `lookup` abstracts the environment so the
/// resolution order can be tested without touching process state.
fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(b) = lookup("ECHOES_KEY_EXCHANGE_SUPPORTED").and_then(|v| parse_bool(&v)) {
        config.keyx.key_exchange_supported = b;
    }
    if let Some(b) = lookup("ECHOES_PREFER_KEY_EXCHANGE").and_then(|v| parse_bool(&v)) {
        config.keyx.prefer_key_exchange = b;
    }
    if let Some(val) = lookup("ECHOES_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(b) = lookup("ECHOES_LOG_JSON").and_then(|v| parse_bool(&v)) {
        config.logging.json = b;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
