// src/config.rs
//
// Application config (component I), mirroring `settings.rs`'s
// load/save-with-upgradeable-defaults pattern: every field that was added
// after the first release carries a `#[serde(default = "...")]` function
// so an old config file on disk keeps loading after a field is added.
// Persisted as TOML rather than the teacher's JSON-under-a-`.toml`-name
// quirk — this crate actually uses the `toml` crate for it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,
    #[serde(default = "default_symbols_dir")]
    pub symbols_dir: String,
    #[serde(default = "default_transmit_lists_dir")]
    pub transmit_lists_dir: String,

    #[serde(default = "default_variant")]
    pub default_variant: String,
    #[serde(default = "default_baudrate")]
    pub default_baudrate: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_verify_batch_size")]
    pub verify_batch_size: usize,
    #[serde(default = "default_verify_enabled")]
    pub verify_enabled: bool,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_relay_poll_interval_ms")]
    pub relay_poll_interval_ms: u64,
    #[serde(default = "default_relay_error_threshold")]
    pub relay_error_threshold: u32,
}

fn app_dir() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("canbridge")
}

fn default_reports_dir() -> String {
    app_dir().join("Reports").to_string_lossy().to_string()
}
fn default_symbols_dir() -> String {
    app_dir().join("Symbols").to_string_lossy().to_string()
}
fn default_transmit_lists_dir() -> String {
    app_dir().join("TransmitLists").to_string_lossy().to_string()
}
fn default_variant() -> String {
    "pcan".to_string()
}
fn default_baudrate() -> u32 {
    500_000
}
fn default_batch_size() -> usize {
    16
}
fn default_verify_batch_size() -> usize {
    8
}
fn default_verify_enabled() -> bool {
    true
}
fn default_queue_depth() -> usize {
    1024
}
fn default_relay_poll_interval_ms() -> u64 {
    100
}
fn default_relay_error_threshold() -> u32 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reports_dir: default_reports_dir(),
            symbols_dir: default_symbols_dir(),
            transmit_lists_dir: default_transmit_lists_dir(),
            default_variant: default_variant(),
            default_baudrate: default_baudrate(),
            batch_size: default_batch_size(),
            verify_batch_size: default_verify_batch_size(),
            verify_enabled: default_verify_enabled(),
            queue_depth: default_queue_depth(),
            relay_poll_interval_ms: default_relay_poll_interval_ms(),
            relay_error_threshold: default_relay_error_threshold(),
        }
    }
}

/// Loads `path` if it exists; otherwise writes and returns the defaults,
/// creating the configured directories along the way — matching
/// `load_settings`'s first-run behaviour.
pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let config = if path.exists() {
        let text = std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {e}"))?;
        toml::from_str(&text).map_err(|e| format!("failed to parse config: {e}"))?
    } else {
        let config = AppConfig::default();
        save_config(&config, path)?;
        config
    };
    for dir in [&config.reports_dir, &config.symbols_dir, &config.transmit_lists_dir] {
        std::fs::create_dir_all(dir).map_err(|e| format!("failed to create {dir}: {e}"))?;
    }
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }
    let text = toml::to_string_pretty(config).map_err(|e| format!("failed to serialize config: {e}"))?;
    std::fs::write(path, text).map_err(|e| format!("failed to write config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(label: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("canbridge_config_test_{label}_{}.toml", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn missing_file_writes_and_returns_defaults() {
        let path = tmp_path("missing");
        let config = load_config(&path).unwrap();
        assert_eq!(config.default_baudrate, 500_000);
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn old_config_missing_new_fields_upgrades_cleanly() {
        let path = tmp_path("old");
        std::fs::write(&path, "reports_dir = \"/tmp/r\"\nsymbols_dir = \"/tmp/s\"\ntransmit_lists_dir = \"/tmp/t\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.reports_dir, "/tmp/r");
        assert_eq!(config.default_baudrate, 500_000);
        assert_eq!(config.queue_depth, 1024);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = tmp_path("roundtrip");
        let mut config = AppConfig::default();
        config.default_baudrate = 250_000;
        config.batch_size = 32;
        save_config(&config, &path).unwrap();
        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.default_baudrate, 250_000);
        assert_eq!(reloaded.batch_size, 32);
        let _ = std::fs::remove_file(&path);
    }
}
