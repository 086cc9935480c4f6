//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peerlink_core::MacAddr;

/// Controller configuration. File: `--config <path>`, ~/.config/peerlink/config.toml or
/// /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_RADIO_PORT, PEERLINK_CONTROL_PORT, PEERLINK_DATA_DIR,
/// PEERLINK_LOG_DIR, PEERLINK_MAC, PEERLINK_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name sent in peering requests (default "Controller").
    #[serde(default = "default_controller_name")]
    pub controller_name: String,
    /// Own radio address. Generated and persisted on first start when unset.
    #[serde(default)]
    pub mac: Option<MacAddr>,
    /// UDP port of the emulated radio medium (default 47800).
    #[serde(default = "default_radio_port")]
    pub radio_port: u16,
    /// Local control socket port (default 47801).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Durable blob store directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root of per-peer telemetry logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Pre-shared key for encrypted unicast links.
    #[serde(default = "default_link_key")]
    pub link_key: String,
    /// Discovery window in milliseconds (default 5000).
    #[serde(default = "default_peering_timeout_ms")]
    pub peering_timeout_ms: u64,
}

fn default_controller_name() -> String {
    "Controller".to_string()
}
fn default_radio_port() -> u16 {
    47800
}
fn default_control_port() -> u16 {
    47801
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/peerlink")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/peerlink/logs")
}
fn default_link_key() -> String {
    "lmk1234567890123".to_string()
}
fn default_peering_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            mac: None,
            radio_port: default_radio_port(),
            control_port: default_control_port(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            link_key: default_link_key(),
            peering_timeout_ms: default_peering_timeout_ms(),
        }
    }
}

impl Config {
    pub fn peering_timeout(&self) -> Duration {
        Duration::from_millis(self.peering_timeout_ms)
    }
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => parse_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PEERLINK_RADIO_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.radio_port = p;
    }
    if let Some(p) = var("PEERLINK_CONTROL_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.control_port = p;
    }
    if let Some(d) = var("PEERLINK_DATA_DIR") {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(d) = var("PEERLINK_LOG_DIR") {
        c.log_dir = PathBuf::from(d);
    }
    if let Some(m) = var("PEERLINK_MAC").and_then(|s| s.parse::<MacAddr>().ok()) {
        c.mac = Some(m);
    }
    if let Some(n) = var("PEERLINK_NAME") {
        c.controller_name = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn parse_file(p: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(p)?;
    Ok(toml::from_str::<Config>(&s)?)
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match parse_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!("ignoring {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}
