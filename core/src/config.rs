//! Configuration options.
//!
//! The agent is configured from a single YAML document (spec.md §6 `agent --config PATH`), or
//! synthesized from CLI flags (the `watch` subcommand). Mirrors the teacher's
//! `config::load_config` discipline: read the file, deserialize with serde, and panic with a
//! descriptive message on malformed input (a `ConfigError` per spec.md §7 is fatal at startup).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Loads a YAML configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let text = fs::read_to_string(path.as_ref())
        .unwrap_or_else(|e| panic!("ERROR: failed to read config {:?}: {}", path.as_ref(), e));
    serde_yaml::from_str(&text).unwrap_or_else(|e| panic!("Invalid config file: {}", e))
}

/// Attempts to reload a config file; used by the 30s file watcher and `POST /-/reload`. Returns
/// `None` (logging the cause) rather than panicking, since a bad reload should leave the previous
/// config active (spec.md §7).
pub fn try_load_config<P: AsRef<Path>>(path: P) -> Option<RuntimeConfig> {
    let text = fs::read_to_string(path.as_ref())
        .map_err(|e| log::error!("config reload: read failed: {}", e))
        .ok()?;
    serde_yaml::from_str(&text)
        .map_err(|e| log::error!("config reload: parse failed, keeping previous config: {}", e))
        .ok()
}

/// Returns a minimal default configuration (offline mode against a small sample pcap), useful for
/// demonstration and tests.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig {
        capture: CaptureConfig {
            ifaces: "any".to_string(),
            pcap_file: None,
            bpf_filter: None,
            promiscuous: true,
            ip_version: IpVersion::Both,
        },
        protocols: vec![],
        conntrack: ConnTrackConfig::default(),
        round_trips: RoundTripsConfig::default(),
        admin: AdminConfig::default(),
        metrics: MetricsConfig::default(),
        traces: TracesConfig::default(),
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub capture: CaptureConfig,
    /// Port routing table fed to the port-pool registry (spec.md §4.2).
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
    #[serde(default)]
    pub conntrack: ConnTrackConfig,
    #[serde(default)]
    pub round_trips: RoundTripsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub traces: TracesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface selector: `"any"` or a regex over interface names.
    #[serde(default = "default_ifaces")]
    pub ifaces: String,
    /// When set, replays this capture file instead of a live interface.
    #[serde(default)]
    pub pcap_file: Option<PathBuf>,
    #[serde(default)]
    pub bpf_filter: Option<String>,
    #[serde(default = "default_true")]
    pub promiscuous: bool,
    #[serde(default)]
    pub ip_version: IpVersion,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
    #[default]
    Both,
}

fn default_ifaces() -> String {
    "any".to_string()
}

fn default_true() -> bool {
    true
}

/// One entry in the port routing table: an L7 protocol name, the server ports it owns, and
/// loosely typed per-protocol options (spec.md §9 "Dynamic options map").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub name: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub options: std::collections::HashMap<String, serde_yaml::Value>,
}

/// Connection tracking settings (spec.md §3 Connection lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnTrackConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Inactivity timeout in seconds. Floored at 60 per spec.md §3.
    #[serde(default = "default_conn_expired_secs")]
    pub conn_expired_secs: u64,
    /// How often the expiry sweep runs, in seconds (spec.md §5: every 60s).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            max_connections: default_max_connections(),
            conn_expired_secs: default_conn_expired_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ConnTrackConfig {
    /// Inactivity timeout with the spec.md §3 floor of 1 minute applied.
    pub fn conn_expired(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.conn_expired_secs.max(60))
    }
}

fn default_max_connections() -> usize {
    100_000
}

fn default_conn_expired_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTripsConfig {
    #[serde(default)]
    pub sink: RoundTripSinkKind,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_size_mb")]
    pub size_mb: u64,
    #[serde(default = "default_backups")]
    pub backups: u32,
}

impl Default for RoundTripsConfig {
    fn default() -> Self {
        RoundTripsConfig {
            sink: RoundTripSinkKind::default(),
            file: None,
            size_mb: default_size_mb(),
            backups: default_backups(),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundTripSinkKind {
    #[default]
    Stdout,
    File,
}

fn default_size_mb() -> u64 {
    100
}

fn default_backups() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            listen_addr: default_admin_addr(),
        }
    }
}

fn default_admin_addr() -> String {
    "127.0.0.1:9898".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            export_interval_secs: default_export_interval(),
        }
    }
}

fn default_export_interval() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracesConfig {
    #[serde(default = "default_batch_interval")]
    pub batch_interval_secs: u64,
}

impl Default for TracesConfig {
    fn default() -> Self {
        TracesConfig {
            batch_interval_secs: default_batch_interval(),
        }
    }
}

fn default_batch_interval() -> u64 {
    5
}
