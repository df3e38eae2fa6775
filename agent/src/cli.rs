//! Command-line surface (spec.md §6). Mirrors the teacher's example binaries (e.g.
//! `examples/log_dns`): `clap`'s derive API plus a thin hand-rolled translation from flags into a
//! [`flowwatch_core::config::RuntimeConfig`].

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flowwatch_core::config::{
    default_config, CaptureConfig, ConnTrackConfig, IpVersion, ProtocolConfig, RoundTripSinkKind,
    RoundTripsConfig, RuntimeConfig,
};

#[derive(Parser)]
#[clap(name = "flowwatch", about = "Passive network-traffic observability agent")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run with a YAML config file; reloads on SIGHUP and `POST /-/reload`.
    Agent {
        #[clap(long)]
        config: PathBuf,
    },
    /// Synthesize a config from flags and run until SIGINT/SIGTERM.
    Watch {
        /// `name;ports[;host]`, repeatable. E.g. `--proto 'http;80,8080'`.
        #[clap(long = "proto", multiple_occurrences = true)]
        protos: Vec<String>,
        #[clap(long, default_value = "any")]
        ifaces: String,
        /// Write round-trips to stdout instead of a file.
        #[clap(long)]
        console: bool,
        #[clap(long)]
        pcap_file: Option<PathBuf>,
        #[clap(long)]
        no_promisc: bool,
        #[clap(long)]
        ipv: Option<String>,
        #[clap(long = "roundtrips.file")]
        roundtrips_file: Option<PathBuf>,
        #[clap(long = "roundtrips.size", default_value = "100")]
        roundtrips_size: u64,
        #[clap(long = "roundtrips.backups", default_value = "3")]
        roundtrips_backups: u32,
    },
    /// List capture-capable interfaces.
    Ifaces,
}

/// Parses one `--proto` value (`name;ports[;host]`) into a [`ProtocolConfig`].
fn parse_proto(spec: &str) -> anyhow::Result<ProtocolConfig> {
    let mut parts = spec.splitn(3, ';');
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("--proto {:?}: missing protocol name", spec))?;
    let ports_spec = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("--proto {:?}: missing ports", spec))?;
    let ports: Vec<u16> = ports_spec
        .split(',')
        .map(|p| p.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("--proto {:?}: invalid port: {}", spec, e))?;
    let mut options = HashMap::new();
    if let Some(host) = parts.next() {
        options.insert("host".to_string(), serde_yaml::Value::String(host.to_string()));
    }
    Ok(ProtocolConfig { name: name.to_string(), ports, options })
}

/// Builds a [`RuntimeConfig`] from `watch`'s flags (spec.md §6 "synthesize config").
pub fn synthesize_config(
    protos: &[String],
    ifaces: &str,
    console: bool,
    pcap_file: Option<PathBuf>,
    no_promisc: bool,
    ipv: Option<String>,
    roundtrips_file: Option<PathBuf>,
    roundtrips_size: u64,
    roundtrips_backups: u32,
) -> anyhow::Result<RuntimeConfig> {
    let protocols = protos.iter().map(|s| parse_proto(s)).collect::<anyhow::Result<Vec<_>>>()?;
    let ip_version = match ipv.as_deref() {
        Some("v4") => IpVersion::V4,
        Some("v6") => IpVersion::V6,
        Some(other) => anyhow::bail!("--ipv: unknown value {:?} (expected v4 or v6)", other),
        None => IpVersion::Both,
    };
    let mut cfg = default_config();
    cfg.capture = CaptureConfig {
        ifaces: ifaces.to_string(),
        pcap_file,
        bpf_filter: None,
        promiscuous: !no_promisc,
        ip_version,
    };
    cfg.protocols = protocols;
    cfg.conntrack = ConnTrackConfig::default();
    cfg.round_trips = RoundTripsConfig {
        sink: if console { RoundTripSinkKind::Stdout } else { RoundTripSinkKind::File },
        file: roundtrips_file,
        size_mb: roundtrips_size,
        backups: roundtrips_backups,
    };
    Ok(cfg)
}
