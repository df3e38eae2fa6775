//! Capture backend.
//!
//! The out-of-scope "capture backend" collaborator from spec.md §6, realized concretely on top of
//! the `pcap` crate (the same dependency the teacher uses for offline analysis in
//! `runtime::offline`). Produces a push stream of [`L4Packet`](crate::packet::L4Packet)s via a
//! callback, exactly as spec.md §4.1 requires: the callback never blocks the backend.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pcap::{Capture, Device};

use crate::config::CaptureConfig;
use crate::packet::{parse_l4, Direction, L4Packet};

/// Runtime statistics reported by the capture handle, per spec.md §6.
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub iface: String,
    pub packets: u64,
    pub drops: u64,
}

/// Errors opening or reading from the capture backend.
///
/// A `CaptureFailure` at open time is fatal per spec.md §7: the process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open capture backend: {0}")]
    Open(#[source] pcap::Error),
    #[error("no interface matched selector {0:?}")]
    NoMatchingInterface(String),
}

enum Source {
    Live(Capture<pcap::Active>),
    Offline(Capture<pcap::Offline>),
}

/// A capture handle over one interface or one capture file.
pub struct CaptureHandle {
    iface: String,
    source: Source,
    packets: u64,
    drops: u64,
    /// Offline replay: offset so the first recorded packet maps to `Instant::now()` at open time.
    replay_origin: Option<(Instant, Duration)>,
}

impl CaptureHandle {
    /// Opens the capture backend per `config`. Mirrors `runtime::offline::OfflineRuntime::new`
    /// plus a live-mode branch using `pcap::Capture::from_device`.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        if let Some(path) = &config.pcap_file {
            return Self::open_file(path);
        }
        Self::open_live(config)
    }

    fn open_file(path: &Path) -> Result<Self, CaptureError> {
        let cap = Capture::from_file(path).map_err(CaptureError::Open)?;
        Ok(CaptureHandle {
            iface: path.display().to_string(),
            source: Source::Offline(cap),
            packets: 0,
            drops: 0,
            replay_origin: None,
        })
    }

    fn open_live(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let device = select_device(&config.ifaces)?;
        let iface = device.name.clone();
        let mut builder = Capture::from_device(device)
            .map_err(CaptureError::Open)?
            .promisc(config.promiscuous)
            .snaplen(65535)
            .timeout(100);
        if !config.promiscuous {
            builder = builder.promisc(false);
        }
        let mut cap = builder.open().map_err(CaptureError::Open)?;
        if let Some(filter) = &config.bpf_filter {
            cap.filter(filter, true).map_err(CaptureError::Open)?;
        }
        Ok(CaptureHandle {
            iface,
            source: Source::Live(cap),
            packets: 0,
            drops: 0,
            replay_origin: None,
        })
    }

    /// Pumps captured frames through `on_packet` until the source is exhausted (offline) or
    /// `cancelled` returns `true` (live). The callback must not block — it only enqueues work for
    /// the capture dispatch (spec.md §4.1).
    pub fn run(&mut self, mut cancelled: impl FnMut() -> bool, mut on_packet: impl FnMut(L4Packet)) {
        loop {
            if cancelled() {
                return;
            }
            let next = match &mut self.source {
                Source::Live(cap) => cap.next_packet(),
                Source::Offline(cap) => cap.next_packet(),
            };
            let frame = match next {
                Ok(frame) => frame,
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return,
                Err(_) => {
                    self.drops += 1;
                    continue;
                }
            };
            self.packets += 1;
            let timestamp = self.capture_timestamp(frame.header);
            if let Some((tuple, payload)) = parse_l4(frame.data) {
                // Direction is resolved later by the port-pool registry (spec.md §4.2); capture
                // always reports the orientation of the wire frame.
                on_packet(L4Packet {
                    tuple,
                    payload,
                    timestamp,
                    direction: Direction::ClientToServer,
                });
            }
        }
    }

    fn capture_timestamp(&mut self, header: &pcap::PacketHeader) -> Instant {
        let recorded = Duration::new(header.ts.tv_sec as u64, header.ts.tv_usec as u32 * 1000);
        match self.replay_origin {
            Some((origin_instant, origin_recorded)) => {
                origin_instant + recorded.saturating_sub(origin_recorded)
            }
            None => {
                let now = Instant::now();
                self.replay_origin = Some((now, recorded));
                now
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            iface: self.iface.clone(),
            packets: self.packets,
            drops: self.drops,
        }
    }

    pub fn close(self) {}
}

/// Lists available interfaces, for the `ifaces` CLI subcommand (spec.md §6).
pub fn list_interfaces() -> Result<Vec<String>> {
    Ok(Device::list()
        .context("failed to enumerate interfaces")?
        .into_iter()
        .map(|d| d.name)
        .collect())
}

fn select_device(selector: &str) -> Result<Device, CaptureError> {
    if selector == "any" {
        if let Ok(devices) = Device::list() {
            if let Some(d) = devices.into_iter().find(|d| d.name == "any") {
                return Ok(d);
            }
        }
        return Device::lookup()
            .map_err(CaptureError::Open)?
            .ok_or_else(|| CaptureError::NoMatchingInterface(selector.to_string()));
    }
    let re = regex::Regex::new(selector).ok();
    let devices = Device::list().map_err(CaptureError::Open)?;
    devices
        .into_iter()
        .find(|d| {
            d.name == selector || re.as_ref().map(|r| r.is_match(&d.name)).unwrap_or(false)
        })
        .ok_or_else(|| CaptureError::NoMatchingInterface(selector.to_string()))
}
