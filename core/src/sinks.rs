//! Output sinks: round-trips, metrics, and traces (spec.md §6 "Sinks (consumed)").
//!
//! The round-trip sink is the one sink this crate owns end-to-end (stdout or a rotating file,
//! hand-rolled since nothing in the dependency stack covers size/backup-capped rotation). Metrics
//! and traces sinks are external collaborators per spec.md §1's Out-of-scope list
//! (`update(metric…)`, `push(span)`, `sink(bytes)`); only their interface is carried here, with a
//! logging default standing in for a real remote-write/Jaeger exporter.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::fanout::RoundTripConsumer;
use crate::roundtrip::{MetricsSnapshot, RoundTrip, TraceBatch};

/// A byte-oriented sink for serialized round-trips (spec.md §6: `sink(rt: bytes)`, `close()`).
pub trait RawSink: Send + Sync {
    fn write_line(&self, line: &[u8]);
    fn close(&self);
}

/// Writes one JSON line per round-trip to stdout, locked for the lifetime of the process.
pub struct StdoutSink {
    out: Mutex<io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        StdoutSink { out: Mutex::new(io::stdout()) }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSink for StdoutSink {
    fn write_line(&self, line: &[u8]) {
        let mut out = self.out.lock().unwrap();
        let _ = out.write_all(line);
        let _ = out.write_all(b"\n");
    }

    fn close(&self) {
        let _ = self.out.lock().unwrap().flush();
    }
}

/// A size/backup-capped rotating file writer (spec.md §6: "rotated file or stdout"). When the
/// current file would exceed `max_size_bytes`, it's renamed `path.N` for `N = backups..1` (oldest
/// dropped) and a fresh file is opened at `path`.
pub struct RotatingFileSink {
    path: PathBuf,
    max_size_bytes: u64,
    backups: u32,
    state: Mutex<RotatingState>,
}

struct RotatingState {
    file: File,
    size: u64,
}

impl RotatingFileSink {
    pub fn open(path: PathBuf, max_size_mb: u64, backups: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(RotatingFileSink {
            path,
            max_size_bytes: max_size_mb.max(1) * 1024 * 1024,
            backups,
            state: Mutex::new(RotatingState { file, size }),
        })
    }

    fn rotate(&self, state: &mut RotatingState) -> io::Result<()> {
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            let to = self.backup_path(n + 1);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        if self.backups > 0 {
            let _ = fs::rename(&self.path, self.backup_path(1));
        }
        state.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        state.size = 0;
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut s = self.path.as_os_str().to_owned();
        s.push(format!(".{}", n));
        PathBuf::from(s)
    }
}

impl RawSink for RotatingFileSink {
    fn write_line(&self, line: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.size + line.len() as u64 + 1 > self.max_size_bytes {
            if let Err(e) = self.rotate(&mut state) {
                log::error!("round-trip sink: rotation failed: {}", e);
            }
        }
        if state.file.write_all(line).and_then(|_| state.file.write_all(b"\n")).is_ok() {
            state.size += line.len() as u64 + 1;
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        let _ = state.file.flush();
    }
}

/// Adapts a [`RawSink`] into a [`RoundTripConsumer`] by JSON-serializing each round-trip.
pub struct JsonRoundTripSink {
    inner: Box<dyn RawSink>,
}

impl JsonRoundTripSink {
    pub fn new(inner: Box<dyn RawSink>) -> Self {
        JsonRoundTripSink { inner }
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl RoundTripConsumer for JsonRoundTripSink {
    fn on_round_trip(&self, rt: &RoundTrip) {
        match serde_json::to_vec(rt) {
            Ok(bytes) => self.inner.write_line(&bytes),
            Err(e) => log::debug!("round-trip sink: serialize failed: {}", e),
        }
    }
}

/// Builds the configured round-trip sink (spec.md §6 `round_trips` config).
pub fn build_round_trip_sink(cfg: &crate::config::RoundTripsConfig) -> io::Result<JsonRoundTripSink> {
    use crate::config::RoundTripSinkKind;
    let inner: Box<dyn RawSink> = match cfg.sink {
        RoundTripSinkKind::Stdout => Box::new(StdoutSink::new()),
        RoundTripSinkKind::File => {
            let path = cfg.file.clone().unwrap_or_else(|| Path::new("roundtrips.log").to_path_buf());
            Box::new(RotatingFileSink::open(path, cfg.size_mb, cfg.backups)?)
        }
    };
    Ok(JsonRoundTripSink::new(inner))
}

/// External metrics export collaborator (spec.md §1 Out-of-scope, §6 `sink(write_request) →
/// result`). A real deployment wires this to a Prometheus remote-write or similar endpoint; this
/// crate carries only the interface and a logging default.
pub trait MetricsSink: Send + Sync {
    fn sink(&self, batch: &MetricsSnapshot);
    fn close(&self);
}

/// External trace export collaborator (spec.md §1 Out-of-scope, §6 `sink(traces) → result`).
pub trait TracesSink: Send + Sync {
    fn sink(&self, batch: &TraceBatch);
    fn close(&self);
}

/// Default metrics/traces sinks: log at debug level instead of exporting anywhere. Swapped out by
/// wiring a real implementation where the deployment needs one.
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn sink(&self, batch: &MetricsSnapshot) {
        log::debug!("metrics export: {} samples", batch.samples.len());
    }

    fn close(&self) {}
}

pub struct LoggingTracesSink;

impl TracesSink for LoggingTracesSink {
    fn sink(&self, batch: &TraceBatch) {
        log::debug!("trace export: {} spans", batch.spans.len());
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_free_test_helpers::*;

    mod tempfile_free_test_helpers {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        /// A unique path under the system temp dir, cleaned up by the test that uses it.
        pub fn temp_path(name: &str) -> PathBuf {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            std::env::temp_dir().join(format!("flowwatch-test-{}-{}", n, name))
        }
    }

    #[test]
    fn rotates_when_over_size() {
        let path = temp_path("rt.log");
        let sink = RotatingFileSink::open(path.clone(), 1, 1).unwrap();
        // 1 MB is impractical to actually exceed in a unit test; force the tracked size past the
        // threshold directly and confirm the next write triggers a rotation.
        {
            let mut state = sink.state.lock().unwrap();
            state.size = sink.max_size_bytes;
        }
        sink.write_line(b"hello");
        let backup = sink.backup_path(1);
        assert!(backup.exists());
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(&backup);
    }
}
