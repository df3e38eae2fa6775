//! `flowwatch` agent binary (spec.md §6 CLI surface).
//!
//! Wires together the library crate's pipeline stages: capture on a dedicated OS thread (mirroring
//! the teacher's `ctrlc`-gated `OnlineRuntime` loop), the round-trip fan-out and consumer pool on
//! `tokio`, the admin HTTP surface, and the periodic connection-expiry sweep and config-reload
//! watcher. `env_logger` initialization matches the teacher's example binaries.

mod cli;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use clap::Parser;
use flowwatch_core::admin::{self, AdminState};
use flowwatch_core::capture::{list_interfaces, CaptureHandle};
use flowwatch_core::config::{try_load_config, RuntimeConfig};
use flowwatch_core::fanout::{new_channel, PubSub, RoundTripConsumer};
use flowwatch_core::portpool::PortPoolRegistry;
use flowwatch_core::roundtrip::TraceAccumulator;
use flowwatch_core::sinks::{build_round_trip_sink, LoggingMetricsSink, LoggingTracesSink, MetricsSink, TracesSink};
use flowwatch_core::stats::Stats;

use cli::{Cli, Command};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Ifaces => run_ifaces(),
        Command::Agent { config } => run(Some(config), None),
        Command::Watch {
            protos,
            ifaces,
            console,
            pcap_file,
            no_promisc,
            ipv,
            roundtrips_file,
            roundtrips_size,
            roundtrips_backups,
        } => match cli::synthesize_config(
            &protos,
            &ifaces,
            console,
            pcap_file,
            no_promisc,
            ipv,
            roundtrips_file,
            roundtrips_size,
            roundtrips_backups,
        ) {
            Ok(cfg) => run(None, Some(cfg)),
            Err(e) => {
                eprintln!("ERROR: {}", e);
                1
            }
        },
    };
    std::process::exit(exit_code);
}

fn run_ifaces() -> i32 {
    match list_interfaces() {
        Ok(ifaces) => {
            for iface in ifaces {
                println!("{}", iface);
            }
            0
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            1
        }
    }
}

/// Runs the agent until SIGINT/SIGTERM. Exactly one of `config_path` (for `agent --config`) or
/// `inline_cfg` (for `watch`) is set; the former also enables SIGHUP/`/-/reload`-triggered
/// re-reads and the 30s config-file watcher (spec.md §4.7).
fn run(config_path: Option<PathBuf>, inline_cfg: Option<RuntimeConfig>) -> i32 {
    let cfg = match (&config_path, inline_cfg) {
        (Some(path), _) => match try_load_config(path) {
            Some(cfg) => cfg,
            None => {
                eprintln!("ERROR: failed to load config {:?}", path);
                return 1;
            }
        },
        (None, Some(cfg)) => cfg,
        (None, None) => unreachable!("run() requires a config source"),
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ERROR: failed to start tokio runtime: {}", e);
            return 1;
        }
    };
    rt.block_on(run_async(config_path, cfg))
}

async fn run_async(config_path: Option<PathBuf>, cfg: RuntimeConfig) -> i32 {
    let round_trip_sink = match build_round_trip_sink(&cfg.round_trips) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            eprintln!("ERROR: failed to open round-trip sink: {}", e);
            return 1;
        }
    };
    let stats = Arc::new(Stats::new());
    let pubsub = Arc::new(PubSub::new(64));
    let traces = Arc::new(TraceAccumulator::new());

    let consumers: Vec<Arc<dyn RoundTripConsumer>> =
        vec![round_trip_sink.clone(), stats.clone(), pubsub.clone(), traces.clone()];
    let (rt_tx, dispatcher) = new_channel(consumers);
    let dispatcher = Arc::new(dispatcher);
    let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) * 2;
    let consumer_handles = dispatcher.spawn_pool(worker_count);

    let max_connections = cfg.conntrack.max_connections;
    let conn_expired = cfg.conntrack.conn_expired();
    let max_message_size = 1 << 20;
    let registry = PortPoolRegistry::build(&cfg.protocols, max_connections, conn_expired, max_message_size, None);

    let admin_state = Arc::new(AdminState {
        stats: stats.clone(),
        pubsub: pubsub.clone(),
        registry: RwLock::new(Arc::new(registry)),
        config_path: config_path.clone(),
        max_connections,
        max_message_size,
    });

    let admin_addr: SocketAddr = match cfg.admin.listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("ERROR: invalid admin.listen_addr {:?}: {}", cfg.admin.listen_addr, e);
            return 1;
        }
    };
    let admin_task = {
        let admin_state = admin_state.clone();
        tokio::task::spawn(async move {
            if let Err(e) = admin::serve(admin_addr, admin_state).await {
                log::error!("admin server exited: {}", e);
            }
        })
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            log::warn!("failed to install SIGINT/SIGTERM handler: {}", e);
        }
    }

    let capture_thread = {
        let capture_cfg = cfg.capture.clone();
        let admin_state = admin_state.clone();
        let rt_tx = rt_tx.clone();
        let shutdown = shutdown.clone();
        let stats = stats.clone();
        std::thread::spawn(move || {
            let mut handle = match CaptureHandle::open(&capture_cfg) {
                Ok(h) => h,
                Err(e) => {
                    log::error!("capture open failed: {}", e);
                    shutdown.store(true, Ordering::SeqCst);
                    return Err(());
                }
            };
            handle.run(
                || shutdown.load(Ordering::SeqCst),
                |pkt| {
                    let registry = admin_state.current_registry();
                    let _ = registry.route(pkt.tuple, pkt, &rt_tx, &stats);
                },
            );
            admin_state.stats.record_capture_stats(&handle.stats());
            handle.close();
            Ok(())
        })
    };

    let sweep_task = {
        let admin_state = admin_state.clone();
        let interval = Duration::from_secs(cfg.conntrack.sweep_interval_secs.max(1));
        let shutdown = shutdown.clone();
        let stats = stats.clone();
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let registry = admin_state.current_registry();
                let expired = registry.sweep_expired(Instant::now(), &stats);
                if expired > 0 {
                    log::debug!("expired {} connections", expired);
                }
                for (proto, count) in registry.active_pool_conns() {
                    admin_state.stats.set_active_connections(&proto, count);
                }
            }
        })
    };

    let metrics_task = {
        let stats = stats.clone();
        let interval = Duration::from_secs(cfg.metrics.export_interval_secs.max(1));
        let shutdown = shutdown.clone();
        let sink: Arc<dyn MetricsSink> = Arc::new(LoggingMetricsSink);
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                sink.sink(&stats.drain_snapshot());
            }
            sink.close();
        })
    };

    let traces_task = {
        let traces = traces.clone();
        let interval = Duration::from_secs(cfg.traces.batch_interval_secs.max(1));
        let shutdown = shutdown.clone();
        let sink: Arc<dyn TracesSink> = Arc::new(LoggingTracesSink);
        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                sink.sink(&traces.drain_batch());
            }
            sink.close();
        })
    };

    let reload_watcher = config_path.clone().map(|path| {
        let admin_state = admin_state.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn(async move {
            let mut updated = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(t) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
                    continue;
                };
                if Some(t) == updated {
                    continue;
                }
                if let Some(new_cfg) = try_load_config(&path) {
                    admin::apply_reload(&admin_state, &new_cfg);
                }
                updated = Some(t);
            }
        })
    });

    let sighup_watcher = {
        let admin_state = admin_state.clone();
        let path = config_path.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn(async move {
            let Ok(mut hangup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
                return;
            };
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        log::info!("SIGHUP received, reloading config");
                        if let Some(path) = &path {
                            if let Some(new_cfg) = try_load_config(path) {
                                admin::apply_reload(&admin_state, &new_cfg);
                            }
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        })
    };

    while !shutdown.load(Ordering::SeqCst) && !capture_thread.is_finished() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    shutdown.store(true, Ordering::SeqCst);

    let capture_result = capture_thread.join();
    admin_task.abort();
    sweep_task.abort();
    metrics_task.abort();
    traces_task.abort();
    sighup_watcher.abort();
    if let Some(handle) = reload_watcher {
        handle.abort();
    }
    for handle in consumer_handles {
        handle.abort();
    }
    round_trip_sink.close();

    match capture_result {
        Ok(Ok(())) => 0,
        _ => 1,
    }
}
