//! Portico, headless.
//!
//! Loads the TOML configuration, validates it, and runs the supervisor
//! until a shutdown signal arrives. SIGHUP reloads the configuration in
//! place. Exit codes: 0 on a clean shutdown, 2 for an invalid
//! configuration, 3 when the supervisor cannot bring up any listener the
//! configuration asked for.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use portico_proxy::control::ControlApi;
use portico_proxy::engine;
use portico_proxy::sink::{
    MemoryBlacklistStore, MemoryRecordSink, SharedBlacklistStore, SharedRecordSink,
};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_SUPERVISOR: i32 = 3;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(EXIT_SUPERVISOR);
        }
    };

    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => match portico_config::default_config_path() {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "cannot resolve configuration path");
                return EXIT_CONFIG;
            }
        },
    };
    info!(path = %config_path.display(), "loading configuration");

    let snapshot = match load_snapshot(&config_path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return EXIT_CONFIG;
        }
    };

    // Headless runs persist nothing; the desktop shell wires durable stores.
    let sink: SharedRecordSink = Arc::new(MemoryRecordSink::default());
    let store: SharedBlacklistStore = Arc::new(MemoryBlacklistStore::new());

    let supervisor = engine::build(snapshot.clone(), sink.clone(), store);
    let api = ControlApi::new(supervisor, sink, config_path.clone());

    let status = api.start().await;
    let expected = snapshot.http_rules.iter().filter(|r| r.enabled).count()
        + snapshot.ws_rules.iter().filter(|r| r.enabled).count()
        + snapshot.stream.servers.iter().filter(|s| s.enabled).count();
    let up = status.listeners.iter().filter(|l| l.up).count();
    if expected > 0 && up == 0 {
        error!("no listener came up; shutting down");
        api.stop().await;
        return EXIT_SUPERVISOR;
    }
    info!(listeners_up = up, "proxy running");

    wait_for_signals(&api, &config_path).await;

    info!("shutting down");
    api.stop().await;
    EXIT_OK
}

fn load_snapshot(path: &std::path::Path) -> anyhow::Result<Arc<portico_config::Config>> {
    let (raw, _warnings) = portico_config::load(path)?;
    let validated = portico_config::validate(raw)?;
    Ok(Arc::new(validated))
}

#[cfg(unix)]
async fn wait_for_signals(api: &ControlApi, config_path: &std::path::Path) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install signal handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install signal handler");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install signal handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("received SIGINT");
                return;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = hangup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match load_snapshot(config_path) {
                    Ok(snapshot) => {
                        api.supervisor().apply(snapshot).await;
                        info!("configuration reloaded");
                    }
                    Err(e) => {
                        // Keep running with the previous snapshot.
                        warn!(error = %e, "reload rejected, keeping current configuration");
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_api: &ControlApi, _config_path: &std::path::Path) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot wait for ctrl-c");
    }
}
