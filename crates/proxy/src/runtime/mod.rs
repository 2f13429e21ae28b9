//! The runtime supervisor.
//!
//! Consumes published config snapshots and materializes listeners. Start
//! failures are isolated per listener and reported on the event channel
//! without touching the others. Reconfiguration computes a minimum diff
//! keyed by `(listen_addr, protocol)`:
//!
//! - unchanged bind parameters → the new snapshot is swapped into the
//!   existing listener atomically; in-flight traffic keeps its captured view
//! - changed bind parameters (including TLS material) or new listeners →
//!   the old one drains within a bounded grace window and a fresh one starts
//! - removed listeners → stop accepting, drain, close
//!
//! A listener whose accept loop dies is restarted with exponential backoff
//! capped at 30s, surfacing `listener_error` events along the way.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use portico_config::{parse_listen_addr, Config, StreamProtocol};

use crate::context::EngineCtx;
use crate::drain::DRAIN_GRACE;
use crate::events::{CoreEvent, ServerStatus};
use crate::http::{Bindings, HttpListener};
use crate::stream::{StreamListener, StreamSettings};
use crate::tls;
use crate::ws::WsListener;

/// Restart backoff bounds for a crashed accept loop.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Maintenance cadence: pool/limiter/failure sweeps and blacklist refresh.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);
/// Metrics push cadence.
const METRICS_PUSH_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Keys & status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Http,
    Ws,
    Tcp,
    Udp,
}

impl std::fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerProtocol::Http => write!(f, "http"),
            ListenerProtocol::Ws => write!(f, "ws"),
            ListenerProtocol::Tcp => write!(f, "tcp"),
            ListenerProtocol::Udp => write!(f, "udp"),
        }
    }
}

impl From<StreamProtocol> for ListenerProtocol {
    fn from(p: StreamProtocol) -> Self {
        match p {
            StreamProtocol::Tcp => ListenerProtocol::Tcp,
            StreamProtocol::Udp => ListenerProtocol::Udp,
        }
    }
}

/// Identity of a listener across reconfigurations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub addr: String,
    pub protocol: ListenerProtocol,
}

/// Per-listener health as reported to the management UI.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub addr: String,
    pub protocol: ListenerProtocol,
    pub up: bool,
    pub last_error: Option<String>,
}

/// Overall engine status.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub running: bool,
    pub listeners: Vec<ListenerStatus>,
}

// ============================================================================
// Handles
// ============================================================================

struct HttpHandle {
    listener: Arc<HttpListener>,
    task: JoinHandle<()>,
    /// Bind parameters beyond the address: TLS material. A change here
    /// restarts the listener instead of swapping bindings.
    tls_fingerprint: Option<(String, String)>,
}

struct WsHandle {
    listener: Arc<WsListener>,
    task: JoinHandle<()>,
    tls_fingerprint: Option<(String, String)>,
}

struct StreamHandle {
    listener: Arc<StreamListener>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    http: HashMap<ListenerKey, HttpHandle>,
    ws: HashMap<ListenerKey, WsHandle>,
    stream: HashMap<ListenerKey, StreamHandle>,
    maintenance: Vec<JoinHandle<()>>,
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    ctx: Arc<EngineCtx>,
    snapshot: RwLock<Arc<Config>>,
    state: AsyncMutex<RunState>,
    last_errors: DashMap<ListenerKey, String>,
}

impl Supervisor {
    /// Create a supervisor over a validated snapshot. Listeners start on
    /// [`Supervisor::start`].
    pub fn new(ctx: Arc<EngineCtx>, snapshot: Arc<Config>) -> Arc<Self> {
        apply_to_components(&ctx, &snapshot);
        Arc::new(Self {
            ctx,
            snapshot: RwLock::new(snapshot),
            state: AsyncMutex::new(RunState::default()),
            last_errors: DashMap::new(),
        })
    }

    pub fn context(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.snapshot.read().clone()
    }

    /// Start all enabled listeners. Already-running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Status {
        {
            let mut state = self.state.lock().await;
            if !state.running {
                state.running = true;
                self.spawn_maintenance(&mut state);
                let snapshot = self.snapshot();
                self.reconcile(&mut state, &snapshot).await;
                info!(
                    http = state.http.len(),
                    ws = state.ws.len(),
                    stream = state.stream.len(),
                    "supervisor started"
                );
                self.ctx.events.emit_status(ServerStatus::Running);
            }
        }
        self.status().await
    }

    /// Stop everything: cancel accept loops, drain connections within the
    /// grace window, tear down maintenance.
    pub async fn stop(self: &Arc<Self>) -> Status {
        {
            let mut state = self.state.lock().await;
            if state.running {
                state.running = false;

                for task in state.maintenance.drain(..) {
                    task.abort();
                }

                let http = std::mem::take(&mut state.http);
                let ws = std::mem::take(&mut state.ws);
                let stream = std::mem::take(&mut state.stream);
                drop(state);

                for (key, handle) in http {
                    self.stop_http(key, handle).await;
                }
                for (key, handle) in ws {
                    self.stop_ws(key, handle).await;
                }
                for (key, handle) in stream {
                    self.stop_stream(key, handle).await;
                }

                // Flush whatever observation backlog remains.
                self.ctx.observer.flush_once().await;

                info!("supervisor stopped");
                self.ctx.events.emit_status(ServerStatus::Stopped);
            }
        }
        self.status().await
    }

    /// Publish a new snapshot. When running, listeners are diffed against
    /// it; when stopped, the snapshot simply becomes current.
    pub async fn apply(self: &Arc<Self>, snapshot: Arc<Config>) {
        apply_to_components(&self.ctx, &snapshot);
        *self.snapshot.write() = snapshot.clone();

        let mut state = self.state.lock().await;
        if state.running {
            self.reconcile(&mut state, &snapshot).await;
            self.ctx.events.emit_status(ServerStatus::Running);
        }
    }

    /// Current run state and per-listener health.
    pub async fn status(&self) -> Status {
        let state = self.state.lock().await;
        let mut listeners = Vec::new();

        for key in state.http.keys() {
            listeners.push(self.listener_status(key));
        }
        for key in state.ws.keys() {
            listeners.push(self.listener_status(key));
        }
        for key in state.stream.keys() {
            listeners.push(self.listener_status(key));
        }
        // Listeners that failed to start have an error but no handle.
        for entry in self.last_errors.iter() {
            let known = listeners.iter().any(|l| {
                l.addr == entry.key().addr && l.protocol == entry.key().protocol
            });
            if !known {
                listeners.push(ListenerStatus {
                    addr: entry.key().addr.clone(),
                    protocol: entry.key().protocol,
                    up: false,
                    last_error: Some(entry.value().clone()),
                });
            }
        }

        listeners.sort_by(|a, b| a.addr.cmp(&b.addr));
        Status {
            running: state.running,
            listeners,
        }
    }

    fn listener_status(&self, key: &ListenerKey) -> ListenerStatus {
        let last_error = self.last_errors.get(key).map(|e| e.value().clone());
        ListenerStatus {
            addr: key.addr.clone(),
            protocol: key.protocol,
            up: last_error.is_none(),
            last_error,
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    async fn reconcile(self: &Arc<Self>, state: &mut RunState, snapshot: &Arc<Config>) {
        self.reconcile_http(state, snapshot).await;
        self.reconcile_ws(state, snapshot).await;
        self.reconcile_stream(state, snapshot).await;
    }

    async fn reconcile_http(self: &Arc<Self>, state: &mut RunState, snapshot: &Arc<Config>) {
        let mut desired: HashMap<ListenerKey, &portico_config::HttpRule> = HashMap::new();
        for rule in snapshot.http_rules.iter().filter(|r| r.enabled) {
            for addr in &rule.listen_addrs {
                desired.insert(
                    ListenerKey {
                        addr: addr.clone(),
                        protocol: ListenerProtocol::Http,
                    },
                    rule,
                );
            }
        }

        // Stop removed listeners.
        let stale: Vec<ListenerKey> = state
            .http
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = state.http.remove(&key) {
                self.stop_http(key, handle).await;
            }
        }

        for (key, rule) in desired {
            let fingerprint = rule
                .tls
                .as_ref()
                .map(|t| (t.cert_file.clone(), t.key_file.clone()));

            if let Some(handle) = state.http.get(&key) {
                if handle.tls_fingerprint == fingerprint {
                    // Same bind parameters: atomic snapshot swap.
                    handle.listener.swap_bindings(Bindings::new(
                        rule,
                        &snapshot.limits,
                        &snapshot.compression,
                    ));
                    continue;
                }
                // Bind parameters changed: drain and replace.
                if let Some(handle) = state.http.remove(&key) {
                    self.stop_http(key.clone(), handle).await;
                }
            }

            if let Some(handle) = self.start_http(&key, rule, snapshot).await {
                state.http.insert(key, handle);
            }
        }
    }

    async fn reconcile_ws(self: &Arc<Self>, state: &mut RunState, snapshot: &Arc<Config>) {
        let mut desired: HashMap<ListenerKey, &portico_config::WsRule> = HashMap::new();
        if snapshot.ws_enabled {
            for rule in snapshot.ws_rules.iter().filter(|r| r.enabled) {
                for addr in &rule.listen_addrs {
                    desired.insert(
                        ListenerKey {
                            addr: addr.clone(),
                            protocol: ListenerProtocol::Ws,
                        },
                        rule,
                    );
                }
            }
        }

        let stale: Vec<ListenerKey> = state
            .ws
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = state.ws.remove(&key) {
                self.stop_ws(key, handle).await;
            }
        }

        for (key, rule) in desired {
            let fingerprint = rule
                .tls
                .as_ref()
                .map(|t| (t.cert_file.clone(), t.key_file.clone()));

            if let Some(handle) = state.ws.get(&key) {
                if handle.tls_fingerprint == fingerprint {
                    handle.listener.swap_rule(Arc::new(rule.clone()));
                    continue;
                }
                if let Some(handle) = state.ws.remove(&key) {
                    self.stop_ws(key.clone(), handle).await;
                }
            }

            if let Some(handle) = self.start_ws(&key, rule).await {
                state.ws.insert(key, handle);
            }
        }
    }

    async fn reconcile_stream(self: &Arc<Self>, state: &mut RunState, snapshot: &Arc<Config>) {
        let mut desired: HashMap<
            ListenerKey,
            (&portico_config::StreamServer, &portico_config::StreamUpstream),
        > = HashMap::new();

        if snapshot.stream.enabled {
            for server in snapshot.stream.servers.iter().filter(|s| s.enabled) {
                let Some(upstream) = snapshot
                    .stream
                    .upstreams
                    .iter()
                    .find(|u| u.name == server.proxy_pass)
                else {
                    // The validator guarantees the reference; tolerate a
                    // stale snapshot anyway.
                    error!(
                        port = server.listen_port,
                        upstream = %server.proxy_pass,
                        "stream server references unknown upstream"
                    );
                    continue;
                };
                desired.insert(
                    ListenerKey {
                        addr: format!(":{}", server.listen_port),
                        protocol: server.protocol.into(),
                    },
                    (server, upstream),
                );
            }
        }

        let stale: Vec<ListenerKey> = state
            .stream
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = state.stream.remove(&key) {
                self.stop_stream(key, handle).await;
            }
        }

        for (key, (server, upstream)) in desired {
            if let Some(handle) = state.stream.get(&key) {
                // Same port and protocol: swap settings in place.
                handle
                    .listener
                    .swap_settings(StreamSettings::new(server, upstream));
                continue;
            }

            if let Some(handle) = self.start_stream(&key, server, upstream).await {
                state.stream.insert(key, handle);
            }
        }
    }

    // ------------------------------------------------------------------
    // Listener lifecycle
    // ------------------------------------------------------------------

    /// Bind-and-release plus TLS-material check, so start errors surface
    /// immediately instead of inside the supervised retry loop.
    async fn precheck(
        &self,
        key: &ListenerKey,
        tls: Option<&portico_config::TlsConfig>,
    ) -> Result<portico_config::ListenAddr, String> {
        let bind = parse_listen_addr(&key.addr).map_err(|e| e.to_string())?;

        if let Some(tls_cfg) = tls {
            tls::acceptor(&tls_cfg.cert_file, &tls_cfg.key_file, false)
                .map_err(|e| e.to_string())?;
        }

        let probe = TcpListener::bind(bind.addr)
            .await
            .map_err(|e| e.to_string())?;
        drop(probe);

        Ok(bind)
    }

    fn report_start_failure(&self, key: &ListenerKey, error: String) {
        error!(addr = %key.addr, protocol = %key.protocol, error = %error, "listener failed to start");
        self.ctx.observer.push_log(format!(
            "[NODE {}] listener failed to start: {}",
            key.addr, error
        ));
        self.ctx.events.emit_start_error(key.addr.clone(), &error);
        self.last_errors.insert(key.clone(), error);
    }

    fn mark_started(&self, key: &ListenerKey) {
        self.last_errors.remove(key);
        self.ctx.events.emit(CoreEvent::ListenerUp {
            listen_addr: key.addr.clone(),
            protocol: key.protocol.to_string(),
        });
    }

    async fn start_http(
        self: &Arc<Self>,
        key: &ListenerKey,
        rule: &portico_config::HttpRule,
        snapshot: &Arc<Config>,
    ) -> Option<HttpHandle> {
        let bind = match self.precheck(key, rule.tls.as_ref()).await {
            Ok(bind) => bind,
            Err(e) => {
                self.report_start_failure(key, e);
                return None;
            }
        };

        let listener = HttpListener::new(
            key.addr.clone(),
            bind,
            rule,
            &snapshot.limits,
            &snapshot.compression,
            self.ctx.clone(),
        );
        let task = self.supervise(key.clone(), {
            let listener = listener.clone();
            move || {
                let listener = listener.clone();
                async move { listener.serve().await }
            }
        });
        self.mark_started(key);

        Some(HttpHandle {
            listener,
            task,
            tls_fingerprint: rule
                .tls
                .as_ref()
                .map(|t| (t.cert_file.clone(), t.key_file.clone())),
        })
    }

    async fn start_ws(
        self: &Arc<Self>,
        key: &ListenerKey,
        rule: &portico_config::WsRule,
    ) -> Option<WsHandle> {
        let bind = match self.precheck(key, rule.tls.as_ref()).await {
            Ok(bind) => bind,
            Err(e) => {
                self.report_start_failure(key, e);
                return None;
            }
        };

        let listener = WsListener::new(key.addr.clone(), bind, rule, self.ctx.clone());
        let task = self.supervise(key.clone(), {
            let listener = listener.clone();
            move || {
                let listener = listener.clone();
                async move { listener.serve().await }
            }
        });
        self.mark_started(key);

        Some(WsHandle {
            listener,
            task,
            tls_fingerprint: rule
                .tls
                .as_ref()
                .map(|t| (t.cert_file.clone(), t.key_file.clone())),
        })
    }

    async fn start_stream(
        self: &Arc<Self>,
        key: &ListenerKey,
        server: &portico_config::StreamServer,
        upstream: &portico_config::StreamUpstream,
    ) -> Option<StreamHandle> {
        // UDP has no bind probe that is side-effect free; TCP gets one.
        if server.protocol == StreamProtocol::Tcp {
            if let Err(e) = self.precheck(key, None).await {
                self.report_start_failure(key, e);
                return None;
            }
        }

        let listener = StreamListener::new(server, upstream, self.ctx.clone());
        let task = self.supervise(key.clone(), {
            let listener = listener.clone();
            move || {
                let listener = listener.clone();
                async move { listener.serve().await }
            }
        });
        self.mark_started(key);

        Some(StreamHandle { listener, task })
    }

    /// Run a listener's accept loop under restart-with-backoff supervision.
    fn supervise<F, Fut>(self: &Arc<Self>, key: ListenerKey, mut factory: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::errors::ProxyError>> + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                match factory().await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(
                            addr = %key.addr,
                            protocol = %key.protocol,
                            error = %e,
                            backoff_ms = backoff.as_millis(),
                            "listener failed, restarting"
                        );
                        supervisor.last_errors.insert(key.clone(), e.to_string());
                        supervisor.ctx.events.emit(CoreEvent::ListenerError {
                            listen_addr: key.addr.clone(),
                            protocol: key.protocol.to_string(),
                            error: e.to_string(),
                        });
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        })
    }

    async fn stop_http(&self, key: ListenerKey, handle: HttpHandle) {
        handle.task.abort();
        handle.listener.drain.wait(DRAIN_GRACE).await;
        self.emit_down(&key);
    }

    async fn stop_ws(&self, key: ListenerKey, handle: WsHandle) {
        handle.task.abort();
        handle.listener.drain.wait(DRAIN_GRACE).await;
        self.emit_down(&key);
    }

    async fn stop_stream(&self, key: ListenerKey, handle: StreamHandle) {
        handle.task.abort();
        handle.listener.drain.wait(DRAIN_GRACE).await;
        self.emit_down(&key);
    }

    fn emit_down(&self, key: &ListenerKey) {
        info!(addr = %key.addr, protocol = %key.protocol, "listener stopped");
        self.ctx.events.emit(CoreEvent::ListenerDown {
            listen_addr: key.addr.clone(),
            protocol: key.protocol.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn spawn_maintenance(self: &Arc<Self>, state: &mut RunState) {
        // Record flusher.
        state
            .maintenance
            .push(tokio::spawn(self.ctx.observer.clone().run_flusher()));

        // Periodic metrics push.
        let ctx = self.ctx.clone();
        state.maintenance.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_PUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                ctx.events.emit(CoreEvent::Metrics {
                    payload: ctx.observer.metrics(),
                });
            }
        }));

        // Sweeps: pool idles, selector failure entries and stale cursors,
        // per-listener rate tables, blacklist cache.
        let supervisor = self.clone();
        state.maintenance.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;

                supervisor.ctx.pool.sweep();

                let snapshot = supervisor.snapshot();
                let route_keys: Vec<&str> = snapshot
                    .http_rules
                    .iter()
                    .flat_map(|r| r.routes.iter().map(|rt| rt.id.as_str()))
                    .collect();
                supervisor.ctx.selector.sweep(&route_keys);

                let limiters: Vec<_> = {
                    let state = supervisor.state.lock().await;
                    state
                        .http
                        .values()
                        .filter_map(|h| h.listener.bindings().limiter.clone())
                        .collect()
                };
                for limiter in limiters {
                    limiter.sweep();
                }

                supervisor.ctx.access.refresh_blacklist().await;
            }
        }));
    }
}

/// Push snapshot-derived state into the shared components.
fn apply_to_components(ctx: &Arc<EngineCtx>, snapshot: &Arc<Config>) {
    ctx.access.apply(&snapshot.access);
    ctx.pool.apply_limits(&snapshot.limits);
    ctx.observer.apply(
        snapshot.show_realtime_logs,
        snapshot.realtime_logs_only_errors,
    );
}
