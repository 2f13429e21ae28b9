//! Event channel from the core to the embedding shell.
//!
//! The management UI subscribes to lifecycle and telemetry pushes here:
//! running/stopped status flips, per-listener start errors, periodic metrics
//! snapshots, and (optionally) realtime log lines. Events are broadcast;
//! slow subscribers lag and miss, they never block the core.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::observe::MetricsPayload;

/// Whether the proxy is accepting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
}

/// An event pushed from the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CoreEvent {
    /// Overall run state changed.
    Status { status: ServerStatus },

    /// One listener failed to start; others keep going.
    ServerStartError { listen_addr: String, error: String },

    /// Periodic metrics snapshot (every 2s while running).
    Metrics { payload: MetricsPayload },

    /// A realtime log line, gated by `show_realtime_logs`.
    LogLine { line: String },

    /// A listener came up.
    ListenerUp { listen_addr: String, protocol: String },

    /// A listener stopped.
    ListenerDown { listen_addr: String, protocol: String },

    /// A listener's accept loop failed and is being restarted.
    ListenerError { listen_addr: String, protocol: String, error: String },
}

/// Broadcast fan-out of [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_status(&self, status: ServerStatus) {
        self.emit(CoreEvent::Status { status });
    }

    pub fn emit_start_error(&self, listen_addr: impl Into<String>, error: impl ToString) {
        self.emit(CoreEvent::ServerStartError {
            listen_addr: listen_addr.into(),
            error: error.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
