//! Portico proxy engine.
//!
//! A hot-reloadable, multi-listener reverse proxy core forwarding traffic at
//! three layers:
//!
//! - **HTTP(S)**: routing, basic auth, rate limiting, body transformation,
//!   compression, pooled upstreams with weighted round-robin and passive
//!   failover, static file serving
//! - **WebSocket**: upgrade handling and bidirectional frame relay with
//!   heartbeat
//! - **Stream**: raw TCP splice and session-tracked UDP relay over
//!   consistent-hash upstream groups
//!
//! The [`runtime::Supervisor`] materializes listeners from validated
//! [`portico_config::Config`] snapshots and applies reconfiguration without
//! dropping healthy traffic; [`control::ControlApi`] is the management
//! surface; [`observe::Observer`] emits metrics and logs continuously.
//!
//! # Example
//!
//! ```ignore
//! use portico_proxy::{control::ControlApi, engine, sink};
//! use std::sync::Arc;
//!
//! let (cfg, _warnings) = portico_config::load(&path)?;
//! let snapshot = Arc::new(portico_config::validate(cfg)?);
//!
//! let record_sink: sink::SharedRecordSink = Arc::new(sink::MemoryRecordSink::default());
//! let blacklist: sink::SharedBlacklistStore = Arc::new(sink::MemoryBlacklistStore::new());
//!
//! let supervisor = engine::build(snapshot, record_sink.clone(), blacklist);
//! let api = ControlApi::new(supervisor, record_sink, path);
//! api.start().await;
//! ```

pub mod access;
pub mod body;
pub mod context;
pub mod control;
pub mod drain;
pub mod engine;
pub mod errors;
pub mod events;
pub mod http;
pub mod limit;
pub mod observe;
pub mod routing;
pub mod runtime;
pub mod sink;
pub mod stream;
pub mod tls;
pub mod transform;
pub mod upstream;
pub mod ws;

pub use control::ControlApi;
pub use errors::{DenyReason, ProxyError, RequestStage};
pub use events::{CoreEvent, EventBus, ServerStatus};
pub use observe::{MetricsPayload, Observer};
pub use runtime::{ListenerProtocol, ListenerStatus, Status, Supervisor};
pub use sink::{
    BlacklistEntry, BlacklistStore, MemoryBlacklistStore, MemoryRecordSink, RecordSink,
    RequestRecord,
};
