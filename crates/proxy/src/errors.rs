//! Engine error taxonomy.
//!
//! Failures within a request are terminal for that request only; the handler
//! maps them to a client-visible status, emits an observation tagged with the
//! stage that failed, and releases its resources. Listener-level failures are
//! handled by the supervisor (restart with backoff), never by request code.

use std::time::Duration;
use thiserror::Error;

/// Why a request was denied at the head of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Blocked by access control (blacklist or no allow rule matched).
    Access,
    /// Token bucket empty or client banned.
    RateLimited,
    /// Basic-auth credentials missing or wrong.
    Auth,
}

/// Which upstream timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Read,
}

/// Stages of the per-request state machine, used to tag failures in
/// observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Accepted,
    Authorized,
    Matched,
    Transformed,
    UpstreamAcquired,
    Forwarding,
    Responding,
    Completed,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Accepted => "accepted",
            RequestStage::Authorized => "authorized",
            RequestStage::Matched => "matched",
            RequestStage::Transformed => "transformed",
            RequestStage::UpstreamAcquired => "upstream_acquired",
            RequestStage::Forwarding => "forwarding",
            RequestStage::Responding => "responding",
            RequestStage::Completed => "completed",
        }
    }
}

/// Errors surfaced by the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bind {addr} failed: {reason}")]
    Bind { addr: String, reason: String },

    #[error("TLS error: {reason}")]
    Tls { reason: String },

    #[error("denied: {0:?}")]
    Denied(DenyReason),

    #[error("no matching route")]
    RouteMiss,

    #[error("no upstream available after {after_retries} retries")]
    UpstreamUnavailable { after_retries: usize },

    #[error("upstream {0:?} timeout after {1:?}")]
    UpstreamTimeout(TimeoutPhase, Duration),

    #[error("body exceeds configured limit")]
    PayloadTooLarge,

    #[error("bad upstream response: {0}")]
    UpstreamProtocol(String),

    #[error("shutting down")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The HTTP status reported to the client for this failure.
    pub fn status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            ProxyError::Denied(DenyReason::Access) => StatusCode::FORBIDDEN,
            ProxyError::Denied(DenyReason::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Denied(DenyReason::Auth) => StatusCode::UNAUTHORIZED,
            ProxyError::RouteMiss => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(..) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Bind { .. }
            | ProxyError::Tls { .. }
            | ProxyError::Cancelled
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> RequestStage {
        match self {
            ProxyError::Denied(_) => RequestStage::Authorized,
            ProxyError::RouteMiss => RequestStage::Matched,
            ProxyError::PayloadTooLarge => RequestStage::Transformed,
            ProxyError::UpstreamUnavailable { .. } => RequestStage::UpstreamAcquired,
            ProxyError::UpstreamTimeout(TimeoutPhase::Connect, _) => RequestStage::UpstreamAcquired,
            ProxyError::UpstreamTimeout(TimeoutPhase::Read, _) => RequestStage::Forwarding,
            ProxyError::UpstreamProtocol(_) => RequestStage::Forwarding,
            ProxyError::Bind { .. } | ProxyError::Tls { .. } => RequestStage::Accepted,
            ProxyError::Cancelled => RequestStage::Accepted,
            ProxyError::Io(_) => RequestStage::Responding,
        }
    }
}
