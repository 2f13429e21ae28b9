//! Configuration data model.
//!
//! This is the typed tree the validator publishes as an immutable snapshot.
//! Field names match the persisted TOML document (snake_case on the wire);
//! optional wire fields resolve to the documented defaults here, so every
//! component downstream of the validator can assume defaults are filled in.

use portico_common::{RouteId, RuleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

fn default_path() -> String {
    "/".to_string()
}

fn default_weight() -> u32 {
    1
}

// ============================================================================
// Top-level config
// ============================================================================

/// A full configuration snapshot.
///
/// Created once by the validator, shared read-only by all running listeners,
/// and superseded atomically by the next snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP(S) listen rules, in declaration order.
    #[serde(default)]
    pub http_rules: Vec<HttpRule>,

    /// Master switch for the WebSocket engine.
    #[serde(default)]
    pub ws_enabled: bool,

    /// WebSocket listen rules, in declaration order.
    #[serde(default)]
    pub ws_rules: Vec<WsRule>,

    /// Raw TCP/UDP forwarding.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Access-control policy shared by all protocols.
    #[serde(default)]
    pub access: AccessConfig,

    /// Body-size, timeout, and pool limits.
    #[serde(default)]
    pub limits: Limits,

    /// Response compression policy.
    #[serde(default)]
    pub compression: Compression,

    /// Push per-request log lines on the event channel.
    #[serde(default = "default_true")]
    pub show_realtime_logs: bool,

    /// Restrict pushed log lines to errors only.
    #[serde(default)]
    pub realtime_logs_only_errors: bool,
}

// ============================================================================
// HTTP rules
// ============================================================================

/// One HTTP(S) listener group: a set of bind addresses sharing TLS material,
/// auth, rate limits, and an ordered route table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRule {
    /// Stable id; filled by the validator when blank.
    #[serde(default)]
    pub id: RuleId,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Socket addresses to bind (`"0.0.0.0:8443"`, `"[::]:8443"`, or the
    /// `":8443"` wildcard shorthand).
    #[serde(default)]
    pub listen_addrs: Vec<String>,

    /// Legacy single-address field; the validator promotes it into
    /// `listen_addrs` and clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,

    /// TLS termination material. Presence switches the listener to HTTPS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// HTTP basic authentication for every route that does not opt out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,

    /// Per-client-IP token-bucket limits for this listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// Route table, in declaration order. Order breaks prefix-length ties.
    #[serde(default)]
    pub routes: Vec<HttpRoute>,
}

/// TLS certificate/key pair for a listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Basic-auth credentials attached to a listen rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
    /// Forward the client's `Authorization` header upstream. Off by default;
    /// credentials are stripped before forwarding.
    #[serde(default)]
    pub forward: bool,
}

/// Token-bucket rate limit keyed by client IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained requests per second (bucket refill rate). Must be >= 1.
    pub rps: u32,
    /// Bucket capacity (short bursts above `rps`). Must be >= 1.
    pub burst: u32,
    /// Ban window applied after a rejection; 0 disables banning.
    #[serde(default)]
    pub ban_seconds: u64,
}

/// One route inside an [`HttpRule`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRoute {
    /// Stable id; filled by the validator when blank.
    #[serde(default)]
    pub id: RouteId,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host constraint: exact (`api.example.com`) or wildcard suffix
    /// (`*.example.com`). Unset matches any host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Path prefix; normalized to start with `/`. The longest matching
    /// prefix wins.
    #[serde(default = "default_path")]
    pub path: String,

    /// Allowed methods (uppercase). Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Headers that must be present. A value of `*` matches any non-empty
    /// value; names compare case-insensitively.
    #[serde(default)]
    pub required_headers: BTreeMap<String, String>,

    /// Skip the rule's basic auth for this route.
    #[serde(default)]
    pub exclude_basic_auth: bool,

    /// Follow upstream 30x responses internally instead of relaying them.
    #[serde(default)]
    pub follow_redirects: bool,

    /// Rewrite the matched prefix to this one before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_pass_path: Option<String>,

    /// Serve files from this directory before consulting upstreams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<String>,

    /// Headers set on the upstream request; values support `$remote_addr`,
    /// `$proxy_add_x_forwarded_for`, `$scheme`, and `$host` expansion.
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,

    /// Headers removed from both the upstream request and the response.
    #[serde(default)]
    pub remove_headers: Vec<String>,

    /// Ordered regex rewrites applied to the request URL; the first enabled
    /// matching rule applies.
    #[serde(default)]
    pub url_rewrites: Vec<UrlRewrite>,

    /// Substitutions applied to the request body.
    #[serde(default)]
    pub request_body_replace: Vec<BodyReplace>,

    /// Substitutions applied to the response body.
    #[serde(default)]
    pub response_body_replace: Vec<BodyReplace>,

    /// Weighted upstream targets. `$server_port` inside a URL expands to the
    /// listener's bound port.
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
}

/// A weighted upstream target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    /// Origin URL (`http://` or `https://`).
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// A single URL rewrite rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlRewrite {
    /// Regular expression matched against the request URI.
    pub pattern: String,
    /// Replacement, with `$1`-style capture references.
    pub replacement: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A body substitution rule (literal or regex).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyReplace {
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub use_regex: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restrict the rule to responses whose Content-Type contains one of
    /// these substrings. Empty applies to any textual body.
    #[serde(default)]
    pub content_types: Vec<String>,
}

// ============================================================================
// WebSocket rules
// ============================================================================

/// A WebSocket listener group. Mirrors [`HttpRule`] with a reduced route
/// shape: path prefix to upstream URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsRule {
    #[serde(default)]
    pub id: RuleId,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub listen_addrs: Vec<String>,

    /// Legacy single-address field; promoted by the validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Routes in declaration order; longest path prefix wins.
    #[serde(default)]
    pub routes: Vec<WsRoute>,

    /// Heartbeat ping interval towards the client.
    #[serde(default = "WsRule::default_ping_interval")]
    pub ping_interval_sec: u64,

    /// Close the relay when no pong arrives within this window.
    #[serde(default = "WsRule::default_pong_timeout")]
    pub pong_timeout_sec: u64,
}

impl WsRule {
    fn default_ping_interval() -> u64 {
        30
    }

    fn default_pong_timeout() -> u64 {
        90
    }
}

/// A WebSocket route: path prefix to upstream URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsRoute {
    #[serde(default = "default_path")]
    pub path: String,
    /// `ws://` or `wss://` upstream endpoint.
    pub upstream_url: String,
}

// ============================================================================
// Stream (TCP/UDP) config
// ============================================================================

/// Layer-4 forwarding configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Named upstream groups referenced by `servers[*].proxy_pass`.
    #[serde(default)]
    pub upstreams: Vec<StreamUpstream>,

    /// Listening servers.
    #[serde(default)]
    pub servers: Vec<StreamServer>,
}

/// A named group of weighted `host:port` members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUpstream {
    pub name: String,

    /// Selection key. `$remote_addr` (the default) hashes the client address
    /// onto a consistent ring; other values are ignored and fall back to the
    /// same behavior.
    #[serde(default = "StreamUpstream::default_hash_key")]
    pub hash_key: String,

    /// Reserved flag carried from older configs; parsed but unused because
    /// consistent hashing is the only selection mode.
    #[serde(default = "default_true")]
    pub consistent: bool,

    #[serde(default)]
    pub members: Vec<StreamMember>,
}

impl StreamUpstream {
    fn default_hash_key() -> String {
        "$remote_addr".to_string()
    }
}

/// One `host:port` member of a stream upstream group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMember {
    pub addr: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Transport protocol of a stream server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamProtocol::Tcp => write!(f, "tcp"),
            StreamProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// A stream listener forwarding to a named upstream group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamServer {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub listen_port: u16,

    #[serde(default)]
    pub protocol: StreamProtocol,

    /// Name of the upstream group to forward to.
    pub proxy_pass: String,

    /// Dial timeout (`"10s"`, `"5m"`, bare seconds).
    #[serde(default = "StreamServer::default_connect_timeout")]
    pub connect_timeout: String,

    /// Tear the session down after this long with no bytes in either
    /// direction.
    #[serde(default = "StreamServer::default_idle_timeout")]
    pub idle_timeout: String,
}

impl StreamServer {
    fn default_connect_timeout() -> String {
        "10s".to_string()
    }

    fn default_idle_timeout() -> String {
        "600s".to_string()
    }
}

// ============================================================================
// Access control
// ============================================================================

/// Allow/deny policy evaluated before anything else touches a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Apply the policy to HTTP listeners.
    #[serde(default = "default_true")]
    pub http_enabled: bool,

    /// Apply the policy to WebSocket listeners.
    #[serde(default = "default_true")]
    pub ws_enabled: bool,

    /// Apply the policy to stream listeners.
    #[serde(default = "default_true")]
    pub stream_enabled: bool,

    /// Allow RFC1918 / loopback / link-local clients.
    #[serde(default = "default_true")]
    pub allow_all_lan: bool,

    /// Allow every client regardless of origin (blacklist still applies).
    #[serde(default)]
    pub allow_all_public: bool,

    /// Additional allowed sources: exact IPs or CIDR blocks.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            http_enabled: true,
            ws_enabled: true,
            stream_enabled: true,
            allow_all_lan: true,
            allow_all_public: false,
            whitelist: Vec::new(),
        }
    }
}

// ============================================================================
// Limits & compression
// ============================================================================

/// Body-size, timeout, and connection-pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Cap on a buffered request body, in bytes.
    #[serde(default = "Limits::default_max_request_body")]
    pub max_request_body: usize,

    /// Cap on a buffered response body, in bytes.
    #[serde(default = "Limits::default_max_response_body")]
    pub max_response_body: usize,

    /// Upstream dial timeout.
    #[serde(default = "Limits::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle-between-bytes read timeout; receiving data resets it.
    #[serde(default = "Limits::default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Idle connections kept per upstream origin.
    #[serde(default = "Limits::default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Evict pooled connections idle longer than this.
    #[serde(default = "Limits::default_pool_idle_timeout_sec")]
    pub pool_idle_timeout_sec: u64,

    /// Offer h2 on TLS listeners and multiplex pooled upstream connections.
    #[serde(default)]
    pub enable_http2: bool,
}

impl Limits {
    fn default_max_request_body() -> usize {
        16 * 1024 * 1024
    }

    fn default_max_response_body() -> usize {
        32 * 1024 * 1024
    }

    fn default_connect_timeout_ms() -> u64 {
        10_000
    }

    fn default_read_timeout_ms() -> u64 {
        60_000
    }

    fn default_pool_max_idle() -> usize {
        32
    }

    fn default_pool_idle_timeout_sec() -> u64 {
        90
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_request_body: Self::default_max_request_body(),
            max_response_body: Self::default_max_response_body(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            pool_max_idle: Self::default_pool_max_idle(),
            pool_idle_timeout_sec: Self::default_pool_idle_timeout_sec(),
            enable_http2: false,
        }
    }
}

/// Response compression policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compression {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub gzip: GzipConfig,

    #[serde(default)]
    pub brotli: BrotliConfig,

    /// Skip bodies shorter than this many bytes.
    #[serde(default = "Compression::default_min_length")]
    pub min_length: usize,
}

impl Compression {
    fn default_min_length() -> usize {
        1024
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            enabled: false,
            gzip: GzipConfig::default(),
            brotli: BrotliConfig::default(),
            min_length: Self::default_min_length(),
        }
    }
}

/// Gzip settings; level is clamped to 1..=9 by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GzipConfig {
    #[serde(default = "default_true")]
    pub on: bool,
    #[serde(default = "GzipConfig::default_level")]
    pub level: u32,
}

impl GzipConfig {
    fn default_level() -> u32 {
        6
    }
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            on: true,
            level: Self::default_level(),
        }
    }
}

/// Brotli settings; level is clamped to 0..=11 by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrotliConfig {
    #[serde(default = "default_true")]
    pub on: bool,
    #[serde(default = "BrotliConfig::default_level")]
    pub level: u32,
}

impl BrotliConfig {
    fn default_level() -> u32 {
        6
    }
}

impl Default for BrotliConfig {
    fn default() -> Self {
        Self {
            on: true,
            level: Self::default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_resolves_defaults() {
        let cfg: Config = toml::from_str("").expect("empty config parses");
        assert!(cfg.http_rules.is_empty());
        assert!(cfg.access.allow_all_lan);
        assert!(!cfg.access.allow_all_public);
        assert_eq!(cfg.limits.pool_max_idle, 32);
        assert_eq!(cfg.compression.min_length, 1024);
        assert!(cfg.show_realtime_logs);
    }

    #[test]
    fn rule_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [[http_rules]]
            listen_addrs = [":8080"]

            [[http_rules.routes]]
            [[http_rules.routes.upstreams]]
            url = "http://127.0.0.1:3000"
            "#,
        )
        .expect("parses");

        let rule = &cfg.http_rules[0];
        assert!(rule.enabled);
        assert!(rule.tls.is_none());
        let route = &rule.routes[0];
        assert_eq!(route.path, "/");
        assert!(route.enabled);
        assert_eq!(route.upstreams[0].weight, 1);
    }

    #[test]
    fn stream_protocol_wire_format() {
        let cfg: Config = toml::from_str(
            r#"
            [stream]
            enabled = true

            [[stream.upstreams]]
            name = "redis"
            members = [{ addr = "10.0.0.1:6379" }]

            [[stream.servers]]
            listen_port = 50001
            protocol = "udp"
            proxy_pass = "redis"
            "#,
        )
        .expect("parses");

        assert_eq!(cfg.stream.servers[0].protocol, StreamProtocol::Udp);
        assert_eq!(cfg.stream.upstreams[0].hash_key, "$remote_addr");
        assert_eq!(cfg.stream.servers[0].connect_timeout, "10s");
    }

    #[test]
    fn serialization_round_trips() {
        let cfg: Config = toml::from_str(
            r#"
            ws_enabled = true

            [[ws_rules]]
            listen_addrs = [":9000"]
            routes = [{ path = "/chat", upstream_url = "ws://127.0.0.1:9001" }]
            "#,
        )
        .expect("parses");

        let text = toml::to_string(&cfg).expect("serializes");
        let again: Config = toml::from_str(&text).expect("reparses");
        assert_eq!(cfg, again);
    }
}
