//! Observation: per-request records, rolling in-memory metrics, and batched
//! persistence.
//!
//! Every terminal request event lands here exactly once. The observer keeps
//! two bounded time-series tables per listener (second granularity over a
//! 12h window, minute granularity over 24h), latency percentiles from a
//! fixed-size reservoir, and top-K error counters; it also feeds a bounded
//! queue that a background task flushes to the external sink in batches.
//! Sink trouble never reaches request handlers: the queue drops its oldest
//! records and counts them.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::events::{CoreEvent, EventBus};
use crate::sink::{RequestRecord, SharedRecordSink};

/// Aggregate series key covering all listeners.
pub const ALL_LISTENERS: &str = "all";

/// Rolling window of the second-granularity table.
const SECOND_WINDOW: i64 = 43_200; // 12h
/// Rolling window of the minute-granularity table.
const MINUTE_WINDOW: i64 = 86_400; // 24h
/// Latency samples kept per listener for percentile estimates.
const RESERVOIR_SLOTS: usize = 512;
/// Error counters tracked per listener before pruning.
const MAX_ERROR_KEYS: usize = 256;
/// Reported top-K size.
const TOP_K: usize = 10;

/// Pending-record queue bound.
const QUEUE_CAPACITY: usize = 50_000;
/// Flush once this many records are pending.
const FLUSH_BATCH: usize = 2_000;
/// Or once this much time has passed with records pending.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// In-memory log ring size.
const LOG_RING: usize = 3_000;

/// Metrics snapshot cache.
const METRICS_CACHE_TTL: Duration = Duration::from_millis(500);

// ============================================================================
// Series structures
// ============================================================================

#[derive(Debug, Default, Clone)]
struct Bucket {
    count: i64,
    s2xx: i64,
    s3xx: i64,
    s4xx: i64,
    s5xx: i64,
    err: i64,
    latency_sum: f64,
    latency_max: f64,
}

impl Bucket {
    fn add(&mut self, status: u16, latency_ms: f64) {
        self.count += 1;
        match status {
            200..=299 => self.s2xx += 1,
            300..=399 => self.s3xx += 1,
            400..=499 => self.s4xx += 1,
            s if s >= 500 => self.s5xx += 1,
            _ => self.err += 1,
        }
        if latency_ms.is_finite() {
            let v = latency_ms.max(0.0);
            self.latency_sum += v;
            self.latency_max = self.latency_max.max(v);
        }
    }
}

/// Sliding reservoir of the most recent latency samples.
struct Reservoir {
    samples: Vec<f64>,
    next: usize,
    filled: bool,
}

impl Reservoir {
    fn new() -> Self {
        Self {
            samples: vec![0.0; RESERVOIR_SLOTS],
            next: 0,
            filled: false,
        }
    }

    fn push(&mut self, latency_ms: f64) {
        self.samples[self.next] = latency_ms;
        self.next = (self.next + 1) % self.samples.len();
        if self.next == 0 {
            self.filled = true;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        let len = if self.filled { self.samples.len() } else { self.next };
        if len == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..len].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((len as f64 * p).ceil() as usize).clamp(1, len) - 1;
        sorted[idx]
    }
}

struct ListenerSeries {
    per_sec: BTreeMap<i64, Bucket>,
    per_min: BTreeMap<i64, Bucket>,
    reservoir: Reservoir,
    route_errors: HashMap<String, u64>,
    upstream_errors: HashMap<String, u64>,
}

impl ListenerSeries {
    fn new() -> Self {
        Self {
            per_sec: BTreeMap::new(),
            per_min: BTreeMap::new(),
            reservoir: Reservoir::new(),
            route_errors: HashMap::new(),
            upstream_errors: HashMap::new(),
        }
    }

    fn add(&mut self, record: &RequestRecord) {
        let ts = record.timestamp;
        self.per_sec.entry(ts).or_default().add(record.status, record.latency_ms);
        self.per_min
            .entry((ts / 60) * 60)
            .or_default()
            .add(record.status, record.latency_ms);
        trim_older(&mut self.per_sec, ts - SECOND_WINDOW);
        trim_older(&mut self.per_min, ts - MINUTE_WINDOW);

        self.reservoir.push(record.latency_ms.max(0.0));

        if record.status >= 400 || record.status == 0 {
            if !record.route_id.is_empty() {
                bump_bounded(&mut self.route_errors, &record.route_id);
            }
            if !record.upstream.is_empty() {
                bump_bounded(&mut self.upstream_errors, &record.upstream);
            }
        }
    }
}

fn trim_older(buckets: &mut BTreeMap<i64, Bucket>, min_ts: i64) {
    while let Some((&first, _)) = buckets.iter().next() {
        if first < min_ts {
            buckets.remove(&first);
        } else {
            break;
        }
    }
}

fn bump_bounded(counters: &mut HashMap<String, u64>, key: &str) {
    if counters.len() >= MAX_ERROR_KEYS && !counters.contains_key(key) {
        // Make room by dropping the smallest counter.
        if let Some(victim) = counters
            .iter()
            .min_by_key(|(_, v)| **v)
            .map(|(k, _)| k.clone())
        {
            counters.remove(&victim);
        }
    }
    *counters.entry(key.to_string()).or_insert(0) += 1;
}

// ============================================================================
// Payload types
// ============================================================================

/// One series rendered as parallel arrays, the shape chart frontends want.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeriesPayload {
    pub timestamps: Vec<i64>,
    pub counts: Vec<i64>,
    pub s2xx: Vec<i64>,
    pub s3xx: Vec<i64>,
    pub s4xx: Vec<i64>,
    pub s5xx: Vec<i64>,
    pub err: Vec<i64>,
    #[serde(rename = "avgLatencyMs")]
    pub avg_latency_ms: Vec<f64>,
    #[serde(rename = "maxLatencyMs")]
    pub max_latency_ms: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
}

/// Percentiles and error leaders for one listener.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerStats {
    pub p95: f64,
    pub p99: f64,
    #[serde(rename = "topRouteErrors")]
    pub top_route_errors: Vec<KeyCount>,
    #[serde(rename = "topUpstreamErrors")]
    pub top_upstream_errors: Vec<KeyCount>,
}

/// The full metrics snapshot pushed on the event channel and served to the
/// management UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsPayload {
    #[serde(rename = "windowSeconds")]
    pub window_seconds: i64,
    #[serde(rename = "minuteWindowSeconds")]
    pub minute_window_seconds: i64,
    #[serde(rename = "listenAddrs")]
    pub listen_addrs: Vec<String>,
    #[serde(rename = "byListenAddr")]
    pub by_listen_addr: HashMap<String, SeriesPayload>,
    #[serde(rename = "byListenMinute")]
    pub by_listen_minute: HashMap<String, SeriesPayload>,
    pub stats: HashMap<String, ListenerStats>,
    #[serde(rename = "droppedRecords")]
    pub dropped_records: u64,
}

fn render(buckets: &BTreeMap<i64, Bucket>) -> SeriesPayload {
    let mut out = SeriesPayload::default();
    for (ts, b) in buckets {
        out.timestamps.push(*ts);
        out.counts.push(b.count);
        out.s2xx.push(b.s2xx);
        out.s3xx.push(b.s3xx);
        out.s4xx.push(b.s4xx);
        out.s5xx.push(b.s5xx);
        out.err.push(b.err);
        let avg = if b.count > 0 { b.latency_sum / b.count as f64 } else { 0.0 };
        out.avg_latency_ms.push((avg * 10_000.0).round() / 10_000.0);
        out.max_latency_ms.push((b.latency_max * 10_000.0).round() / 10_000.0);
    }
    out
}

fn top_k(counters: &HashMap<String, u64>) -> Vec<KeyCount> {
    let mut entries: Vec<KeyCount> = counters
        .iter()
        .map(|(k, v)| KeyCount {
            key: k.clone(),
            count: *v,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(TOP_K);
    entries
}

// ============================================================================
// Observer
// ============================================================================

struct LogFlags {
    realtime: bool,
    errors_only: bool,
}

/// The engine-wide observer. One instance shared by every listener.
pub struct Observer {
    series: DashMap<String, Mutex<ListenerSeries>>,
    queue: Mutex<VecDeque<RequestRecord>>,
    dropped: AtomicU64,
    last_flush: Mutex<Instant>,
    sink: SharedRecordSink,
    events: EventBus,
    logs: RwLock<VecDeque<String>>,
    log_flags: RwLock<LogFlags>,
    metrics_cache: Mutex<Option<(Instant, MetricsPayload)>>,
}

impl Observer {
    pub fn new(sink: SharedRecordSink, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            series: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            last_flush: Mutex::new(Instant::now()),
            sink,
            events,
            logs: RwLock::new(VecDeque::new()),
            log_flags: RwLock::new(LogFlags {
                realtime: true,
                errors_only: false,
            }),
            metrics_cache: Mutex::new(None),
        })
    }

    /// Adopt the realtime-log switches from a config snapshot.
    pub fn apply(&self, show_realtime_logs: bool, realtime_logs_only_errors: bool) {
        let mut flags = self.log_flags.write();
        flags.realtime = show_realtime_logs;
        flags.errors_only = realtime_logs_only_errors;
    }

    /// Record one terminal request event. Arrival order within a listener
    /// is preserved: callers invoke this exactly once, inline.
    pub fn observe(&self, record: RequestRecord) {
        for key in [ALL_LISTENERS, record.listen_addr.as_str()] {
            if key.trim().is_empty() {
                continue;
            }
            let entry = self
                .series
                .entry(key.to_string())
                .or_insert_with(|| Mutex::new(ListenerSeries::new()));
            entry.lock().add(&record);
        }

        let mut queue = self.queue.lock();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(record);
    }

    /// Total records dropped because the sink could not keep up.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Append to the rolling log and push it on the event channel when the
    /// realtime switch allows.
    pub fn push_log(&self, line: String) {
        {
            let mut logs = self.logs.write();
            if logs.len() >= LOG_RING {
                logs.pop_front();
            }
            logs.push_back(line.clone());
        }

        let flags = self.log_flags.read();
        if !flags.realtime {
            return;
        }
        if flags.errors_only {
            let lower = line.to_ascii_lowercase();
            if !(lower.contains("error") || lower.contains("failed") || lower.contains("denied")) {
                return;
            }
        }
        drop(flags);

        self.events.emit(CoreEvent::LogLine { line });
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.read().iter().cloned().collect()
    }

    pub fn clear_logs(&self) {
        self.logs.write().clear();
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Current metrics snapshot, cached for 500ms.
    pub fn metrics(&self) -> MetricsPayload {
        {
            let cache = self.metrics_cache.lock();
            if let Some((at, payload)) = cache.as_ref() {
                if at.elapsed() < METRICS_CACHE_TTL {
                    return payload.clone();
                }
            }
        }

        let mut payload = MetricsPayload {
            window_seconds: SECOND_WINDOW,
            minute_window_seconds: MINUTE_WINDOW,
            dropped_records: self.dropped_records(),
            ..MetricsPayload::default()
        };

        for entry in self.series.iter() {
            let key = entry.key().clone();
            let series = entry.value().lock();
            payload.by_listen_addr.insert(key.clone(), render(&series.per_sec));
            payload.by_listen_minute.insert(key.clone(), render(&series.per_min));
            payload.stats.insert(
                key.clone(),
                ListenerStats {
                    p95: series.reservoir.percentile(0.95),
                    p99: series.reservoir.percentile(0.99),
                    top_route_errors: top_k(&series.route_errors),
                    top_upstream_errors: top_k(&series.upstream_errors),
                },
            );
            if key != ALL_LISTENERS {
                payload.listen_addrs.push(key);
            }
        }
        payload.listen_addrs.sort();
        payload.listen_addrs.insert(0, ALL_LISTENERS.to_string());

        *self.metrics_cache.lock() = Some((Instant::now(), payload.clone()));
        payload
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Run the flush loop until aborted. Spawned by the runtime.
    pub async fn run_flusher(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.flush_if_due().await;
        }
    }

    async fn flush_if_due(&self) {
        let due = {
            let queue = self.queue.lock();
            queue.len() >= FLUSH_BATCH
                || (!queue.is_empty() && self.last_flush.lock().elapsed() >= FLUSH_INTERVAL)
        };
        if due {
            self.flush_once().await;
        }
    }

    /// Drain up to one batch into the sink. On failure the batch is put
    /// back at the front and oldest records beyond capacity are dropped.
    pub async fn flush_once(&self) {
        let batch: Vec<RequestRecord> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(FLUSH_BATCH);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        match self.sink.append(batch.clone()).await {
            Ok(()) => {
                debug!(records = count, "flushed records to sink");
                *self.last_flush.lock() = Instant::now();
            }
            Err(e) => {
                warn!(error = %e, records = count, "sink flush failed, requeueing");
                let mut queue = self.queue.lock();
                for record in batch.into_iter().rev() {
                    queue.push_front(record);
                }
                while queue.len() > QUEUE_CAPACITY {
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Pending (unflushed) record count.
    pub fn pending_records(&self) -> usize {
        self.queue.lock().len()
    }
}

/// nginx-style access log line.
pub fn access_log_line(
    listen_addr: &str,
    client_ip: &str,
    method: &str,
    uri: &str,
    status: u16,
    referer: &str,
    user_agent: &str,
    elapsed: Duration,
) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!(
        "[NODE {listen_addr}] {client_ip} - - [{now}] \"{method} {uri} HTTP/1.1\" {status} - \"{referer}\" \"{user_agent}\" {:.3}s",
        elapsed.as_secs_f64()
    )
}

/// Seconds since epoch, for record timestamps.
pub fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryRecordSink, RecordSink, SinkError};
    use async_trait::async_trait;

    fn record(listen: &str, status: u16, latency: f64) -> RequestRecord {
        RequestRecord {
            timestamp: epoch_now(),
            listen_addr: listen.to_string(),
            client_ip: "10.0.0.1".into(),
            peer_ip: "10.0.0.1".into(),
            method: "GET".into(),
            host: "h".into(),
            path: "/p".into(),
            status,
            upstream: "http://up:80".into(),
            route_id: "r1".into(),
            latency_ms: latency,
            bytes_in: 0,
            bytes_out: 0,
            user_agent: "-".into(),
            referer: "-".into(),
        }
    }

    fn observer() -> (Arc<Observer>, Arc<MemoryRecordSink>) {
        let sink = Arc::new(MemoryRecordSink::default());
        let obs = Observer::new(sink.clone(), EventBus::new(16));
        (obs, sink)
    }

    #[test]
    fn series_aggregate_per_listener_and_all() {
        let (obs, _) = observer();
        obs.observe(record(":80", 200, 5.0));
        obs.observe(record(":80", 502, 8.0));
        obs.observe(record(":81", 200, 2.0));

        let payload = obs.metrics();
        assert_eq!(payload.listen_addrs[0], ALL_LISTENERS);
        assert!(payload.listen_addrs.contains(&":80".to_string()));

        let all = &payload.by_listen_addr[ALL_LISTENERS];
        assert_eq!(all.counts.iter().sum::<i64>(), 3);

        let p80 = &payload.by_listen_addr[":80"];
        assert_eq!(p80.counts.iter().sum::<i64>(), 2);
        assert_eq!(p80.s5xx.iter().sum::<i64>(), 1);
    }

    #[test]
    fn percentiles_come_from_the_reservoir() {
        let (obs, _) = observer();
        for i in 1..=100 {
            obs.observe(record(":80", 200, i as f64));
        }

        let payload = obs.metrics();
        let stats = &payload.stats[":80"];
        assert!(stats.p95 >= 90.0 && stats.p95 <= 100.0, "p95 = {}", stats.p95);
        assert!(stats.p99 >= stats.p95);
    }

    #[test]
    fn error_counters_track_routes_and_upstreams() {
        let (obs, _) = observer();
        for _ in 0..3 {
            obs.observe(record(":80", 502, 1.0));
        }
        obs.observe(record(":80", 200, 1.0));

        let payload = obs.metrics();
        let stats = &payload.stats[":80"];
        assert_eq!(stats.top_route_errors[0].key, "r1");
        assert_eq!(stats.top_route_errors[0].count, 3);
        assert_eq!(stats.top_upstream_errors[0].count, 3);
    }

    #[tokio::test]
    async fn flush_moves_records_to_sink() {
        let (obs, sink) = observer();
        obs.observe(record(":80", 200, 1.0));
        obs.observe(record(":80", 200, 1.0));

        assert_eq!(obs.pending_records(), 2);
        obs.flush_once().await;
        assert_eq!(obs.pending_records(), 0);
        assert_eq!(sink.len(), 2);
    }

    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn append(&self, _batch: Vec<RequestRecord>) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        async fn query_logs(
            &self,
            _query: crate::sink::LogQuery,
        ) -> Result<crate::sink::LogPage, SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        async fn query_series(
            &self,
            _query: crate::sink::SeriesQuery,
        ) -> Result<crate::sink::HistoricalSeries, SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        async fn listen_addrs(&self) -> Result<Vec<String>, SinkError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn failed_flush_requeues_records() {
        let obs = Observer::new(Arc::new(FailingSink), EventBus::new(16));
        obs.observe(record(":80", 200, 1.0));
        obs.flush_once().await;
        assert_eq!(obs.pending_records(), 1, "record kept for retry");
    }

    #[test]
    fn log_ring_is_bounded_and_clearable() {
        let (obs, _) = observer();
        for i in 0..(LOG_RING + 10) {
            obs.push_log(format!("line {i}"));
        }
        let logs = obs.logs();
        assert_eq!(logs.len(), LOG_RING);
        assert!(logs[0].ends_with("10"));

        obs.clear_logs();
        assert!(obs.logs().is_empty());
    }

    #[tokio::test]
    async fn errors_only_filter_gates_event_lines() {
        let bus = EventBus::new(16);
        let obs = Observer::new(Arc::new(MemoryRecordSink::default()), bus.clone());
        obs.apply(true, true);

        let mut rx = bus.subscribe();
        obs.push_log("everything fine".into());
        obs.push_log("upstream request failed".into());

        match rx.try_recv().unwrap() {
            CoreEvent::LogLine { line } => assert!(line.contains("failed")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "non-error line was filtered");
    }

    #[test]
    fn status_zero_counts_as_err_class() {
        let (obs, _) = observer();
        obs.observe(record(":80", 0, 0.0));
        let payload = obs.metrics();
        assert_eq!(payload.by_listen_addr[":80"].err.iter().sum::<i64>(), 1);
    }
}
