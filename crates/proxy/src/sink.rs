//! The persistence boundary.
//!
//! Request logs, historical metrics, and the blacklist live in an external
//! store owned by the embedding shell. The core only knows these traits: an
//! append-only record sink with query support, and a blacklist store. The
//! bounded in-memory implementations below back headless runs and tests; a
//! desktop shell substitutes durable ones.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Record schema
// ============================================================================

/// One observed request, as written to the sink.
///
/// `timestamp` is seconds since epoch (UTC); `latency_ms` is wall time from
/// accept to response completion; `status` is 0 for requests that died
/// before a response existed (TLS failure, aborted upstream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: i64,
    pub listen_addr: String,
    /// Client as derived from forwarding headers, falling back to the peer.
    pub client_ip: String,
    /// The immediate TCP peer.
    pub peer_ip: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub upstream: String,
    pub route_id: String,
    pub latency_ms: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub user_agent: String,
    pub referer: String,
}

/// Filter for request-log queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub start_time: i64,
    pub end_time: i64,
    pub listen_addr: Option<String>,
    pub client_ip: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub upstream: Option<String>,
    pub route_id: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

/// A page of request-log results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogPage {
    pub records: Vec<RequestRecord>,
    pub total: u64,
    pub total_pages: u64,
}

/// Filter for historical metrics queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub start_time: i64,
    pub end_time: i64,
    pub listen_addr: Option<String>,
}

/// Aggregated time series over stored records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalSeries {
    pub timestamps: Vec<i64>,
    pub counts: Vec<i64>,
    pub s2xx: Vec<i64>,
    pub s3xx: Vec<i64>,
    pub s4xx: Vec<i64>,
    pub s5xx: Vec<i64>,
    pub err: Vec<i64>,
    pub avg_latency_ms: Vec<f64>,
    pub max_latency_ms: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Traits
// ============================================================================

/// Append-only store for request records, with the query surface the
/// management UI needs.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Append a batch of records. A failure leaves the batch with the
    /// caller's bounded retry queue; it must not panic or block forever.
    async fn append(&self, batch: Vec<RequestRecord>) -> Result<(), SinkError>;

    async fn query_logs(&self, query: LogQuery) -> Result<LogPage, SinkError>;

    async fn query_series(&self, query: SeriesQuery) -> Result<HistoricalSeries, SinkError>;

    /// Distinct listener addresses seen in stored records.
    async fn listen_addrs(&self) -> Result<Vec<String>, SinkError>;
}

/// A blacklist entry. `expires_at == 0` means permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub ip: String,
    pub reason: String,
    pub expires_at: i64,
    pub created_at: i64,
}

impl BlacklistEntry {
    /// Whether the entry denies traffic at `now`.
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at == 0 || now < self.expires_at
    }
}

/// Durable blacklist storage.
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    /// Insert or replace an entry. `duration_secs <= 0` makes it permanent.
    async fn add(&self, ip: String, reason: String, duration_secs: i64)
        -> Result<BlacklistEntry, SinkError>;

    async fn remove(&self, ip: &str) -> Result<(), SinkError>;

    async fn list(&self) -> Result<Vec<BlacklistEntry>, SinkError>;

    /// Entries active at `now`, as `(ip, expires_at)` pairs, for rebuilding
    /// the in-memory cache.
    async fn active(&self, now: i64) -> Result<Vec<(String, i64)>, SinkError>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Ring-buffered in-memory record sink.
pub struct MemoryRecordSink {
    capacity: usize,
    records: RwLock<VecDeque<RequestRecord>>,
}

impl MemoryRecordSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: RwLock::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for MemoryRecordSink {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn contains_filter(haystack: &str, needle: &Option<String>) -> bool {
    match needle.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(n) => haystack.contains(n),
        None => true,
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn append(&self, batch: Vec<RequestRecord>) -> Result<(), SinkError> {
        let mut records = self.records.write();
        for record in batch {
            if records.len() >= self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
        Ok(())
    }

    async fn query_logs(&self, query: LogQuery) -> Result<LogPage, SinkError> {
        let page_size = query.page_size.clamp(1, 200) as usize;
        let page = query.page.max(1) as usize;

        let records = self.records.read();
        let mut matched: Vec<&RequestRecord> = records
            .iter()
            .filter(|r| r.timestamp >= query.start_time && r.timestamp <= query.end_time)
            .filter(|r| match query.listen_addr.as_deref().map(str::trim) {
                Some(la) if !la.is_empty() => r.listen_addr == la,
                _ => true,
            })
            .filter(|r| contains_filter(&r.client_ip, &query.client_ip))
            .filter(|r| contains_filter(&r.path, &query.path))
            .filter(|r| contains_filter(&r.upstream, &query.upstream))
            .filter(|r| match &query.route_id {
                Some(id) if !id.trim().is_empty() => r.route_id == id.trim(),
                _ => true,
            })
            .filter(|r| match query.status {
                Some(s) => r.status == s,
                None => true,
            })
            .collect();

        // Newest first, like any log view.
        matched.sort_by_key(|r| std::cmp::Reverse(r.timestamp));

        let total = matched.len() as u64;
        let total_pages = total.div_ceil(page_size as u64);
        let start = (page - 1) * page_size;
        let records = matched
            .into_iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect();

        Ok(LogPage {
            records,
            total,
            total_pages,
        })
    }

    async fn query_series(&self, query: SeriesQuery) -> Result<HistoricalSeries, SinkError> {
        if query.end_time <= query.start_time {
            return Ok(HistoricalSeries::default());
        }

        let span = query.end_time - query.start_time;
        let granularity: i64 = if span < 3600 {
            1
        } else if span < 48 * 3600 {
            60
        } else {
            300
        };

        #[derive(Default)]
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

        let records = self.records.read();
        let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();

        for r in records.iter() {
            if r.timestamp < query.start_time || r.timestamp > query.end_time {
                continue;
            }
            if let Some(la) = query.listen_addr.as_deref().map(str::trim) {
                if !la.is_empty() && r.listen_addr != la {
                    continue;
                }
            }

            let bucket = buckets
                .entry((r.timestamp / granularity) * granularity)
                .or_default();
            bucket.count += 1;
            match r.status {
                200..=299 => bucket.s2xx += 1,
                300..=399 => bucket.s3xx += 1,
                400..=499 => bucket.s4xx += 1,
                s if s >= 500 => bucket.s5xx += 1,
                _ => bucket.err += 1,
            }
            bucket.latency_sum += r.latency_ms.max(0.0);
            bucket.latency_max = bucket.latency_max.max(r.latency_ms);
        }

        let mut series = HistoricalSeries::default();
        for (ts, b) in buckets {
            series.timestamps.push(ts);
            series.counts.push(b.count);
            series.s2xx.push(b.s2xx);
            series.s3xx.push(b.s3xx);
            series.s4xx.push(b.s4xx);
            series.s5xx.push(b.s5xx);
            series.err.push(b.err);
            let avg = if b.count > 0 {
                b.latency_sum / b.count as f64
            } else {
                0.0
            };
            series.avg_latency_ms.push((avg * 10_000.0).round() / 10_000.0);
            series
                .max_latency_ms
                .push((b.latency_max * 10_000.0).round() / 10_000.0);
        }

        Ok(series)
    }

    async fn listen_addrs(&self) -> Result<Vec<String>, SinkError> {
        let records = self.records.read();
        let mut addrs: Vec<String> = records
            .iter()
            .map(|r| r.listen_addr.clone())
            .filter(|a| !a.trim().is_empty())
            .collect();
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }
}

/// In-memory blacklist store.
#[derive(Default)]
pub struct MemoryBlacklistStore {
    entries: RwLock<HashMap<String, BlacklistEntry>>,
}

impl MemoryBlacklistStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl BlacklistStore for MemoryBlacklistStore {
    async fn add(
        &self,
        ip: String,
        reason: String,
        duration_secs: i64,
    ) -> Result<BlacklistEntry, SinkError> {
        let now = now_epoch();
        let expires_at = if duration_secs <= 0 { 0 } else { now + duration_secs };
        let entry = BlacklistEntry {
            ip: ip.trim().to_ascii_lowercase(),
            reason,
            expires_at,
            created_at: now,
        };
        self.entries.write().insert(entry.ip.clone(), entry.clone());
        Ok(entry)
    }

    async fn remove(&self, ip: &str) -> Result<(), SinkError> {
        self.entries.write().remove(&ip.trim().to_ascii_lowercase());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BlacklistEntry>, SinkError> {
        let mut entries: Vec<BlacklistEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        Ok(entries)
    }

    async fn active(&self, now: i64) -> Result<Vec<(String, i64)>, SinkError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.is_active(now))
            .map(|e| (e.ip.clone(), e.expires_at))
            .collect())
    }
}

/// Shared handles used across the engine.
pub type SharedRecordSink = Arc<dyn RecordSink>;
pub type SharedBlacklistStore = Arc<dyn BlacklistStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64, listen: &str, status: u16, path: &str) -> RequestRecord {
        RequestRecord {
            timestamp: ts,
            listen_addr: listen.to_string(),
            client_ip: "10.0.0.9".into(),
            peer_ip: "10.0.0.9".into(),
            method: "GET".into(),
            host: "example.com".into(),
            path: path.to_string(),
            status,
            upstream: "http://127.0.0.1:3000".into(),
            route_id: "r1".into(),
            latency_ms: 12.5,
            bytes_in: 0,
            bytes_out: 100,
            user_agent: "-".into(),
            referer: "-".into(),
        }
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest() {
        let sink = MemoryRecordSink::new(2);
        sink.append(vec![
            record(1, ":80", 200, "/a"),
            record(2, ":80", 200, "/b"),
            record(3, ":80", 200, "/c"),
        ])
        .await
        .unwrap();

        assert_eq!(sink.len(), 2);
        let page = sink
            .query_logs(LogQuery {
                start_time: 0,
                end_time: 10,
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.records[0].path, "/c");
    }

    #[tokio::test]
    async fn log_query_filters_and_paginates() {
        let sink = MemoryRecordSink::default();
        let mut batch = Vec::new();
        for i in 0..30 {
            batch.push(record(100 + i, ":80", if i % 2 == 0 { 200 } else { 500 }, "/api"));
        }
        batch.push(record(200, ":81", 200, "/other"));
        sink.append(batch).await.unwrap();

        let page = sink
            .query_logs(LogQuery {
                start_time: 0,
                end_time: 1000,
                listen_addr: Some(":80".into()),
                status: Some(500),
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(page.total, 15);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.records.len(), 10);
        assert!(page.records.iter().all(|r| r.status == 500));
    }

    #[tokio::test]
    async fn series_buckets_by_granularity() {
        let sink = MemoryRecordSink::default();
        sink.append(vec![
            record(10, ":80", 200, "/"),
            record(10, ":80", 404, "/"),
            record(11, ":80", 200, "/"),
        ])
        .await
        .unwrap();

        let series = sink
            .query_series(SeriesQuery {
                start_time: 0,
                end_time: 100,
                listen_addr: None,
            })
            .await
            .unwrap();

        assert_eq!(series.timestamps, vec![10, 11]);
        assert_eq!(series.counts, vec![2, 1]);
        assert_eq!(series.s4xx, vec![1, 0]);
    }

    #[tokio::test]
    async fn blacklist_active_filtering() {
        let store = MemoryBlacklistStore::new();
        store.add("1.2.3.4".into(), "manual".into(), 0).await.unwrap();
        store.add("5.6.7.8".into(), "temp".into(), -5).await.unwrap();

        let now = now_epoch();
        let active = store.active(now).await.unwrap();
        assert_eq!(active.len(), 2); // both permanent (duration <= 0)

        store.remove("1.2.3.4").await.unwrap();
        let active = store.active(now).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn entry_activity_window() {
        let entry = BlacklistEntry {
            ip: "1.1.1.1".into(),
            reason: String::new(),
            expires_at: 100,
            created_at: 0,
        };
        assert!(entry.is_active(99));
        assert!(!entry.is_active(100));

        let permanent = BlacklistEntry { expires_at: 0, ..entry };
        assert!(permanent.is_active(i64::MAX));
    }
}
