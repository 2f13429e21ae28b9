//! The runtime control surface invoked by the management shell.
//!
//! Everything the desktop UI (or a headless operator) can do lands here:
//! config get/save with validation and persistence, start/stop/status,
//! partial rule/route toggles, log and metrics queries, and blacklist
//! management. Errors cross this boundary as `anyhow` values; inside the
//! engine they stay typed.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use portico_config::{validate, Config};

use crate::events::CoreEvent;
use crate::observe::MetricsPayload;
use crate::runtime::{Status, Supervisor};
use crate::sink::{
    BlacklistEntry, HistoricalSeries, LogPage, LogQuery, SeriesQuery, SharedRecordSink,
};

/// Handle to a running (or stopped) engine.
pub struct ControlApi {
    supervisor: Arc<Supervisor>,
    sink: SharedRecordSink,
    config_path: PathBuf,
}

impl ControlApi {
    pub fn new(supervisor: Arc<Supervisor>, sink: SharedRecordSink, config_path: PathBuf) -> Self {
        Self {
            supervisor,
            sink,
            config_path,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    /// The currently published snapshot.
    pub fn get_config(&self) -> Arc<Config> {
        self.supervisor.snapshot()
    }

    /// Validate, persist, and publish a new configuration. Invalid input
    /// never reaches the runtime.
    pub async fn save_config(&self, raw: Config) -> Result<Arc<Config>> {
        let validated = validate(raw).map_err(|e| anyhow!(e).context("configuration invalid"))?;
        portico_config::save(&self.config_path, &validated)
            .context("persisting configuration failed")?;

        let snapshot = Arc::new(validated);
        self.supervisor.apply(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Toggle a whole listen rule (HTTP or WS) by its stable id.
    pub async fn set_listen_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<Arc<Config>> {
        let mut cfg = (*self.get_config()).clone();

        let mut found = false;
        for rule in &mut cfg.http_rules {
            if rule.id.as_str() == rule_id {
                rule.enabled = enabled;
                found = true;
            }
        }
        for rule in &mut cfg.ws_rules {
            if rule.id.as_str() == rule_id {
                rule.enabled = enabled;
                found = true;
            }
        }
        if !found {
            return Err(anyhow!("no rule with id `{rule_id}`"));
        }

        self.save_config(cfg).await
    }

    /// Toggle a single route within an HTTP rule.
    pub async fn set_route_enabled(
        &self,
        rule_id: &str,
        route_id: &str,
        enabled: bool,
    ) -> Result<Arc<Config>> {
        let mut cfg = (*self.get_config()).clone();

        let rule = cfg
            .http_rules
            .iter_mut()
            .find(|r| r.id.as_str() == rule_id)
            .ok_or_else(|| anyhow!("no rule with id `{rule_id}`"))?;
        let route = rule
            .routes
            .iter_mut()
            .find(|r| r.id.as_str() == route_id)
            .ok_or_else(|| anyhow!("no route with id `{route_id}` in rule `{rule_id}`"))?;
        route.enabled = enabled;

        self.save_config(cfg).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self) -> Status {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Status {
        self.supervisor.stop().await
    }

    pub async fn status(&self) -> Status {
        self.supervisor.status().await
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    pub async fn query_request_logs(&self, query: LogQuery) -> Result<LogPage> {
        self.sink
            .query_logs(query)
            .await
            .context("request log query failed")
    }

    pub async fn query_historical_metrics(&self, query: SeriesQuery) -> Result<HistoricalSeries> {
        self.sink
            .query_series(query)
            .await
            .context("historical metrics query failed")
    }

    /// Listener addresses seen in stored records (for filter dropdowns).
    pub async fn get_listen_addrs(&self) -> Result<Vec<String>> {
        self.sink
            .listen_addrs()
            .await
            .context("listen address query failed")
    }

    pub fn get_metrics(&self) -> MetricsPayload {
        self.supervisor.context().observer.metrics()
    }

    pub fn get_logs(&self) -> Vec<String> {
        self.supervisor.context().observer.logs()
    }

    pub fn clear_logs(&self) {
        self.supervisor.context().observer.clear_logs();
    }

    /// Subscribe to lifecycle/metrics/log events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.supervisor.context().events.subscribe()
    }

    // ------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------

    /// Add (or replace) a blacklist entry and make it effective
    /// immediately, ahead of the periodic cache refresh.
    pub async fn blacklist_add(
        &self,
        ip: String,
        reason: String,
        duration_sec: i64,
    ) -> Result<BlacklistEntry> {
        let ctx = self.supervisor.context();
        let entry = ctx
            .blacklist
            .add(ip, reason, duration_sec)
            .await
            .context("blacklist insert failed")?;
        ctx.access.cache_ban(&entry.ip, entry.expires_at);
        ctx.observer.push_log(format!(
            "[blacklist] {} banned ({})",
            entry.ip,
            if entry.expires_at == 0 {
                "permanent".to_string()
            } else {
                format!("until {}", entry.expires_at)
            }
        ));
        Ok(entry)
    }

    pub async fn blacklist_remove(&self, ip: &str) -> Result<()> {
        let ctx = self.supervisor.context();
        ctx.blacklist
            .remove(ip)
            .await
            .context("blacklist delete failed")?;
        ctx.access.uncache_ban(ip);
        Ok(())
    }

    pub async fn blacklist_list(&self) -> Result<Vec<BlacklistEntry>> {
        self.supervisor
            .context()
            .blacklist
            .list()
            .await
            .context("blacklist query failed")
    }

    pub async fn blacklist_cache_refresh(&self) {
        self.supervisor.context().access.refresh_blacklist().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;
    use crate::sink::{MemoryBlacklistStore, MemoryRecordSink};

    fn api() -> (ControlApi, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let sink: SharedRecordSink = Arc::new(MemoryRecordSink::default());
        let store: crate::sink::SharedBlacklistStore = Arc::new(MemoryBlacklistStore::new());
        let supervisor = engine::build(Arc::new(Config::default()), sink.clone(), store);

        (ControlApi::new(supervisor, sink, path), dir)
    }

    #[tokio::test]
    async fn save_config_validates_and_persists() {
        let (api, dir) = api();

        let cfg: Config = toml::from_str(
            r#"
            [[http_rules]]
            listen_addrs = [":0"]
            [[http_rules.routes]]
            [[http_rules.routes.upstreams]]
            url = "http://127.0.0.1:9"
            "#,
        )
        .unwrap();

        let saved = api.save_config(cfg).await.unwrap();
        assert!(!saved.http_rules[0].id.is_blank(), "ids filled on save");
        assert!(dir.path().join("config.toml").exists());

        // Invalid config is rejected without publishing.
        let bad: Config = toml::from_str(
            r#"
            [[http_rules]]
            listen_addrs = ["nonsense"]
            [[http_rules.routes]]
            [[http_rules.routes.upstreams]]
            url = "http://127.0.0.1:9"
            "#,
        )
        .unwrap();
        assert!(api.save_config(bad).await.is_err());
        assert_eq!(api.get_config(), saved);
    }

    #[tokio::test]
    async fn rule_and_route_toggles_round_trip() {
        let (api, _dir) = api();

        let cfg: Config = toml::from_str(
            r#"
            [[http_rules]]
            id = "edge"
            listen_addrs = [":0"]
            [[http_rules.routes]]
            id = "api"
            [[http_rules.routes.upstreams]]
            url = "http://127.0.0.1:9"
            [[http_rules.routes]]
            id = "web"
            [[http_rules.routes.upstreams]]
            url = "http://127.0.0.1:9"
            "#,
        )
        .unwrap();
        api.save_config(cfg).await.unwrap();

        let updated = api.set_route_enabled("edge", "api", false).await.unwrap();
        assert!(!updated.http_rules[0].routes[0].enabled);
        assert!(updated.http_rules[0].routes[1].enabled);

        let updated = api.set_listen_rule_enabled("edge", false).await.unwrap();
        assert!(!updated.http_rules[0].enabled);

        assert!(api.set_listen_rule_enabled("ghost", true).await.is_err());
    }

    #[tokio::test]
    async fn blacklist_flow_hits_access_control_immediately() {
        let (api, _dir) = api();

        api.blacklist_add("203.0.113.50".into(), "abuse".into(), 0)
            .await
            .unwrap();
        assert!(api
            .supervisor()
            .context()
            .access
            .is_blacklisted("203.0.113.50"));

        let entries = api.blacklist_list().await.unwrap();
        assert_eq!(entries.len(), 1);

        api.blacklist_remove("203.0.113.50").await.unwrap();
        assert!(!api
            .supervisor()
            .context()
            .access
            .is_blacklisted("203.0.113.50"));
    }
}
