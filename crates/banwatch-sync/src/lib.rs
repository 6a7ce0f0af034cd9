//! Upstream manifest fetch, ban-cache reconciliation and the refresh driver.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use banwatch_core::{now_ms, BanSnapshot, EntryRecord, BOOTSTRAP_PREAGE_MS};
use banwatch_store::{snapshot_hash, EntryStore, StoreError};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "banwatch-sync";

const DEFAULT_MANIFEST_URL: &str = "https://api.facepunch.com/api/public/manifest";

/// JSON pointer to the ban list inside the upstream manifest document.
const BANNED_POINTER: &str = "/Servers/Banned";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed manifest body: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// How the driver is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Reconcile at startup, then on a fixed period in a background task.
    Scheduled,
    /// Reconcile synchronously on each page request.
    OnDemand,
}

impl RefreshMode {
    fn parse(value: &str) -> Self {
        match value {
            "on-demand" | "ondemand" | "on_demand" => Self::OnDemand,
            _ => Self::Scheduled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub manifest_url: String,
    pub cache_dir: PathBuf,
    pub refresh_interval: Duration,
    pub mode: RefreshMode,
    pub http_timeout: Duration,
    pub user_agent: Option<String>,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let manifest_url = std::env::var("BANWATCH_MANIFEST_URL").unwrap_or_else(|_| {
            let key = std::env::var("BANWATCH_PUBLIC_KEY").unwrap_or_default();
            format!("{DEFAULT_MANIFEST_URL}?public_key={key}")
        });
        Self {
            manifest_url,
            cache_dir: std::env::var("BANWATCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            refresh_interval: Duration::from_secs(
                std::env::var("BANWATCH_REFRESH_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            mode: std::env::var("BANWATCH_MODE")
                .map(|v| RefreshMode::parse(&v))
                .unwrap_or(RefreshMode::Scheduled),
            http_timeout: Duration::from_secs(
                std::env::var("BANWATCH_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: std::env::var("BANWATCH_USER_AGENT").ok(),
            web_port: std::env::var("BANWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
        }
    }
}

/// Source of the upstream ban list. The production impl talks HTTP; tests
/// substitute scripted sources.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_banned(&self, run_id: Uuid) -> Result<Vec<String>, FetchError>;
}

/// HTTP client for the upstream manifest endpoint, with the usual retry
/// discipline: exponential backoff on 5xx/429 and transport-level failures,
/// immediate give-up on anything else.
#[derive(Debug)]
pub struct ManifestClient {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl ManifestClient {
    pub fn new(config: &SyncConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.http_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: config.manifest_url.clone(),
            backoff: BackoffPolicy::default(),
        })
    }
}

/// Pulls the ban list out of a manifest document. A missing pointer is an
/// empty list, matching upstream's behavior of omitting the section entirely
/// when nothing is banned. Non-string elements are skipped.
pub fn extract_banned(manifest: &serde_json::Value) -> Vec<String> {
    manifest
        .pointer(BANNED_POINTER)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ManifestSource for ManifestClient {
    async fn fetch_banned(&self, run_id: Uuid) -> Result<Vec<String>, FetchError> {
        let span = info_span!("manifest_fetch", %run_id, url = %self.url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(self.url.as_str()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        let manifest: serde_json::Value = serde_json::from_slice(&body)?;
                        return Ok(extract_banned(&manifest));
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Merges a freshly fetched ban list against the persisted first-seen map,
/// evaluated at `now_ms`.
///
/// Unseen entries are persisted at `now_ms`, except during the very first
/// population of an empty store, where they are back-dated past the recency
/// cutoff so the initial baseline is not reported as new. Classification of
/// the new set uses the map as read *before* this call's writes, so writes
/// performed here can never influence their own classification.
pub async fn reconcile_at(
    current: &[String],
    store: &dyn EntryStore,
    now_ms: i64,
) -> Result<BanSnapshot, StoreError> {
    let old_cache = store.get_all().await?;
    let is_first = old_cache.is_empty();
    let recent_cutoff = BanSnapshot::recent_cutoff(now_ms);

    let first_seen_for_unseen = if is_first {
        recent_cutoff - BOOTSTRAP_PREAGE_MS
    } else {
        now_ms
    };
    let unseen: Vec<EntryRecord> = current
        .iter()
        .filter(|entry| !old_cache.contains_key(entry.as_str()))
        .map(|entry| EntryRecord::new(entry.as_str(), first_seen_for_unseen))
        .collect();
    if !unseen.is_empty() {
        store.upsert_if_absent_batch(&unseen).await?;
    }

    // Bootstrap never reports novelties. Otherwise an entry is new if it was
    // absent before this fetch, or still inside the window from its true
    // first sighting.
    let mut newly_banned = Vec::new();
    if !is_first {
        let mut seen = HashSet::new();
        for entry in current {
            if !seen.insert(entry.as_str()) {
                continue;
            }
            match old_cache.get(entry) {
                None => newly_banned.push(entry.clone()),
                Some(&first_seen) if first_seen > recent_cutoff => newly_banned.push(entry.clone()),
                Some(_) => {}
            }
        }
    }

    let cache_timestamp = old_cache.values().copied().min().unwrap_or(0);

    Ok(BanSnapshot {
        banned: current.to_vec(),
        newly_banned,
        cache_timestamp,
        fetch_timestamp: now_ms,
    })
}

/// [`reconcile_at`] evaluated at the current wall-clock time.
pub async fn reconcile(current: &[String], store: &dyn EntryStore) -> Result<BanSnapshot, StoreError> {
    reconcile_at(current, store, now_ms()).await
}

/// Process-wide refresh state, written only by the driver.
#[derive(Debug, Default)]
pub struct ServiceState {
    pub snapshot: Option<BanSnapshot>,
    pub last_fetch_ms: i64,
}

pub type SharedState = Arc<RwLock<ServiceState>>;

/// Owns the manifest source and the entry store, and is the single logical
/// writer of [`ServiceState`].
pub struct RefreshDriver {
    source: Arc<dyn ManifestSource>,
    store: Arc<dyn EntryStore>,
    state: SharedState,
}

impl RefreshDriver {
    pub fn new(source: Arc<dyn ManifestSource>, store: Arc<dyn EntryStore>) -> Self {
        Self {
            source,
            store,
            state: Arc::new(RwLock::new(ServiceState::default())),
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn store(&self) -> Arc<dyn EntryStore> {
        self.store.clone()
    }

    /// One fetch + reconcile cycle. On fetch failure the previous snapshot is
    /// left untouched and the error propagates to the caller.
    pub async fn run_once(&self) -> Result<BanSnapshot, RefreshError> {
        let run_id = Uuid::new_v4();
        let banned = self.source.fetch_banned(run_id).await?;
        let snapshot = reconcile(&banned, self.store.as_ref()).await?;

        let mut state = self.state.write().await;
        let changed = state
            .snapshot
            .as_ref()
            .map(|prev| snapshot_hash(prev) != snapshot_hash(&snapshot))
            .unwrap_or(true);
        if changed {
            info!(
                %run_id,
                bans = snapshot.banned.len(),
                new = snapshot.newly_banned.len(),
                "ban data updated"
            );
        }
        state.last_fetch_ms = snapshot.fetch_timestamp;
        state.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Runs `run_once` immediately, then on a fixed period. A single task
    /// awaits each run to completion, so runs never overlap; if a run
    /// overruns the period, the missed tick is skipped.
    pub fn spawn_scheduled(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    warn!(error = %err, "scheduled refresh failed, keeping previous snapshot");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banwatch_store::MemoryEntryStore;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    const NOW: i64 = 1_700_000_000_000;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    struct StaticSource(Vec<String>);

    #[async_trait]
    impl ManifestSource for StaticSource {
        async fn fetch_banned(&self, _run_id: Uuid) -> Result<Vec<String>, FetchError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ManifestSource for FailingSource {
        async fn fetch_banned(&self, _run_id: Uuid) -> Result<Vec<String>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 502,
                url: "http://upstream/manifest".into(),
            })
        }
    }

    #[test]
    fn extract_banned_reads_nested_list() {
        let manifest = serde_json::json!({
            "Servers": { "Banned": ["1.1.1.1:28015", "2.2.2.2:28015"] }
        });
        assert_eq!(
            extract_banned(&manifest),
            list(&["1.1.1.1:28015", "2.2.2.2:28015"])
        );
    }

    #[test]
    fn extract_banned_missing_section_is_empty() {
        assert!(extract_banned(&serde_json::json!({})).is_empty());
        assert!(extract_banned(&serde_json::json!({ "Servers": {} })).is_empty());
    }

    #[test]
    fn extract_banned_skips_non_strings() {
        let manifest = serde_json::json!({
            "Servers": { "Banned": ["ok", 42, null] }
        });
        assert_eq!(extract_banned(&manifest), list(&["ok"]));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    // Cold store: both entries persisted pre-aged past the window, nothing
    // reported as new.
    #[tokio::test]
    async fn first_population_is_backdated_and_reports_nothing() {
        let store = MemoryEntryStore::new();
        let snapshot = reconcile_at(&list(&["a", "b"]), &store, NOW)
            .await
            .expect("reconcile");

        assert!(snapshot.newly_banned.is_empty());
        assert_eq!(snapshot.cache_timestamp, 0);
        assert_eq!(snapshot.fetch_timestamp, NOW);

        let all = store.get_all().await.expect("get_all");
        let expected = NOW - 7 * DAY_MS - 1000;
        assert_eq!(all.get("a"), Some(&expected));
        assert_eq!(all.get("b"), Some(&expected));
    }

    #[tokio::test]
    async fn unseen_entry_is_new_and_stale_entry_is_not() {
        let store = MemoryEntryStore::new();
        let t0 = NOW - 10 * DAY_MS;
        store.seed(&[EntryRecord::new("a", t0)]).await;

        let snapshot = reconcile_at(&list(&["a", "c"]), &store, NOW)
            .await
            .expect("reconcile");

        assert_eq!(snapshot.newly_banned, list(&["c"]));
        assert_eq!(snapshot.cache_timestamp, t0);

        let all = store.get_all().await.expect("get_all");
        assert_eq!(all.get("a"), Some(&t0));
        assert_eq!(all.get("c"), Some(&NOW));
    }

    #[tokio::test]
    async fn recent_entry_stays_new_without_writes() {
        let store = MemoryEntryStore::new();
        let t0 = NOW - 2 * DAY_MS;
        store.seed(&[EntryRecord::new("a", t0)]).await;

        let snapshot = reconcile_at(&list(&["a"]), &store, NOW)
            .await
            .expect("reconcile");

        assert_eq!(snapshot.newly_banned, list(&["a"]));
        let all = store.get_all().await.expect("get_all");
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("a"), Some(&t0));
    }

    #[tokio::test]
    async fn entry_leaves_new_set_after_window_expires() {
        let store = MemoryEntryStore::new();
        store.seed(&[EntryRecord::new("old", NOW - 30 * DAY_MS)]).await;

        let first = reconcile_at(&list(&["old", "fresh"]), &store, NOW)
            .await
            .expect("first");
        assert_eq!(first.newly_banned, list(&["fresh"]));

        // Still inside the window from its true first sighting.
        let later = reconcile_at(&list(&["old", "fresh"]), &store, NOW + 6 * DAY_MS)
            .await
            .expect("later");
        assert_eq!(later.newly_banned, list(&["fresh"]));

        // Past the window: no longer new.
        let expired = reconcile_at(&list(&["old", "fresh"]), &store, NOW + 8 * DAY_MS)
            .await
            .expect("expired");
        assert!(expired.newly_banned.is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = MemoryEntryStore::new();
        store.seed(&[EntryRecord::new("a", NOW - 10 * DAY_MS)]).await;

        let first = reconcile_at(&list(&["a", "b"]), &store, NOW)
            .await
            .expect("first");
        let after_first = store.get_all().await.expect("get_all");

        let second = reconcile_at(&list(&["a", "b"]), &store, NOW)
            .await
            .expect("second");
        let after_second = store.get_all().await.expect("get_all");

        assert_eq!(after_first, after_second);
        assert_eq!(first.newly_banned, second.newly_banned);
    }

    #[tokio::test]
    async fn new_set_is_subset_of_banned_and_preserves_order() {
        let store = MemoryEntryStore::new();
        store.seed(&[EntryRecord::new("stable", NOW - 20 * DAY_MS)]).await;

        let snapshot = reconcile_at(&list(&["z", "stable", "m"]), &store, NOW)
            .await
            .expect("reconcile");

        assert_eq!(snapshot.newly_banned, list(&["z", "m"]));
        for entry in &snapshot.newly_banned {
            assert!(snapshot.banned.contains(entry));
        }
    }

    #[tokio::test]
    async fn empty_list_performs_no_writes() {
        let store = MemoryEntryStore::new();
        store.seed(&[EntryRecord::new("a", NOW - DAY_MS)]).await;

        let snapshot = reconcile_at(&[], &store, NOW).await.expect("reconcile");

        assert!(snapshot.banned.is_empty());
        assert!(snapshot.newly_banned.is_empty());
        assert_eq!(snapshot.cache_timestamp, NOW - DAY_MS);
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn duplicate_upstream_entries_classify_once() {
        let store = MemoryEntryStore::new();
        store.seed(&[EntryRecord::new("seed", NOW - 20 * DAY_MS)]).await;

        let snapshot = reconcile_at(&list(&["dup", "dup", "seed"]), &store, NOW)
            .await
            .expect("reconcile");

        assert_eq!(snapshot.banned.len(), 3);
        assert_eq!(snapshot.newly_banned, list(&["dup"]));
    }

    #[tokio::test]
    async fn driver_updates_state_on_success() {
        let store = Arc::new(MemoryEntryStore::new());
        let driver = RefreshDriver::new(
            Arc::new(StaticSource(list(&["a", "b"]))),
            store,
        );

        let snapshot = driver.run_once().await.expect("run_once");
        assert_eq!(snapshot.banned, list(&["a", "b"]));

        let state = driver.state();
        let state = state.read().await;
        assert_eq!(state.snapshot.as_ref().expect("snapshot").banned, list(&["a", "b"]));
        assert_eq!(state.last_fetch_ms, snapshot.fetch_timestamp);
    }

    #[tokio::test]
    async fn driver_keeps_previous_snapshot_on_fetch_failure() {
        let store = Arc::new(MemoryEntryStore::new());
        let ok_driver = RefreshDriver::new(
            Arc::new(StaticSource(list(&["a"]))),
            store.clone(),
        );
        let good = ok_driver.run_once().await.expect("seed run");

        // Same state, failing source: the error surfaces, the state does not move.
        let failing = RefreshDriver {
            source: Arc::new(FailingSource),
            store,
            state: ok_driver.state(),
        };
        let err = failing.run_once().await.expect_err("fetch failure");
        assert!(matches!(err, RefreshError::Fetch(FetchError::HttpStatus { status: 502, .. })));

        let state = failing.state();
        let state = state.read().await;
        assert_eq!(state.snapshot.as_ref().expect("snapshot"), &good);
        assert_eq!(state.last_fetch_ms, good.fetch_timestamp);
    }
}
