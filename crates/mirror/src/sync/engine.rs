//! Sync engine
//!
//! Pulls every page of a resource, normalizes and filters the records against
//! the resource watermark, and upserts the survivors into the record sink.

use log::{error, info, warn};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

use super::{
    BackoffPolicy, Clock, FetchStop, ListingSource, PageFetcher, Sleeper, ThreadSleeper,
    WatermarkTracker,
};
use crate::error::SyncError;
use crate::models::{Record, Resource};
use crate::square::normalize_record;
use crate::storage::{RecordSink, WatermarkStore};
use crate::token::TokenManager;

/// Outcome of one resource sync
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStats {
    pub resource: Resource,
    pub pages_fetched: usize,
    pub records_seen: usize,
    pub records_stored: usize,
    /// At or before the watermark
    pub records_skipped: usize,
    /// Failed normalization
    pub records_invalid: usize,
    pub retries: u32,
    pub watermark_advanced: bool,
    pub stopped_early: Option<FetchStop>,
    pub duration_ms: u64,
}

impl SyncStats {
    fn new(resource: Resource) -> Self {
        Self {
            resource,
            pages_fetched: 0,
            records_seen: 0,
            records_stored: 0,
            records_skipped: 0,
            records_invalid: 0,
            retries: 0,
            watermark_advanced: false,
            stopped_early: None,
            duration_ms: 0,
        }
    }
}

/// Sync engine that mirrors remote resources into local storage
pub struct SyncEngine {
    tokens: Arc<TokenManager>,
    source: Arc<dyn ListingSource>,
    sink: Arc<dyn RecordSink>,
    watermark_store: Arc<dyn WatermarkStore>,
    watermarks: WatermarkTracker,
    sleeper: Arc<dyn Sleeper>,
    policy: BackoffPolicy,
}

impl SyncEngine {
    pub fn new(
        tokens: Arc<TokenManager>,
        source: Arc<dyn ListingSource>,
        sink: Arc<dyn RecordSink>,
        watermark_store: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            tokens,
            source,
            sink,
            watermarks: WatermarkTracker::new(watermark_store.clone()),
            watermark_store,
            sleeper: Arc::new(ThreadSleeper::default()),
            policy: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sleeper used between rate-limited retries
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Clock used to stamp run start times
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.watermarks = WatermarkTracker::new(self.watermark_store.clone()).with_clock(clock);
        self
    }

    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    /// Mirror one resource for an account
    ///
    /// Records newer than the resource watermark are upserted by id. When
    /// every page was fetched the watermark advances to the time this run
    /// started; a run that stopped early keeps its stored records but leaves
    /// the watermark where it was, so the next run covers the gap.
    ///
    /// # Errors
    /// Credential failures and storage failures abort the run. Listing
    /// failures do not; they end the run early and are reported in
    /// [`SyncStats::stopped_early`].
    pub fn sync(
        &self,
        account_id: &str,
        resource: Resource,
        page_size: usize,
    ) -> Result<SyncStats, SyncError> {
        let start = Instant::now();
        info!("Starting {} sync for account {}", resource, account_id);

        let access_token = self.tokens.get_access_token(account_id)?;
        let mut run = self.watermarks.begin_run(resource)?;
        let mut stats = SyncStats::new(resource);

        let mut fetcher = PageFetcher::new(
            self.source.as_ref(),
            self.sleeper.as_ref(),
            self.policy.clone(),
            &access_token,
            resource,
            page_size,
        );

        for page in fetcher.by_ref() {
            stats.pages_fetched += 1;
            stats.records_seen += page.len();

            let mut records: Vec<Record> = Vec::with_capacity(page.len());
            for raw in &page {
                match normalize_record(resource, raw) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        stats.records_invalid += 1;
                        let id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("<no id>");
                        warn!("Skipping invalid {} record {}: {:#}", resource, id, e);
                    }
                }
            }

            let mut fresh = run.filter(records);
            for record in fresh.by_ref() {
                let id = record.id().clone();
                self.sink.upsert_record(record).map_err(|e| {
                    error!("Failed to store {} record {}: {:#}", resource, id.as_str(), e);
                    SyncError::Storage(e)
                })?;
                stats.records_stored += 1;
            }
            stats.records_skipped += fresh.skipped();
        }

        stats.retries = fetcher.retries();
        match fetcher.stop_reason() {
            None => run.mark_exhausted(),
            Some(reason) => {
                warn!(
                    "{} sync for account {} stopped early: {}",
                    resource, account_id, reason
                );
                stats.stopped_early = Some(reason.clone());
            }
        }
        stats.watermark_advanced = run.finish()?;
        stats.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "{} sync complete: {} pages, {} seen, {} stored, {} skipped, {} invalid in {}ms",
            resource,
            stats.pages_fetched,
            stats.records_seen,
            stats.records_stored,
            stats.records_skipped,
            stats.records_invalid,
            stats.duration_ms
        );

        Ok(stats)
    }

    /// Mirror several resources of one account concurrently
    ///
    /// Each resource runs independently against its own watermark; one
    /// failing does not stop the others. Results keep the order of `resources`.
    pub fn sync_all(
        &self,
        account_id: &str,
        resources: &[Resource],
        page_size: usize,
    ) -> Vec<(Resource, Result<SyncStats, SyncError>)> {
        resources
            .par_iter()
            .map(|&resource| (resource, self.sync(account_id, resource, page_size)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListError;
    use crate::models::{Credential, RecordId, TokenGrant};
    use crate::storage::{CredentialStore, InMemoryStore};
    use crate::sync::{ListPage, ListRequest, Slept};
    use crate::token::TokenEndpoint;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct NoRefresh;

    impl TokenEndpoint for NoRefresh {
        fn refresh(&self, _refresh_secret: &str) -> anyhow::Result<TokenGrant> {
            anyhow::bail!("refresh not expected")
        }
    }

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: std::time::Duration) -> Slept {
            Slept::Elapsed
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Serves fixed pages keyed by cursor, optionally failing on one cursor
    struct PagedSource {
        pages: Vec<Vec<Value>>,
        fail_at: Option<usize>,
        tokens_seen: Mutex<Vec<String>>,
    }

    impl ListingSource for PagedSource {
        fn list(&self, access_token: &str, request: &ListRequest) -> Result<ListPage, ListError> {
            self.tokens_seen.lock().unwrap().push(access_token.to_string());
            let index: usize = request.cursor.as_deref().map_or(0, |c| c.parse().unwrap());
            if self.fail_at == Some(index) {
                return Err(ListError::Remote(anyhow::anyhow!("HTTP 503")));
            }
            let cursor = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
            Ok(ListPage {
                records: self.pages.get(index).cloned().unwrap_or_default(),
                cursor,
            })
        }
    }

    fn customer(id: &str, updated_at: DateTime<Utc>) -> Value {
        json!({
            "id": id,
            "created_at": updated_at.to_rfc3339(),
            "updated_at": updated_at.to_rfc3339(),
            "given_name": "Test",
        })
    }

    fn engine_with(
        store: Arc<InMemoryStore>,
        source: PagedSource,
        now: DateTime<Utc>,
    ) -> SyncEngine {
        store
            .upsert_credential(Credential {
                account_id: "M1".to_string(),
                access_secret: "live-token".to_string(),
                secret_kind: "bearer".to_string(),
                access_expiry: Utc::now() + Duration::days(1),
                refresh_secret: None,
                refresh_expiry: None,
                short_lived: false,
                created_at: Utc::now(),
            })
            .unwrap();
        let tokens = Arc::new(TokenManager::new(store.clone(), Arc::new(NoRefresh)));
        SyncEngine::new(tokens, Arc::new(source), store.clone(), store)
            .with_sleeper(Arc::new(NoSleep))
            .with_clock(Arc::new(FixedClock(now)))
    }

    #[test]
    fn test_sync_stores_and_advances() {
        let store = Arc::new(InMemoryStore::new());
        let t = Utc::now() - Duration::hours(1);
        let source = PagedSource {
            pages: vec![
                vec![customer("c1", t), customer("c2", t)],
                vec![customer("c3", t), json!({ "id": "broken" })],
            ],
            fail_at: None,
            tokens_seen: Mutex::new(Vec::new()),
        };
        let now = Utc::now();
        let engine = engine_with(store.clone(), source, now);

        let stats = engine.sync("M1", Resource::Customers, 2).unwrap();

        assert_eq!(stats.pages_fetched, 2);
        assert_eq!(stats.records_seen, 4);
        assert_eq!(stats.records_stored, 3);
        assert_eq!(stats.records_invalid, 1);
        assert!(stats.watermark_advanced);
        assert!(stats.stopped_early.is_none());
        assert_eq!(store.count_records(Resource::Customers).unwrap(), 3);
        assert!(
            store
                .get_record(Resource::Customers, &RecordId::new("c3"))
                .unwrap()
                .is_some()
        );
        let mark = store.get_watermark(Resource::Customers).unwrap().unwrap();
        assert_eq!(mark.last_synced_at, now);
    }

    #[test]
    fn test_remote_failure_keeps_records_and_watermark() {
        let store = Arc::new(InMemoryStore::new());
        let t = Utc::now() - Duration::hours(1);
        let source = PagedSource {
            pages: vec![vec![customer("c1", t)], vec![customer("c2", t)]],
            fail_at: Some(1),
            tokens_seen: Mutex::new(Vec::new()),
        };
        let engine = engine_with(store.clone(), source, Utc::now());

        let stats = engine.sync("M1", Resource::Customers, 1).unwrap();

        assert_eq!(stats.records_stored, 1);
        assert!(matches!(stats.stopped_early, Some(FetchStop::Remote(_))));
        assert!(!stats.watermark_advanced);
        assert!(store.get_watermark(Resource::Customers).unwrap().is_none());
    }

    #[test]
    fn test_missing_credential_aborts_before_fetch() {
        let store = Arc::new(InMemoryStore::new());
        let tokens = Arc::new(TokenManager::new(store.clone(), Arc::new(NoRefresh)));
        let source = Arc::new(PagedSource {
            pages: vec![],
            fail_at: None,
            tokens_seen: Mutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(tokens, source.clone(), store.clone(), store);

        let err = engine.sync("ghost", Resource::Payments, 10).unwrap_err();
        assert!(matches!(err, SyncError::NoCredential { .. }));
        assert!(source.tokens_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sync_all_runs_each_resource() {
        let store = Arc::new(InMemoryStore::new());
        let source = PagedSource {
            pages: vec![vec![]],
            fail_at: None,
            tokens_seen: Mutex::new(Vec::new()),
        };
        let engine = engine_with(store.clone(), source, Utc::now());

        let results = engine.sync_all("M1", &Resource::ALL, 10);

        let order: Vec<Resource> = results.iter().map(|(r, _)| *r).collect();
        assert_eq!(order, Resource::ALL.to_vec());
        for (resource, result) in results {
            let stats = result.unwrap();
            assert_eq!(stats.resource, resource);
            assert!(stats.watermark_advanced);
        }
        assert_eq!(store.list_watermarks().unwrap().len(), 3);
    }
}
