//! Per-resource watermark tracking
//!
//! A watermark is the start time of the last sync run that finished. Records
//! stamped at or before it are treated as already mirrored.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::sync::Arc;

use super::{Clock, SystemClock};
use crate::models::{Record, Resource, SyncWatermark};
use crate::storage::WatermarkStore;

/// Reads, filters against and advances watermarks
pub struct WatermarkTracker {
    store: Arc<dyn WatermarkStore>,
    clock: Arc<dyn Clock>,
}

impl WatermarkTracker {
    pub fn new(store: Arc<dyn WatermarkStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether a record stamped `record_ts` is newer than the resource's watermark.
    ///
    /// Always true before the first finished run.
    pub fn is_after_watermark(&self, resource: Resource, record_ts: DateTime<Utc>) -> Result<bool> {
        let mark = self.store.get_watermark(resource)?;
        Ok(mark.is_none_or(|mark| !mark.covers(record_ts)))
    }

    /// Move the resource's watermark forward to `ts`
    pub fn advance_watermark(&self, resource: Resource, ts: DateTime<Utc>) -> Result<()> {
        self.store.upsert_watermark(resource, ts)?;
        info!("Watermark for {} advanced to {}", resource, ts);
        Ok(())
    }

    /// Lazily yield the records newer than the resource's watermark, in order
    pub fn filter_records<I>(
        &self,
        records: I,
        resource: Resource,
    ) -> Result<FilterRecords<I::IntoIter>>
    where
        I: IntoIterator<Item = Record>,
    {
        let mark = self.store.get_watermark(resource)?;
        Ok(FilterRecords::new(records.into_iter(), mark))
    }

    /// Start a sync run for `resource`, capturing its start time
    pub fn begin_run(&self, resource: Resource) -> Result<WatermarkRun<'_>> {
        let snapshot = self.store.get_watermark(resource)?;
        let started_at = self.clock.now();
        debug!(
            "Sync run for {} started at {} (watermark {:?})",
            resource,
            started_at,
            snapshot.as_ref().map(|m| m.last_synced_at)
        );
        Ok(WatermarkRun {
            tracker: self,
            resource,
            started_at,
            snapshot,
            exhausted: false,
            finalized: false,
        })
    }
}

/// Iterator adapter that drops records covered by a watermark
pub struct FilterRecords<I> {
    inner: I,
    mark: Option<SyncWatermark>,
    skipped: usize,
}

impl<I> FilterRecords<I> {
    fn new(inner: I, mark: Option<SyncWatermark>) -> Self {
        Self {
            inner,
            mark,
            skipped: 0,
        }
    }

    /// Records dropped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<I: Iterator<Item = Record>> Iterator for FilterRecords<I> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        for record in self.inner.by_ref() {
            match &self.mark {
                Some(mark) if mark.covers(record.updated_at()) => self.skipped += 1,
                _ => return Some(record),
            }
        }
        None
    }
}

/// Scope of one sync run for one resource
///
/// The watermark is finalized exactly once, either by [`WatermarkRun::finish`]
/// or when the run is dropped on any other exit path. It only advances (to
/// the run's start time) if the run was marked exhausted: every page was
/// fetched and every record processed. Runs that stopped early or failed
/// leave the watermark where it was.
pub struct WatermarkRun<'a> {
    tracker: &'a WatermarkTracker,
    resource: Resource,
    started_at: DateTime<Utc>,
    snapshot: Option<SyncWatermark>,
    exhausted: bool,
    finalized: bool,
}

impl WatermarkRun<'_> {
    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Watermark as it was when the run began
    pub fn previous(&self) -> Option<&SyncWatermark> {
        self.snapshot.as_ref()
    }

    /// Filter records against the watermark as it was when the run began
    pub fn filter<I>(&self, records: I) -> FilterRecords<I::IntoIter>
    where
        I: IntoIterator<Item = Record>,
    {
        FilterRecords::new(records.into_iter(), self.snapshot.clone())
    }

    /// Every page was fetched and processed; the watermark may advance
    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    /// Finalize the run, returning whether the watermark advanced
    pub fn finish(mut self) -> Result<bool> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<bool> {
        self.finalized = true;
        if self.exhausted && !std::thread::panicking() {
            self.tracker.advance_watermark(self.resource, self.started_at)?;
            Ok(true)
        } else {
            info!(
                "Watermark for {} left unchanged, run started at {} did not complete",
                self.resource, self.started_at
            );
            Ok(false)
        }
    }
}

impl Drop for WatermarkRun<'_> {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if let Err(e) = self.finalize() {
            error!("Failed to finalize watermark for {}: {:#}", self.resource, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, RecordId};
    use crate::storage::InMemoryStore;
    use chrono::Duration;
    use std::sync::Mutex;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn customer(id: &str, updated_at: DateTime<Utc>) -> Record {
        Record::Customer(Customer {
            id: RecordId::new(id),
            created_at: updated_at,
            updated_at,
            given_name: None,
            family_name: None,
            locality: None,
            postal_code: None,
            reference_id: None,
            note: None,
            creation_source: None,
        })
    }

    fn tracker_at(store: Arc<InMemoryStore>, now: DateTime<Utc>) -> WatermarkTracker {
        WatermarkTracker::new(store).with_clock(Arc::new(FixedClock(Mutex::new(now))))
    }

    #[test]
    fn test_everything_is_new_without_watermark() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = WatermarkTracker::new(store);
        let long_ago = Utc::now() - Duration::days(3650);
        assert!(tracker.is_after_watermark(Resource::Payments, long_ago).unwrap());
    }

    #[test]
    fn test_boundary_record_is_excluded() {
        let store = Arc::new(InMemoryStore::new());
        let t = Utc::now();
        store.upsert_watermark(Resource::Customers, t).unwrap();
        let tracker = WatermarkTracker::new(store);

        let records = vec![
            customer("before", t - Duration::seconds(1)),
            customer("equal", t),
            customer("after", t + Duration::seconds(1)),
        ];
        let mut filter = tracker.filter_records(records, Resource::Customers).unwrap();
        let survivors: Vec<String> = filter.by_ref().map(|r| r.id().as_str().to_string()).collect();

        assert_eq!(survivors, vec!["after".to_string()]);
        assert_eq!(filter.skipped(), 2);
        assert!(!tracker.is_after_watermark(Resource::Customers, t).unwrap());
    }

    #[test]
    fn test_filter_preserves_order() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = WatermarkTracker::new(store);
        let t = Utc::now();
        let records = vec![customer("c3", t), customer("c1", t), customer("c2", t)];

        let ids: Vec<String> = tracker
            .filter_records(records, Resource::Customers)
            .unwrap()
            .map(|r| r.id().as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["c3", "c1", "c2"]);
    }

    #[test]
    fn test_finished_run_advances_to_start_time() {
        let store = Arc::new(InMemoryStore::new());
        let start = Utc::now();
        let tracker = tracker_at(store.clone(), start);

        let mut run = tracker.begin_run(Resource::Orders).unwrap();
        assert!(run.previous().is_none());
        run.mark_exhausted();
        assert!(run.finish().unwrap());

        let mark = store.get_watermark(Resource::Orders).unwrap().unwrap();
        assert_eq!(mark.last_synced_at, start);
    }

    #[test]
    fn test_incomplete_run_leaves_watermark() {
        let store = Arc::new(InMemoryStore::new());
        let earlier = Utc::now() - Duration::hours(1);
        store.upsert_watermark(Resource::Orders, earlier).unwrap();
        let tracker = tracker_at(store.clone(), Utc::now());

        let run = tracker.begin_run(Resource::Orders).unwrap();
        assert!(!run.finish().unwrap());

        let mark = store.get_watermark(Resource::Orders).unwrap().unwrap();
        assert_eq!(mark.last_synced_at, earlier);
    }

    #[test]
    fn test_drop_finalizes_exhausted_run() {
        let store = Arc::new(InMemoryStore::new());
        let start = Utc::now();
        let tracker = tracker_at(store.clone(), start);

        {
            let mut run = tracker.begin_run(Resource::Customers).unwrap();
            run.mark_exhausted();
        }

        let mark = store.get_watermark(Resource::Customers).unwrap().unwrap();
        assert_eq!(mark.last_synced_at, start);
    }

    #[test]
    fn test_dropped_run_without_exhaustion_holds() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = tracker_at(store.clone(), Utc::now());

        {
            let _run = tracker.begin_run(Resource::Customers).unwrap();
        }

        assert!(store.get_watermark(Resource::Customers).unwrap().is_none());
    }
}
