//! Sync engine and its building blocks
//!
//! This module provides:
//! - Watermark tracking with a per-run scope guard
//! - Paginated fetching with rate-limit backoff
//! - The engine that ties credentials, fetching and storage together

mod engine;
mod fetcher;
mod timing;
mod watermark;

pub use engine::{SyncEngine, SyncStats};
pub use fetcher::{BackoffPolicy, FetchStop, ListPage, ListRequest, ListingSource, PageFetcher};
pub use timing::{Clock, ShutdownSignal, Sleeper, Slept, SystemClock, ThreadSleeper};
pub use watermark::{FilterRecords, WatermarkRun, WatermarkTracker};
