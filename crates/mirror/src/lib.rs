//! Mirror crate - incremental sync of Square merchant data
//!
//! This crate provides:
//! - Domain models (Credential, Record, SyncWatermark)
//! - Square OAuth refresh and listing clients
//! - Storage trait abstractions with in-memory and SQLite backends
//! - Credential lifecycle management with per-account refresh serialization
//! - Watermark-based incremental sync engine with rate-limit backoff
//!
//! All I/O is blocking; the runner decides which threads to use.

pub mod config;
pub mod error;
pub mod models;
pub mod square;
pub mod storage;
pub mod sync;
pub mod token;

pub use config::{MirrorConfig, RetrySettings};
pub use error::{FailureKind, ListError, SyncError};
pub use models::{
    Credential, CredentialState, Customer, Order, Payment, Record, RecordId, Resource,
    SyncWatermark, TokenGrant,
};
pub use square::{SquareAuth, SquareClient, normalize_record};
pub use storage::{CredentialStore, InMemoryStore, RecordSink, SqliteStore, WatermarkStore};
pub use sync::{
    // Sync execution
    SyncEngine, SyncStats, FetchStop,
    // Building blocks
    BackoffPolicy, ListPage, ListRequest, ListingSource, PageFetcher, WatermarkRun,
    WatermarkTracker,
    // Time and shutdown
    Clock, ShutdownSignal, Sleeper, Slept, SystemClock, ThreadSleeper,
};
pub use token::{TokenEndpoint, TokenManager};
