//! Storage traits and implementations
//!
//! Components receive explicit store handles instead of reaching for a
//! global connection. The in-memory and SQLite backends implement the same
//! traits and can be swapped freely.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CredentialStore, RecordSink, WatermarkStore};
