//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{Credential, Record, RecordId, Resource, SyncWatermark};

/// Credential rows per account, ordered by creation time
pub trait CredentialStore: Send + Sync {
    /// Most recently created credential for the account
    fn most_recent_credential(&self, account_id: &str) -> Result<Option<Credential>>;

    /// Persist a credential row
    fn upsert_credential(&self, credential: Credential) -> Result<()>;

    /// Persist a credential and read back the account's most recent row,
    /// both inside one transaction
    fn upsert_and_reload_credential(&self, credential: Credential) -> Result<Option<Credential>> {
        let account_id = credential.account_id.clone();
        self.upsert_credential(credential)?;
        self.most_recent_credential(&account_id)
    }
}

/// One watermark row per resource
pub trait WatermarkStore: Send + Sync {
    /// Current watermark for the resource, if any run has finished
    fn get_watermark(&self, resource: Resource) -> Result<Option<SyncWatermark>>;

    /// Set the watermark. Implementations keep the later of the stored and
    /// the given timestamp.
    fn upsert_watermark(&self, resource: Resource, last_synced_at: DateTime<Utc>) -> Result<()>;

    /// All stored watermarks
    fn list_watermarks(&self) -> Result<Vec<SyncWatermark>>;
}

/// Destination for mirrored records
pub trait RecordSink: Send + Sync {
    /// Insert the record, or overwrite every field except its id and
    /// creation time if it already exists
    fn upsert_record(&self, record: Record) -> Result<()>;

    /// Look up a stored record
    fn get_record(&self, resource: Resource, id: &RecordId) -> Result<Option<Record>>;

    /// Number of stored records of a resource type
    fn count_records(&self, resource: Resource) -> Result<usize>;
}
