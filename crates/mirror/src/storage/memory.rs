//! In-memory storage implementation
//!
//! Used by tests and for dry runs where nothing should touch disk.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::{CredentialStore, RecordSink, WatermarkStore};
use crate::models::{Credential, Record, RecordId, Resource, SyncWatermark};

/// In-memory implementation of all store traits
///
/// Uses maps protected by RwLocks for thread-safe access.
pub struct InMemoryStore {
    /// Credential rows in insertion order
    credentials: RwLock<Vec<Credential>>,
    watermarks: RwLock<BTreeMap<Resource, SyncWatermark>>,
    records: RwLock<HashMap<(Resource, RecordId), Record>>,
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("In-memory store lock poisoned")
}

/// Latest row for the account; on equal timestamps the later insert wins
fn latest_for<'a>(rows: &'a [Credential], account_id: &str) -> Option<&'a Credential> {
    rows.iter()
        .filter(|c| c.account_id == account_id)
        .max_by_key(|c| c.created_at)
}

impl InMemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(Vec::new()),
            watermarks: RwLock::new(BTreeMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of credential rows stored for an account (all generations)
    pub fn credential_count(&self, account_id: &str) -> Result<usize> {
        let rows = self.credentials.read().map_err(poisoned)?;
        Ok(rows.iter().filter(|c| c.account_id == account_id).count())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryStore {
    fn most_recent_credential(&self, account_id: &str) -> Result<Option<Credential>> {
        let rows = self.credentials.read().map_err(poisoned)?;
        Ok(latest_for(&rows, account_id).cloned())
    }

    fn upsert_credential(&self, credential: Credential) -> Result<()> {
        let mut rows = self.credentials.write().map_err(poisoned)?;
        rows.push(credential);
        Ok(())
    }

    fn upsert_and_reload_credential(&self, credential: Credential) -> Result<Option<Credential>> {
        let mut rows = self.credentials.write().map_err(poisoned)?;
        let account_id = credential.account_id.clone();
        rows.push(credential);
        Ok(latest_for(&rows, &account_id).cloned())
    }
}

impl WatermarkStore for InMemoryStore {
    fn get_watermark(&self, resource: Resource) -> Result<Option<SyncWatermark>> {
        let marks = self.watermarks.read().map_err(poisoned)?;
        Ok(marks.get(&resource).cloned())
    }

    fn upsert_watermark(&self, resource: Resource, last_synced_at: DateTime<Utc>) -> Result<()> {
        let mut marks = self.watermarks.write().map_err(poisoned)?;
        let mark = match marks.remove(&resource) {
            Some(existing) => existing.advanced(last_synced_at),
            None => SyncWatermark::new(resource, last_synced_at),
        };
        marks.insert(resource, mark);
        Ok(())
    }

    fn list_watermarks(&self) -> Result<Vec<SyncWatermark>> {
        let marks = self.watermarks.read().map_err(poisoned)?;
        Ok(marks.values().cloned().collect())
    }
}

impl RecordSink for InMemoryStore {
    fn upsert_record(&self, record: Record) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        let key = (record.resource(), record.id().clone());
        let record = match records.get(&key) {
            Some(existing) => record.with_created_at(existing.created_at()),
            None => record,
        };
        records.insert(key, record);
        Ok(())
    }

    fn get_record(&self, resource: Resource, id: &RecordId) -> Result<Option<Record>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&(resource, id.clone())).cloned())
    }

    fn count_records(&self, resource: Resource) -> Result<usize> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.keys().filter(|(r, _)| *r == resource).count())
    }
}
