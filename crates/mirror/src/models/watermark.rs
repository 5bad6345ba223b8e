//! Per-resource sync watermark

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Resource;

/// High-water mark for one resource type
///
/// `last_synced_at` is the start time of the last run that finished, not the
/// timestamp of the newest record seen. Only one row per resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub resource: Resource,
    pub last_synced_at: DateTime<Utc>,
}

impl SyncWatermark {
    pub fn new(resource: Resource, last_synced_at: DateTime<Utc>) -> Self {
        Self {
            resource,
            last_synced_at,
        }
    }

    /// Whether a record stamped `ts` was already mirrored by the last finished run.
    ///
    /// Inclusive: a record stamped exactly at the watermark is covered.
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        ts <= self.last_synced_at
    }

    /// Move forward to `ts`; an older `ts` leaves the watermark unchanged
    pub fn advanced(mut self, ts: DateTime<Utc>) -> Self {
        if ts > self.last_synced_at {
            self.last_synced_at = ts;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_covers_includes_boundary() {
        let t = Utc::now();
        let mark = SyncWatermark::new(Resource::Customers, t);
        assert!(mark.covers(t - Duration::seconds(1)));
        assert!(mark.covers(t));
        assert!(!mark.covers(t + Duration::seconds(1)));
    }

    #[test]
    fn test_advanced_never_moves_back() {
        let t = Utc::now();
        let mark = SyncWatermark::new(Resource::Payments, t);
        let earlier = mark.clone().advanced(t - Duration::hours(1));
        assert_eq!(earlier.last_synced_at, t);
        let later = mark.advanced(t + Duration::hours(1));
        assert_eq!(later.last_synced_at, t + Duration::hours(1));
    }
}
