//! Device telemetry cache: the latest decoded reading per device, used so
//! conditional rules can evaluate a shunt predicate against a different
//! device's most recent data without waiting on that device's next publish.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::Telemetry;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fields: Arc<HashMap<String, f64>>,
    pub last_update: f64,
}

/// Multi-reader/single-writer per-device cache. Readers get an `Arc` clone
/// of the fields map rather than the map itself, so a snapshot read never
/// mutates under the caller even while a concurrent `put` is in flight.
#[derive(Default)]
pub struct TelemetryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache entry for `telemetry.device_id` wholesale.
    pub async fn put(&self, telemetry: &Telemetry) {
        let entry = CacheEntry {
            fields: Arc::new(telemetry.fields.clone()),
            last_update: telemetry.arrival_timestamp,
        };
        self.entries
            .write()
            .await
            .insert(telemetry.device_id.clone(), entry);
    }

    pub async fn get(&self, device_id: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(device_id).cloned()
    }

    /// Look up `field` on `device_id`'s most recent entry, returning `None`
    /// if the device has never published, the field is absent, or the
    /// entry is older than `freshness_seconds` relative to `now`.
    pub async fn fresh_field(
        &self,
        device_id: &str,
        field: &str,
        now: f64,
        freshness_seconds: f64,
    ) -> Option<f64> {
        let entry = self.get(device_id).await?;
        if now - entry.last_update > freshness_seconds {
            return None;
        }
        entry.fields.get(field).copied()
    }
}
