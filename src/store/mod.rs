//! Durable record storage with leased hand-off to an uploader
//!
//! Two backends share one surface:
//! - **SQLite** (`sqlite`): the durable store with WAL journaling,
//!   transactional lease accounting, and tenant-aware quota trimming
//! - **In-memory** (`memory`): identical surface without durability, used by
//!   tests and as the corruption fallback
//!
//! Uploaders interact through `acquire`/`complete`/`release`: `acquire`
//! reserves a batch under a time-bounded lease inside one transaction, and a
//! vanished uploader costs nothing because its leases expire and the records
//! become selectable again.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryEventStore;
pub use sqlite::SqliteEventStore;

use crate::error::StoreError;
use crate::record::{EventLatency, HttpHeaders, RecordId, StorageRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Which backend kind is serving requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    File,
    InMemory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::InMemory => "in_memory",
        }
    }
}

/// Why records were removed without a successful upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroppedReason {
    RetriesExhausted,
    Trim,
    PressureEviction,
    Expired,
}

impl DroppedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Trim => "trim",
            Self::PressureEviction => "pressure_eviction",
            Self::Expired => "expired",
        }
    }
}

/// Per-tenant record counts attached to drop notifications
pub type TenantCounts = HashMap<String, u64>;

/// Callback surface by which the store notifies the outer system
///
/// All methods default to no-ops so observers implement only what they need.
/// Callbacks fire outside the store's transactions; implementations must not
/// call back into the store from them.
pub trait StorageObserver: Send + Sync {
    fn on_storage_opened(&self, _kind: StorageKind) {}

    /// Rate-limited by `storage_full_notification_interval_ms`
    fn on_storage_full(&self, _utilization_pct: u8) {}

    fn on_records_dropped(&self, _reason: DroppedReason, _count: u64, _by_tenant: &TenantCounts) {}

    fn on_storage_failed(&self, _error_kind: &'static str, _details: &str) {}
}

/// Observer that ignores every notification
pub struct NoopObserver;

impl StorageObserver for NoopObserver {}

/// Conjunctive metadata filter for `delete_matching`
///
/// Recognized keys: `tenant_token`, `latency`, `persistence`.
pub type MetadataFilter = HashMap<String, String>;

/// The offline record store contract
///
/// Both backends are safe for concurrent use; every state-mutating operation
/// is atomic. Selection order everywhere is latency DESC, `Critical` before
/// `Normal`, timestamp ASC, id ASC; trimming removes records in the reverse
/// of that order.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Open or create the backing store and register the observer
    ///
    /// Corruption triggers one automatic recreate; a second detection fails
    /// with `StorageCorrupt` and the caller is expected to degrade to the
    /// in-memory backend.
    async fn initialize(&self, observer: Arc<dyn StorageObserver>) -> Result<(), StoreError>;

    /// Flush, return leased records to the selectable pool, close. Idempotent.
    async fn shutdown(&self);

    /// Insert a record atomically
    ///
    /// Returns `false` when quota policy still rejects the record after a
    /// trim attempt. A record whose payload alone exceeds the hard size limit
    /// fails with `QuotaRejected` without touching the store.
    async fn store(&self, record: StorageRecord) -> Result<bool, StoreError>;

    /// Reserve and return up to `max_count` records under a lease
    ///
    /// Selects available and expired-reserved records with
    /// `latency >= min_latency` in selection order and stamps
    /// `reserved_until = now + lease_ms` on them inside the same transaction
    /// that read them, so no two concurrent callers receive the same record.
    /// `max_count == 0` returns an empty batch and reserves nothing. A caller
    /// declines a record by releasing it without a retry increment.
    async fn acquire(
        &self,
        lease_ms: u64,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError>;

    /// Delete records after a successful upload
    ///
    /// Unknown ids are tolerated silently: a duplicate completion is success.
    async fn complete(&self, ids: &[RecordId], headers: &HttpHeaders) -> Result<(), StoreError>;

    /// Return leased records to the pool, optionally charging the retry budget
    ///
    /// With `increment_retry`, records whose incremented count reaches
    /// `max_retry_count` are deleted instead and reported to the observer as
    /// `retries_exhausted`. Unknown ids are a no-op.
    async fn release(
        &self,
        ids: &[RecordId],
        increment_retry: bool,
        headers: &HttpHeaders,
    ) -> Result<(), StoreError>;

    /// Delete records matching every key/value pair in `filter`
    async fn delete_matching(&self, filter: &MetadataFilter) -> Result<u64, StoreError>;

    /// Non-reserving snapshot in selection order; `max_count == 0` means all
    async fn get_records(
        &self,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError>;

    async fn get_record_count(&self, latency: Option<EventLatency>) -> Result<u64, StoreError>;

    /// Current size estimate in bytes
    async fn get_size(&self) -> Result<u64, StoreError>;

    /// Run the trim policy now; returns whether the store is within its limit
    async fn resize(&self) -> Result<bool, StoreError>;

    /// Rate-limited evaluation of the size thresholds, trimming when needed
    async fn quota_check(&self) -> Result<(), StoreError>;

    /// Upsert a cross-restart setting; last writer wins
    async fn store_setting(&self, name: &str, value: &str) -> Result<(), StoreError>;

    async fn get_setting(&self, name: &str) -> Result<Option<String>, StoreError>;

    async fn delete_setting(&self, name: &str) -> Result<(), StoreError>;

    fn kind(&self) -> StorageKind;

    /// Whether the last acquire was served from the in-memory backend
    fn last_read_from_memory(&self) -> bool;

    /// Record count delivered by the last acquire
    fn last_read_record_count(&self) -> usize;
}

/// Compare two records in acquire selection order
///
/// Latency DESC, persistence DESC (Critical first), timestamp ASC, id ASC.
pub(crate) fn selection_order(a: &StorageRecord, b: &StorageRecord) -> std::cmp::Ordering {
    b.latency
        .cmp(&a.latency)
        .then(b.persistence.cmp(&a.persistence))
        .then(a.timestamp.cmp(&b.timestamp))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventPersistence;

    fn record(id: &str, latency: EventLatency, persistence: EventPersistence, ts: i64) -> StorageRecord {
        StorageRecord::new("tenant", latency, persistence, vec![])
            .with_id(id)
            .with_timestamp(ts)
    }

    #[test]
    fn test_selection_order() {
        let realtime = record("b", EventLatency::RealTime, EventPersistence::Normal, 10);
        let critical = record("c", EventLatency::Normal, EventPersistence::Critical, 10);
        let older = record("a", EventLatency::Normal, EventPersistence::Normal, 5);
        let newer = record("d", EventLatency::Normal, EventPersistence::Normal, 10);

        let mut records = vec![newer.clone(), older.clone(), critical.clone(), realtime.clone()];
        records.sort_by(selection_order);

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn test_dropped_reason_names() {
        assert_eq!(DroppedReason::RetriesExhausted.as_str(), "retries_exhausted");
        assert_eq!(DroppedReason::PressureEviction.as_str(), "pressure_eviction");
    }
}
