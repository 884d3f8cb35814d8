//! In-memory record store
//!
//! Identical surface to the SQLite backend with no durability. Used by tests
//! and as the fallback when the file-backed store is corrupt beyond recreate.
//! Capacity is bounded by `ram_queue_size` instead of `cache_file_size`.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::record::{current_millis, EventLatency, EventPersistence, HttpHeaders, RecordId, StorageRecord};
use crate::store::{
    selection_order, DroppedReason, MetadataFilter, OfflineStore, StorageKind, StorageObserver,
    TenantCounts,
};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// Per-record accounting overhead mirroring the file backend's estimate
const RECORD_OVERHEAD_BYTES: u64 = 128;

#[derive(Default)]
struct MemoryState {
    records: Vec<StorageRecord>,
    settings: HashMap<String, String>,
    bytes: u64,
}

/// Trim order: lowest latency, `Normal` persistence, oldest first
fn trim_order(a: &StorageRecord, b: &StorageRecord) -> CmpOrdering {
    a.latency
        .cmp(&b.latency)
        .then(a.persistence.cmp(&b.persistence))
        .then(a.timestamp.cmp(&b.timestamp))
        .then(a.id.cmp(&b.id))
}

fn record_bytes(record: &StorageRecord) -> u64 {
    record.payload.len() as u64 + RECORD_OVERHEAD_BYTES
}

pub struct InMemoryEventStore {
    config: StoreConfig,
    state: RwLock<MemoryState>,
    observer: StdRwLock<Option<Arc<dyn StorageObserver>>>,
    open: AtomicBool,
    last_read_count: AtomicUsize,
    last_full_notification_ms: AtomicI64,
}

impl InMemoryEventStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MemoryState::default()),
            observer: StdRwLock::new(None),
            open: AtomicBool::new(false),
            last_read_count: AtomicUsize::new(0),
            last_full_notification_ms: AtomicI64::new(0),
        }
    }

    fn observer(&self) -> Option<Arc<dyn StorageObserver>> {
        self.observer.read().ok().and_then(|g| g.clone())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::StorageUnavailable(
                "in-memory store is not initialized".to_string(),
            ))
        }
    }

    fn notify_storage_full(&self, utilization_pct: u8) {
        let now = current_millis();
        let last = self.last_full_notification_ms.load(Ordering::SeqCst);
        if last != 0 && now - last < self.config.storage_full_notification_interval_ms as i64 {
            return;
        }
        self.last_full_notification_ms.store(now, Ordering::SeqCst);
        if let Some(observer) = self.observer() {
            observer.on_storage_full(utilization_pct);
        }
    }

    fn notify_dropped(&self, reason: DroppedReason, by_tenant: &TenantCounts) {
        let count: u64 = by_tenant.values().sum();
        if count == 0 {
            return;
        }
        crate::metrics::record_dropped(reason.as_str(), count);
        if let Some(observer) = self.observer() {
            observer.on_records_dropped(reason, count, by_tenant);
        }
    }

    /// Evict in trim order until usage fits the cap; returns per-tenant counts
    fn evict_to_cap(state: &mut MemoryState, cap: u64) -> TenantCounts {
        let mut evicted = TenantCounts::new();
        while state.bytes > cap && !state.records.is_empty() {
            let victim_index = state
                .records
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| trim_order(a, b))
                .map(|(i, _)| i)
                .expect("records is non-empty");
            let victim = state.records.swap_remove(victim_index);
            state.bytes = state.bytes.saturating_sub(record_bytes(&victim));
            *evicted.entry(victim.tenant_token).or_insert(0) += 1;
        }
        evicted
    }
}

#[async_trait]
impl OfflineStore for InMemoryEventStore {
    async fn initialize(&self, observer: Arc<dyn StorageObserver>) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.observer.write() {
            *guard = Some(observer);
        }
        self.open.store(true, Ordering::SeqCst);
        tracing::info!(
            ram_queue_size = self.config.ram_queue_size,
            "In-memory storage opened"
        );
        if let Some(observer) = self.observer() {
            observer.on_storage_opened(StorageKind::InMemory);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.write().await;
        for record in &mut state.records {
            record.reserved_until = None;
        }
        tracing::info!("In-memory storage closed");
    }

    async fn store(&self, record: StorageRecord) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let cap = self.config.ram_queue_size;
        if record.payload.len() as u64 >= cap {
            return Err(StoreError::QuotaRejected);
        }

        let mut state = self.state.write().await;
        if state.records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::InvalidArgument(format!(
                "duplicate record id {}",
                record.id
            )));
        }

        let id = record.id.clone();
        let tenant = record.tenant_token.clone();
        state.bytes += record_bytes(&record);
        state.records.push(record);

        if state.bytes > cap {
            let utilization = (state.bytes.saturating_mul(100) / cap).min(255) as u8;
            let mut evicted = Self::evict_to_cap(&mut state, cap);
            let survived = state.records.iter().any(|r| r.id == id);
            drop(state);
            self.notify_storage_full(utilization);
            if !survived {
                // The new record itself was the lowest-priority victim; it is
                // a quota rejection, not an eviction.
                if let Some(count) = evicted.get_mut(&tenant) {
                    *count -= 1;
                    if *count == 0 {
                        evicted.remove(&tenant);
                    }
                }
                self.notify_dropped(DroppedReason::PressureEviction, &evicted);
                return Ok(false);
            }
            self.notify_dropped(DroppedReason::PressureEviction, &evicted);
        }

        crate::metrics::record_stored(&tenant);
        Ok(true)
    }

    async fn acquire(
        &self,
        lease_ms: u64,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError> {
        self.ensure_open()?;
        if max_count == 0 {
            self.last_read_count.store(0, Ordering::SeqCst);
            return Ok(Vec::new());
        }

        let now = current_millis();
        let deadline = now + lease_ms as i64;
        let mut state = self.state.write().await;

        let mut candidates: Vec<usize> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.latency >= min_latency && r.is_available(now))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by(|&a, &b| selection_order(&state.records[a], &state.records[b]));
        candidates.truncate(max_count);

        let mut batch = Vec::with_capacity(candidates.len());
        for index in candidates {
            state.records[index].reserved_until = Some(deadline);
            batch.push(state.records[index].clone());
        }

        self.last_read_count.store(batch.len(), Ordering::SeqCst);
        crate::metrics::record_acquire_batch(batch.len());
        Ok(batch)
    }

    async fn complete(&self, ids: &[RecordId], headers: &HttpHeaders) -> Result<(), StoreError> {
        self.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }
        if !headers.is_empty() {
            tracing::debug!(count = ids.len(), headers = ?headers, "Completing uploaded records");
        }

        let mut state = self.state.write().await;
        let mut deleted = 0u64;
        state.records.retain(|record| {
            if ids.contains(&record.id) {
                deleted += 1;
                false
            } else {
                true
            }
        });
        let remaining: u64 = state.records.iter().map(record_bytes).sum();
        state.bytes = remaining;
        crate::metrics::record_completed(deleted);
        Ok(())
    }

    async fn release(
        &self,
        ids: &[RecordId],
        increment_retry: bool,
        headers: &HttpHeaders,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        let mut exhausted = TenantCounts::new();
        let max_retry = self.config.max_retry_count;

        state.records.retain_mut(|record| {
            if !ids.contains(&record.id) {
                return true;
            }
            if increment_retry && record.retry_count + 1 >= max_retry {
                *exhausted.entry(record.tenant_token.clone()).or_insert(0) += 1;
                return false;
            }
            record.reserved_until = None;
            if increment_retry {
                record.retry_count += 1;
            }
            if !headers.is_empty() {
                record.http_headers = Some(headers.clone());
            }
            true
        });
        let remaining: u64 = state.records.iter().map(record_bytes).sum();
        state.bytes = remaining;
        drop(state);

        if !exhausted.is_empty() {
            tracing::warn!(
                count = exhausted.values().sum::<u64>(),
                "Dropped records with exhausted retry budget"
            );
            self.notify_dropped(DroppedReason::RetriesExhausted, &exhausted);
        }
        Ok(())
    }

    async fn delete_matching(&self, filter: &MetadataFilter) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let mut tenant: Option<String> = None;
        let mut latency: Option<EventLatency> = None;
        let mut persistence: Option<EventPersistence> = None;
        for (key, value) in filter {
            match key.as_str() {
                "tenant_token" => tenant = Some(value.clone()),
                "latency" => {
                    latency = Some(EventLatency::from_name(value).ok_or_else(|| {
                        StoreError::InvalidArgument(format!("unknown latency '{}'", value))
                    })?)
                }
                "persistence" => {
                    persistence = Some(EventPersistence::from_name(value).ok_or_else(|| {
                        StoreError::InvalidArgument(format!("unknown persistence '{}'", value))
                    })?)
                }
                other => {
                    return Err(StoreError::InvalidArgument(format!(
                        "unknown filter key '{}'",
                        other
                    )))
                }
            }
        }
        if tenant.is_none() && latency.is_none() && persistence.is_none() {
            return Err(StoreError::InvalidArgument(
                "delete_matching requires at least one condition".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let mut deleted = 0u64;
        state.records.retain(|record| {
            let matches = tenant.as_deref().map_or(true, |t| record.tenant_token == t)
                && latency.map_or(true, |l| record.latency == l)
                && persistence.map_or(true, |p| record.persistence == p);
            if matches {
                deleted += 1;
            }
            !matches
        });
        let remaining: u64 = state.records.iter().map(record_bytes).sum();
        state.bytes = remaining;
        Ok(deleted)
    }

    async fn get_records(
        &self,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        let mut records: Vec<StorageRecord> = state
            .records
            .iter()
            .filter(|r| r.latency >= min_latency)
            .cloned()
            .collect();
        records.sort_by(selection_order);
        if max_count > 0 {
            records.truncate(max_count);
        }
        Ok(records)
    }

    async fn get_record_count(&self, latency: Option<EventLatency>) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        let count = state
            .records
            .iter()
            .filter(|r| latency.map_or(true, |l| r.latency == l))
            .count();
        Ok(count as u64)
    }

    async fn get_size(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        Ok(self.state.read().await.bytes)
    }

    async fn resize(&self) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let evicted = Self::evict_to_cap(&mut state, self.config.ram_queue_size);
        let within = state.bytes <= self.config.ram_queue_size;
        drop(state);
        self.notify_dropped(DroppedReason::PressureEviction, &evicted);
        Ok(within)
    }

    async fn quota_check(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let cap = self.config.ram_queue_size;
        let bytes = self.state.read().await.bytes;
        let soft = cap * u64::from(self.config.cache_file_full_notification_percentage) / 100;
        if bytes > cap {
            self.resize().await?;
        } else if bytes >= soft {
            let utilization = (bytes.saturating_mul(100) / cap).min(255) as u8;
            self.notify_storage_full(utilization);
        }
        Ok(())
    }

    async fn store_setting(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "setting name must not be empty".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        state.settings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_setting(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        Ok(self.state.read().await.settings.get(name).cloned())
    }

    async fn delete_setting(&self, name: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.state.write().await.settings.remove(name);
        Ok(())
    }

    fn kind(&self) -> StorageKind {
        StorageKind::InMemory
    }

    fn last_read_from_memory(&self) -> bool {
        true
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::SeqCst)
    }
}
