//! Admission pipeline and engine plumbing
//!
//! `TelemetryEngine` binds the emit path together: diag-level gate, context
//! stamping, tenant filter, then the offline store. It also owns the
//! corruption fallback to the in-memory backend and the background quota
//! check task. `EngineRegistry` is an explicit registry object passed around
//! by reference, so unit tests stay isolated and group shutdown has no global
//! state.

use crate::config::StoreConfig;
use crate::context::ContextFieldsProvider;
use crate::error::StoreError;
use crate::filter::{DiagLevelFilter, EventFilterRegulator};
use crate::record::{Event, EventLatency, HttpHeaders, RecordId, StorageRecord};
use crate::store::{InMemoryEventStore, OfflineStore, SqliteEventStore, StorageObserver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Which admission stage filtered an event out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilteredReason {
    DiagLevel,
    TenantFilter,
}

/// Outcome of one emit; filter rejections are neutral, not errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Stored(RecordId),
    Filtered(FilteredReason),
    /// Quota policy rejected the record; the caller may retry after backoff
    Rejected,
}

/// The engine binding filters, context, and the offline store
pub struct TelemetryEngine {
    config: StoreConfig,
    diag_filter: DiagLevelFilter,
    regulator: EventFilterRegulator,
    context: Arc<ContextFieldsProvider>,
    observer: Arc<dyn StorageObserver>,
    store: RwLock<Arc<dyn OfflineStore>>,
    degraded: AtomicBool,
}

impl TelemetryEngine {
    /// Open the configured store and build the engine around it
    ///
    /// A corrupt file store that also fails its recreate attempt degrades to
    /// the in-memory backend for the process lifetime instead of failing.
    pub async fn new(
        config: StoreConfig,
        observer: Arc<dyn StorageObserver>,
    ) -> Result<Arc<Self>, StoreError> {
        let mut degraded = false;
        let primary: Arc<dyn OfflineStore> = if config.in_memory {
            Arc::new(InMemoryEventStore::new(config.clone()))
        } else {
            Arc::new(SqliteEventStore::new(config.clone()))
        };

        let store: Arc<dyn OfflineStore> = match primary.initialize(observer.clone()).await {
            Ok(()) => primary,
            Err(StoreError::StorageCorrupt(reason)) => {
                tracing::error!(
                    reason = %reason,
                    "Offline storage unrecoverable, falling back to in-memory queue"
                );
                let fallback = Arc::new(InMemoryEventStore::new(config.clone()));
                fallback.initialize(observer.clone()).await?;
                degraded = true;
                fallback
            }
            Err(e) => return Err(e),
        };

        Ok(Arc::new(Self {
            config,
            diag_filter: DiagLevelFilter::new(),
            regulator: EventFilterRegulator::new(),
            context: Arc::new(ContextFieldsProvider::new()),
            observer,
            store: RwLock::new(store),
            degraded: AtomicBool::new(degraded),
        }))
    }

    pub fn diag_filter(&self) -> &DiagLevelFilter {
        &self.diag_filter
    }

    pub fn regulator(&self) -> &EventFilterRegulator {
        &self.regulator
    }

    pub fn context(&self) -> &Arc<ContextFieldsProvider> {
        &self.context
    }

    /// Whether the engine has fallen back to the in-memory queue
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Current store handle, for uploader wiring and introspection
    pub async fn store(&self) -> Arc<dyn OfflineStore> {
        self.store.read().await.clone()
    }

    /// Run an event through the admission pipeline
    ///
    /// Stage order: diag-level gate, context stamp, tenant filter, store.
    pub async fn submit(&self, mut event: Event) -> Result<AdmissionOutcome, StoreError> {
        let level = event
            .diag_level
            .unwrap_or_else(|| self.diag_filter.default_level());
        if self.diag_filter.is_filtering_enabled() && !self.diag_filter.is_enabled(level) {
            crate::metrics::record_filtered("diag_level");
            return Ok(AdmissionOutcome::Filtered(FilteredReason::DiagLevel));
        }

        self.context.write_to_event(&mut event, false);

        // The record id participates in the sampling hash, so it is drawn
        // before the filter decision.
        let record_id = Uuid::new_v4().to_string();
        if !self
            .regulator
            .should_send(&event.tenant_token, &event.name, &record_id)
        {
            crate::metrics::record_filtered("tenant_filter");
            return Ok(AdmissionOutcome::Filtered(FilteredReason::TenantFilter));
        }

        let payload = event.to_payload()?;
        let record = StorageRecord {
            id: record_id.clone(),
            tenant_token: event.tenant_token.clone(),
            latency: event.latency,
            persistence: event.persistence,
            timestamp: event.timestamp,
            retry_count: 0,
            reserved_until: None,
            http_headers: None,
            payload,
        };

        match self.store_record(record).await {
            Ok(true) => Ok(AdmissionOutcome::Stored(record_id)),
            Ok(false) | Err(StoreError::QuotaRejected) => Ok(AdmissionOutcome::Rejected),
            Err(e) => Err(e),
        }
    }

    async fn store_record(&self, record: StorageRecord) -> Result<bool, StoreError> {
        let store = self.store().await;
        match store.store(record.clone()).await {
            Err(StoreError::StorageCorrupt(reason)) => {
                self.degrade(&reason).await?;
                self.store().await.store(record).await
            }
            other => other,
        }
    }

    /// Swap to the in-memory backend after runtime corruption
    async fn degrade(&self, reason: &str) -> Result<(), StoreError> {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::error!(
            reason = %reason,
            "Offline storage corrupt at runtime, degrading to in-memory queue"
        );
        self.observer.on_storage_failed("storage_corrupt", reason);

        let old = self.store().await;
        old.shutdown().await;

        let fallback: Arc<dyn OfflineStore> = Arc::new(InMemoryEventStore::new(self.config.clone()));
        fallback.initialize(self.observer.clone()).await?;
        *self.store.write().await = fallback;
        Ok(())
    }

    /// Uploader surface: reserve a batch under a lease
    pub async fn acquire(
        &self,
        lease_ms: u64,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError> {
        self.store().await.acquire(lease_ms, min_latency, max_count).await
    }

    /// Uploader surface: acknowledge uploaded records
    pub async fn complete(&self, ids: &[RecordId], headers: &HttpHeaders) -> Result<(), StoreError> {
        self.store().await.complete(ids, headers).await
    }

    /// Uploader surface: return records after a failed or declined upload
    pub async fn release(
        &self,
        ids: &[RecordId],
        increment_retry: bool,
        headers: &HttpHeaders,
    ) -> Result<(), StoreError> {
        self.store().await.release(ids, increment_retry, headers).await
    }

    pub async fn shutdown(&self) {
        self.store().await.shutdown().await;
    }
}

/// Spawn the maintenance task running the rate-limited quota check
///
/// The task runs until aborted; callers keep the handle and abort it at
/// teardown.
pub fn spawn_quota_task(engine: &Arc<TelemetryEngine>) -> tokio::task::JoinHandle<()> {
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(engine.config.db_full_check_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let store = engine.store().await;
            if let Err(e) = store.quota_check().await {
                tracing::warn!(error = %e, "Quota check failed");
            }
        }
    })
}

/// Explicit registry of live engines
///
/// Passed by reference to whoever constructs engines; registration at
/// construction keeps unit-test isolation trivial and `shutdown_all` gives
/// hosts one teardown point.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<Vec<Weak<TelemetryEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: &Arc<TelemetryEngine>) {
        let mut engines = self.engines.lock().expect("registry poisoned");
        engines.retain(|weak| weak.strong_count() > 0);
        engines.push(Arc::downgrade(engine));
    }

    pub fn len(&self) -> usize {
        let mut engines = self.engines.lock().expect("registry poisoned");
        engines.retain(|weak| weak.strong_count() > 0);
        engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every live engine and clear the registry
    pub async fn shutdown_all(&self) {
        let live: Vec<Arc<TelemetryEngine>> = {
            let mut engines = self.engines.lock().expect("registry poisoned");
            let live = engines.iter().filter_map(Weak::upgrade).collect();
            engines.clear();
            live
        };
        for engine in live {
            engine.shutdown().await;
        }
    }
}
