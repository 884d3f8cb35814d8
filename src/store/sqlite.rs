//! SQLite-backed durable record store
//!
//! This module provides the crash-safe storage engine with:
//! - WAL mode and a bounded connection pool
//! - Transactional lease accounting (reserve/complete/release)
//! - Schema-version gating with automatic recreate on corruption
//! - Tenant-aware, latency-tiered quota trimming

use crate::config::StoreConfig;
use crate::error::{is_transient, StoreError};
use crate::record::{current_millis, EventLatency, HttpHeaders, RecordId, StorageRecord};
use crate::store::{
    DroppedReason, MetadataFilter, OfflineStore, StorageKind, StorageObserver, TenantCounts,
};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::RwLock;

/// Persisted schema version; a higher on-disk version is forward-incompatible
const SCHEMA_VERSION: i64 = 1;

const SETTING_SCHEMA_VERSION: &str = "schema_version";
const SETTING_OPEN_EPOCH: &str = "open_epoch";
const SETTING_CLOSE_EPOCH: &str = "close_epoch";

/// Fixed per-record metadata overhead added to the incremental size estimate
const RECORD_OVERHEAD_BYTES: u64 = 128;

const TRANSIENT_RETRY_LIMIT: u32 = 3;
const TRANSIENT_RETRY_BACKOFF_MS: u64 = 50;

/// Rows deleted per pass while evicting under hard pressure
const EVICTION_BATCH: i64 = 64;

const SELECT_COLUMNS: &str = "record_id, tenant_token, latency, persistence, timestamp, \
     retry_count, reserved_until, http_headers, payload";

/// Durable record store on a single SQLite file
///
/// All state-mutating operations run inside transactions, so the lease
/// invariants hold across concurrent uploaders and process crashes. With
/// `config.in_memory` set the same engine runs on `sqlite::memory:`, which is
/// how the unit tests exercise it.
pub struct SqliteEventStore {
    config: StoreConfig,
    pool: RwLock<Option<SqlitePool>>,
    observer: StdRwLock<Option<Arc<dyn StorageObserver>>>,
    size_estimate: AtomicU64,
    epoch: AtomicI64,
    last_full_check_ms: AtomicI64,
    last_full_notification_ms: AtomicI64,
    last_read_count: AtomicUsize,
    recreate_attempted: AtomicBool,
}

impl SqliteEventStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            observer: StdRwLock::new(None),
            size_estimate: AtomicU64::new(0),
            epoch: AtomicI64::new(0),
            last_full_check_ms: AtomicI64::new(0),
            last_full_notification_ms: AtomicI64::new(0),
            last_read_count: AtomicUsize::new(0),
            recreate_attempted: AtomicBool::new(false),
        }
    }

    fn observer(&self) -> Option<Arc<dyn StorageObserver>> {
        self.observer.read().ok().and_then(|g| g.clone())
    }

    async fn pool(&self) -> Result<SqlitePool, StoreError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::StorageUnavailable("store is not initialized".to_string()))
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions, StoreError> {
        let url = if self.config.in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}", self.config.cache_file_path)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            // auto_vacuum must be in effect before the first table is created
            // for incremental_vacuum to reclaim pages after trims
            .pragma("auto_vacuum", "INCREMENTAL")
            .pragma("temp_store", "memory")
            .pragma("synchronous", "NORMAL");
        Ok(options)
    }

    async fn open_pool(&self) -> Result<SqlitePool, StoreError> {
        let options = self.connect_options()?;
        // sqlite::memory: gives every pooled connection its own database, so
        // the single connection must be pinned for the store's lifetime
        let (max_connections, min_connections) = if self.config.in_memory { (1, 1) } else { (5, 0) };

        let mut attempts = 0;
        loop {
            let result = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .min_connections(min_connections)
                .acquire_timeout(Duration::from_secs(30))
                .connect_with(options.clone())
                .await;
            match result {
                Ok(pool) => return Ok(pool),
                Err(e) if is_transient(&e) && attempts < TRANSIENT_RETRY_LIMIT => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(
                        TRANSIENT_RETRY_BACKOFF_MS * u64::from(attempts),
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn begin_with_retry(
        &self,
        pool: &SqlitePool,
    ) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, StoreError> {
        let mut attempts = 0;
        loop {
            match pool.begin().await {
                Ok(tx) => return Ok(tx),
                Err(e) if is_transient(&e) && attempts < TRANSIENT_RETRY_LIMIT => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(
                        TRANSIENT_RETRY_BACKOFF_MS * u64::from(attempts),
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                 record_id      TEXT PRIMARY KEY,
                 tenant_token   TEXT NOT NULL,
                 latency        INTEGER NOT NULL,
                 persistence    INTEGER NOT NULL,
                 timestamp      INTEGER NOT NULL,
                 retry_count    INTEGER NOT NULL DEFAULT 0,
                 reserved_until INTEGER NOT NULL DEFAULT 0,
                 http_headers   TEXT,
                 payload        BLOB NOT NULL
             )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_events_latency_timestamp ON events (latency, timestamp)",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS ix_events_tenant ON events (tenant_token)")
            .execute(pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                 name  TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn read_setting(pool: &SqlitePool, name: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    async fn write_setting(pool: &SqlitePool, name: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR REPLACE INTO settings (name, value) VALUES (?, ?)")
            .bind(name)
            .bind(value)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Open the pool and verify the schema, closing the pool again on failure
    async fn open_and_verify(&self) -> Result<SqlitePool, StoreError> {
        let pool = self.open_pool().await?;
        if let Err(e) = self.verify_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(pool)
    }

    /// Verify the schema-version row; an `Err` means the database must be recreated
    async fn verify_schema(&self, pool: &SqlitePool) -> Result<(), StoreError> {
        Self::create_schema(pool).await.map_err(StoreError::from)?;

        let version = Self::read_setting(pool, SETTING_SCHEMA_VERSION)
            .await
            .map_err(StoreError::from)?
            .and_then(|v| v.parse::<i64>().ok());

        match version {
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) if v > SCHEMA_VERSION => Err(StoreError::StorageCorrupt(format!(
                "on-disk schema version {} is newer than supported version {}",
                v, SCHEMA_VERSION
            ))),
            Some(v) => Err(StoreError::StorageCorrupt(format!(
                "on-disk schema version {} predates supported version {}",
                v, SCHEMA_VERSION
            ))),
            None => {
                let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
                    .fetch_one(pool)
                    .await
                    .map_err(StoreError::from)?;
                if count > 0 {
                    return Err(StoreError::StorageCorrupt(
                        "events present without a schema version row".to_string(),
                    ));
                }
                Self::write_setting(pool, SETTING_SCHEMA_VERSION, &SCHEMA_VERSION.to_string())
                    .await
                    .map_err(StoreError::from)?;
                Ok(())
            }
        }
    }

    /// Move the unreadable file aside so a fresh database can be created
    fn recreate_file(&self) -> Result<(), StoreError> {
        if self.config.in_memory {
            return Ok(());
        }
        let path = &self.config.cache_file_path;
        let backup = format!("{}.corrupt", path);
        // Best-effort: WAL side files are recreated by SQLite as needed
        let _ = std::fs::remove_file(format!("{}-wal", path));
        let _ = std::fs::remove_file(format!("{}-shm", path));
        let _ = std::fs::remove_file(&backup);
        match std::fs::rename(path, &backup) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::StorageUnavailable(format!(
                "failed to move corrupt database aside: {}",
                e
            ))),
        }
    }

    /// Epoch accounting and lease recovery performed once per open
    async fn finish_open(&self, pool: &SqlitePool) -> Result<(), StoreError> {
        let open_epoch = Self::read_setting(pool, SETTING_OPEN_EPOCH)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let close_epoch = Self::read_setting(pool, SETTING_CLOSE_EPOCH)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let unclean_shutdown = open_epoch != close_epoch;
        if unclean_shutdown {
            tracing::warn!(
                open_epoch = open_epoch,
                close_epoch = close_epoch,
                "Previous session did not shut down cleanly"
            );
        }

        // A crashed uploader has lost its in-flight state, so stale leases
        // only delay redelivery; holders that may still be alive are honored
        // only when configured and the last shutdown was clean.
        if unclean_shutdown || self.config.clear_reservations_on_open {
            let cleared = sqlx::query("UPDATE events SET reserved_until = 0 WHERE reserved_until > 0")
                .execute(pool)
                .await?
                .rows_affected();
            if cleared > 0 {
                tracing::info!(cleared = cleared, "Cleared persisted leases on open");
            }
        }

        let epoch = open_epoch + 1;
        Self::write_setting(pool, SETTING_OPEN_EPOCH, &epoch.to_string()).await?;
        self.epoch.store(epoch, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_size_estimate(&self, pool: &SqlitePool) -> Result<u64, StoreError> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(pool)
            .await?;
        let size = (page_count * page_size).max(0) as u64;
        self.size_estimate.store(size, Ordering::SeqCst);
        crate::metrics::update_store_size(size);
        Ok(size)
    }

    async fn reclaim_space(&self, pool: &SqlitePool) {
        let _ = sqlx::query("PRAGMA incremental_vacuum").execute(pool).await;
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_optional(pool)
            .await;
    }

    fn utilization_pct(&self) -> u8 {
        let size = self.size_estimate.load(Ordering::SeqCst);
        (size.saturating_mul(100) / self.config.cache_file_size).min(u64::from(u8::MAX)) as u8
    }

    /// Emit at most one storage-full notification per configured window
    fn notify_storage_full(&self) {
        let now = current_millis();
        let last = self.last_full_notification_ms.load(Ordering::SeqCst);
        if last != 0 && now - last < self.config.storage_full_notification_interval_ms as i64 {
            return;
        }
        if self
            .last_full_notification_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let pct = self.utilization_pct();
        tracing::warn!(utilization_pct = pct, "Offline storage near or over capacity");
        if let Some(observer) = self.observer() {
            observer.on_storage_full(pct);
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

    /// Evaluate size thresholds, trimming when the hard limit is reached
    ///
    /// Runs at most once per `db_full_check_interval_ms` unless forced by an
    /// insert that pushed the estimate past the soft threshold.
    async fn full_check(&self, force: bool) -> Result<(), StoreError> {
        let now = current_millis();
        let last = self.last_full_check_ms.load(Ordering::SeqCst);
        if !force && last != 0 && now - last < self.config.db_full_check_interval_ms as i64 {
            return Ok(());
        }
        self.last_full_check_ms.store(now, Ordering::SeqCst);

        let pool = self.pool().await?;
        let size = self.refresh_size_estimate(&pool).await?;

        if size >= self.config.cache_file_size {
            self.trim(&pool).await?;
        } else if size >= self.config.soft_limit_bytes() {
            // Advisory only: over the soft threshold, under the hard limit
            self.notify_storage_full();
        }
        Ok(())
    }

    /// One trim pass followed by global eviction if the store is still over limit
    async fn trim(&self, pool: &SqlitePool) -> Result<bool, StoreError> {
        self.notify_storage_full();

        let tenants: Vec<(String, i64)> =
            sqlx::query_as("SELECT tenant_token, COUNT(*) FROM events GROUP BY tenant_token")
                .fetch_all(pool)
                .await?;
        let total: i64 = tenants.iter().map(|(_, n)| n).sum();
        if total == 0 {
            return Ok(self.refresh_size_estimate(pool).await? <= self.config.cache_file_size);
        }

        let fair_share = (total / tenants.len() as i64).max(1);
        let mut dropped = TenantCounts::new();

        let mut tx = self.begin_with_retry(pool).await?;
        for (tenant, count) in tenants.iter().filter(|(_, n)| *n > fair_share) {
            let victims = (count * i64::from(self.config.trim_percentage) / 100).max(1);
            let deleted = sqlx::query(
                "DELETE FROM events WHERE record_id IN (
                     SELECT record_id FROM events WHERE tenant_token = ?
                     ORDER BY latency ASC, persistence ASC, timestamp ASC, record_id ASC
                     LIMIT ?
                 )",
            )
            .bind(tenant)
            .bind(victims)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if deleted > 0 {
                dropped.insert(tenant.clone(), deleted);
            }
        }
        tx.commit().await?;

        if !dropped.is_empty() {
            let count: u64 = dropped.values().sum();
            tracing::info!(count = count, "Trimmed records from tenants over fair share");
            self.notify_dropped(DroppedReason::Trim, &dropped);
        }

        self.reclaim_space(pool).await;
        let mut size = self.refresh_size_estimate(pool).await?;

        // Still over the hard limit: evict globally in reverse selection
        // order until under, reported in aggregate.
        let mut evicted = TenantCounts::new();
        while size > self.config.cache_file_size {
            let victims: Vec<(String, String)> = sqlx::query_as(
                "SELECT record_id, tenant_token FROM events
                 ORDER BY latency ASC, persistence ASC, timestamp ASC, record_id ASC
                 LIMIT ?",
            )
            .bind(EVICTION_BATCH)
            .fetch_all(pool)
            .await?;
            if victims.is_empty() {
                break;
            }

            let ids: Vec<&str> = victims.iter().map(|(id, _)| id.as_str()).collect();
            let sql = format!(
                "DELETE FROM events WHERE record_id IN ({})",
                placeholders(ids.len())
            );
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(*id);
            }
            query.execute(pool).await?;

            for (_, tenant) in victims {
                *evicted.entry(tenant).or_insert(0) += 1;
            }
            self.reclaim_space(pool).await;
            size = self.refresh_size_estimate(pool).await?;
        }

        if !evicted.is_empty() {
            let count: u64 = evicted.values().sum();
            tracing::warn!(count = count, "Evicted records under storage pressure");
            self.notify_dropped(DroppedReason::PressureEviction, &evicted);
        }

        Ok(size <= self.config.cache_file_size)
    }

    fn row_to_record(row: &SqliteRow) -> Result<StorageRecord, StoreError> {
        let reserved: i64 = row.get("reserved_until");
        let headers: Option<String> = row.get("http_headers");
        let headers = match headers {
            Some(json) => Some(serde_json::from_str::<HttpHeaders>(&json)?),
            None => None,
        };
        Ok(StorageRecord {
            id: row.get("record_id"),
            tenant_token: row.get("tenant_token"),
            latency: EventLatency::from_i64(row.get("latency")),
            persistence: crate::record::EventPersistence::from_i64(row.get("persistence")),
            timestamp: row.get("timestamp"),
            retry_count: row.get::<i64, _>("retry_count").max(0) as u32,
            reserved_until: if reserved > 0 { Some(reserved) } else { None },
            http_headers: headers,
            payload: row.get("payload"),
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl OfflineStore for SqliteEventStore {
    async fn initialize(&self, observer: Arc<dyn StorageObserver>) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.observer.write() {
            *guard = Some(observer);
        }

        let pool = match self.open_and_verify().await {
            Ok(pool) => pool,
            Err(StoreError::StorageCorrupt(reason)) => {
                if self.recreate_attempted.swap(true, Ordering::SeqCst) {
                    if let Some(observer) = self.observer() {
                        observer.on_storage_failed("storage_corrupt", &reason);
                    }
                    return Err(StoreError::StorageCorrupt(reason));
                }
                tracing::warn!(reason = %reason, "Recreating offline storage");
                self.recreate_file()?;
                match self.open_and_verify().await {
                    Ok(pool) => pool,
                    Err(second) => {
                        if let Some(observer) = self.observer() {
                            observer.on_storage_failed(second.kind(), &second.to_string());
                        }
                        return Err(second);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        self.finish_open(&pool).await?;
        self.refresh_size_estimate(&pool).await?;
        *self.pool.write().await = Some(pool);

        let kind = self.kind();
        let path: &str = if self.config.in_memory {
            ":memory:"
        } else {
            &self.config.cache_file_path
        };
        tracing::info!(path = path, kind = kind.as_str(), "Offline storage opened");
        if let Some(observer) = self.observer() {
            observer.on_storage_opened(kind);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            // Leases revert to available so a later session can reselect
            let _ = sqlx::query("UPDATE events SET reserved_until = 0 WHERE reserved_until > 0")
                .execute(&pool)
                .await;
            let epoch = self.epoch.load(Ordering::SeqCst);
            let _ = Self::write_setting(&pool, SETTING_CLOSE_EPOCH, &epoch.to_string()).await;
            let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_optional(&pool)
                .await;
            pool.close().await;
            tracing::info!("Offline storage closed");
        }
    }

    async fn store(&self, record: StorageRecord) -> Result<bool, StoreError> {
        if record.payload.len() as u64 >= self.config.cache_file_size {
            return Err(StoreError::QuotaRejected);
        }

        let pool = self.pool().await?;
        let headers_json = match &record.http_headers {
            Some(headers) => Some(serde_json::to_string(headers)?),
            None => None,
        };

        let insert = sqlx::query(
            "INSERT INTO events (record_id, tenant_token, latency, persistence, timestamp, \
             retry_count, reserved_until, http_headers, payload) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.tenant_token)
        .bind(record.latency.as_i64())
        .bind(record.persistence.as_i64())
        .bind(record.timestamp)
        .bind(i64::from(record.retry_count))
        .bind(&headers_json)
        .bind(&record.payload)
        .execute(&pool)
        .await;

        if let Err(e) = insert {
            if let sqlx::Error::Database(db) = &e {
                if db.message().contains("UNIQUE constraint") {
                    return Err(StoreError::InvalidArgument(format!(
                        "duplicate record id {}",
                        record.id
                    )));
                }
            }
            return Err(e.into());
        }

        let estimate = self
            .size_estimate
            .fetch_add(record.payload.len() as u64 + RECORD_OVERHEAD_BYTES, Ordering::SeqCst)
            + record.payload.len() as u64
            + RECORD_OVERHEAD_BYTES;

        if estimate >= self.config.soft_limit_bytes() {
            self.full_check(true).await?;
            if self.size_estimate.load(Ordering::SeqCst) > self.config.cache_file_size {
                // Trimming could not make room; take the new record back out
                sqlx::query("DELETE FROM events WHERE record_id = ?")
                    .bind(&record.id)
                    .execute(&pool)
                    .await?;
                tracing::warn!(record_id = %record.id, "Record rejected by quota policy");
                return Ok(false);
            }
        }

        crate::metrics::record_stored(&record.tenant_token);
        Ok(true)
    }

    async fn acquire(
        &self,
        lease_ms: u64,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError> {
        if max_count == 0 {
            self.last_read_count.store(0, Ordering::SeqCst);
            return Ok(Vec::new());
        }

        let pool = self.pool().await?;
        let now = current_millis();
        let mut tx = self.begin_with_retry(&pool).await?;

        let sql = format!(
            "SELECT {} FROM events WHERE latency >= ? AND reserved_until <= ? \
             ORDER BY latency DESC, persistence DESC, timestamp ASC, record_id ASC LIMIT ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(min_latency.as_i64())
            .bind(now)
            .bind(max_count as i64)
            .fetch_all(&mut *tx)
            .await?;

        if rows.is_empty() {
            tx.commit().await?;
            self.last_read_count.store(0, Ordering::SeqCst);
            return Ok(Vec::new());
        }

        let deadline = now + lease_ms as i64;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Self::row_to_record(row)?;
            record.reserved_until = Some(deadline);
            records.push(record);
        }

        let update_sql = format!(
            "UPDATE events SET reserved_until = ? WHERE record_id IN ({})",
            placeholders(records.len())
        );
        let mut update = sqlx::query(&update_sql).bind(deadline);
        for record in &records {
            update = update.bind(&record.id);
        }
        update.execute(&mut *tx).await?;
        tx.commit().await?;

        self.last_read_count.store(records.len(), Ordering::SeqCst);
        crate::metrics::record_acquire_batch(records.len());
        tracing::debug!(
            count = records.len(),
            lease_ms = lease_ms,
            "Reserved records for upload"
        );
        Ok(records)
    }

    async fn complete(&self, ids: &[RecordId], headers: &HttpHeaders) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        if !headers.is_empty() {
            tracing::debug!(count = ids.len(), headers = ?headers, "Completing uploaded records");
        }

        let pool = self.pool().await?;
        let sql = format!(
            "DELETE FROM events WHERE record_id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let deleted = query.execute(&pool).await?.rows_affected();
        crate::metrics::record_completed(deleted);
        Ok(())
    }

    async fn release(
        &self,
        ids: &[RecordId],
        increment_retry: bool,
        headers: &HttpHeaders,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let pool = self.pool().await?;
        let headers_json = if headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(headers)?)
        };

        let mut tx = self.begin_with_retry(&pool).await?;
        let mut exhausted = TenantCounts::new();

        if increment_retry {
            // Records whose incremented count reaches the budget are deleted
            // instead of released.
            let sql = format!(
                "SELECT record_id, tenant_token FROM events \
                 WHERE record_id IN ({}) AND retry_count + 1 >= ?",
                placeholders(ids.len())
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql);
            for id in ids {
                query = query.bind(id);
            }
            let doomed = query
                .bind(i64::from(self.config.max_retry_count))
                .fetch_all(&mut *tx)
                .await?;

            if !doomed.is_empty() {
                let delete_sql = format!(
                    "DELETE FROM events WHERE record_id IN ({})",
                    placeholders(doomed.len())
                );
                let mut delete = sqlx::query(&delete_sql);
                for (id, _) in &doomed {
                    delete = delete.bind(id);
                }
                delete.execute(&mut *tx).await?;
                for (_, tenant) in doomed {
                    *exhausted.entry(tenant).or_insert(0) += 1;
                }
            }

            let update_sql = format!(
                "UPDATE events SET reserved_until = 0, retry_count = retry_count + 1, \
                 http_headers = COALESCE(?, http_headers) WHERE record_id IN ({})",
                placeholders(ids.len())
            );
            let mut update = sqlx::query(&update_sql).bind(&headers_json);
            for id in ids {
                update = update.bind(id);
            }
            update.execute(&mut *tx).await?;
        } else {
            let update_sql = format!(
                "UPDATE events SET reserved_until = 0, \
                 http_headers = COALESCE(?, http_headers) WHERE record_id IN ({})",
                placeholders(ids.len())
            );
            let mut update = sqlx::query(&update_sql).bind(&headers_json);
            for id in ids {
                update = update.bind(id);
            }
            update.execute(&mut *tx).await?;
        }

        tx.commit().await?;

        if !exhausted.is_empty() {
            let count: u64 = exhausted.values().sum();
            tracing::warn!(count = count, "Dropped records with exhausted retry budget");
            self.notify_dropped(DroppedReason::RetriesExhausted, &exhausted);
        }
        Ok(())
    }

    async fn delete_matching(&self, filter: &MetadataFilter) -> Result<u64, StoreError> {
        let pool = self.pool().await?;

        let mut conditions = Vec::new();
        let mut binds: Vec<i64> = Vec::new();
        let mut tenant: Option<&str> = None;
        for (key, value) in filter {
            match key.as_str() {
                "tenant_token" => {
                    conditions.push("tenant_token = ?".to_string());
                    tenant = Some(value);
                }
                "latency" => {
                    let latency = EventLatency::from_name(value).ok_or_else(|| {
                        StoreError::InvalidArgument(format!("unknown latency '{}'", value))
                    })?;
                    conditions.push("latency = ?".to_string());
                    binds.push(latency.as_i64());
                }
                "persistence" => {
                    let persistence =
                        crate::record::EventPersistence::from_name(value).ok_or_else(|| {
                            StoreError::InvalidArgument(format!("unknown persistence '{}'", value))
                        })?;
                    conditions.push("persistence = ?".to_string());
                    binds.push(persistence.as_i64());
                }
                other => {
                    return Err(StoreError::InvalidArgument(format!(
                        "unknown filter key '{}'",
                        other
                    )))
                }
            }
        }
        if conditions.is_empty() {
            return Err(StoreError::InvalidArgument(
                "delete_matching requires at least one condition".to_string(),
            ));
        }

        let sql = format!("DELETE FROM events WHERE {}", conditions.join(" AND "));
        let mut query = sqlx::query(&sql);
        // Bind in the same order conditions were pushed
        let mut bind_iter = binds.into_iter();
        for condition in &conditions {
            if condition.starts_with("tenant_token") {
                query = query.bind(tenant.unwrap_or_default());
            } else {
                query = query.bind(bind_iter.next().unwrap_or_default());
            }
        }
        let deleted = query.execute(&pool).await?.rows_affected();
        tracing::info!(deleted = deleted, "Deleted records matching filter");
        Ok(deleted)
    }

    async fn get_records(
        &self,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<Vec<StorageRecord>, StoreError> {
        let pool = self.pool().await?;
        let limit = if max_count == 0 { -1 } else { max_count as i64 };
        let sql = format!(
            "SELECT {} FROM events WHERE latency >= ? \
             ORDER BY latency DESC, persistence DESC, timestamp ASC, record_id ASC LIMIT ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(min_latency.as_i64())
            .bind(limit)
            .fetch_all(&pool)
            .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn get_record_count(&self, latency: Option<EventLatency>) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let count: i64 = match latency {
            Some(latency) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE latency = ?")
                    .bind(latency.as_i64())
                    .fetch_one(&pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM events")
                    .fetch_one(&pool)
                    .await?
            }
        };
        Ok(count.max(0) as u64)
    }

    async fn get_size(&self) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        self.refresh_size_estimate(&pool).await
    }

    async fn resize(&self) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let size = self.refresh_size_estimate(&pool).await?;
        if size <= self.config.cache_file_size {
            return Ok(true);
        }
        self.trim(&pool).await
    }

    async fn quota_check(&self) -> Result<(), StoreError> {
        self.full_check(false).await
    }

    async fn store_setting(&self, name: &str, value: &str) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "setting name must not be empty".to_string(),
            ));
        }
        let pool = self.pool().await?;
        Self::write_setting(&pool, name, value).await?;
        Ok(())
    }

    async fn get_setting(&self, name: &str) -> Result<Option<String>, StoreError> {
        let pool = self.pool().await?;
        Ok(Self::read_setting(&pool, name).await?)
    }

    async fn delete_setting(&self, name: &str) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM settings WHERE name = ?")
            .bind(name)
            .execute(&pool)
            .await?;
        Ok(())
    }

    fn kind(&self) -> StorageKind {
        if self.config.in_memory {
            StorageKind::InMemory
        } else {
            StorageKind::File
        }
    }

    fn last_read_from_memory(&self) -> bool {
        false
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EventPersistence;
    use crate::store::NoopObserver;
    use std::sync::Mutex;

    async fn create_test_store(config: StoreConfig) -> SqliteEventStore {
        let store = SqliteEventStore::new(StoreConfig {
            in_memory: true,
            ..config
        });
        store.initialize(Arc::new(NoopObserver)).await.unwrap();
        store
    }

    fn record(id: &str, tenant: &str, latency: EventLatency) -> StorageRecord {
        StorageRecord::new(tenant, latency, EventPersistence::Normal, vec![0u8; 64]).with_id(id)
    }

    #[derive(Default)]
    struct RecordingObserver {
        dropped: Mutex<Vec<(DroppedReason, u64)>>,
        full: Mutex<u32>,
    }

    impl StorageObserver for RecordingObserver {
        fn on_storage_full(&self, _utilization_pct: u8) {
            *self.full.lock().unwrap() += 1;
        }

        fn on_records_dropped(&self, reason: DroppedReason, count: u64, _by_tenant: &TenantCounts) {
            self.dropped.lock().unwrap().push((reason, count));
        }
    }

    #[tokio::test]
    async fn test_store_and_count() {
        let store = create_test_store(StoreConfig::default()).await;

        assert!(store.store(record("a", "t1", EventLatency::Normal)).await.unwrap());
        assert!(store.store(record("b", "t1", EventLatency::RealTime)).await.unwrap());

        assert_eq!(store.get_record_count(None).await.unwrap(), 2);
        assert_eq!(
            store
                .get_record_count(Some(EventLatency::RealTime))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_is_invalid_argument() {
        let store = create_test_store(StoreConfig::default()).await;
        assert!(store.store(record("a", "t1", EventLatency::Normal)).await.unwrap());

        let result = store.store(record("a", "t1", EventLatency::Normal)).await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_acquire_orders_and_reserves() {
        let store = create_test_store(StoreConfig::default()).await;
        store
            .store(record("a", "t1", EventLatency::Normal).with_timestamp(1))
            .await
            .unwrap();
        store
            .store(record("b", "t1", EventLatency::RealTime).with_timestamp(2))
            .await
            .unwrap();
        store
            .store(record("c", "t1", EventLatency::Normal).with_timestamp(3))
            .await
            .unwrap();

        let batch = store
            .acquire(60_000, EventLatency::Normal, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(store.last_read_record_count(), 3);

        // Everything is reserved now
        let again = store
            .acquire(60_000, EventLatency::Normal, 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_zero_max_count_reserves_nothing() {
        let store = create_test_store(StoreConfig::default()).await;
        store.store(record("a", "t1", EventLatency::Normal)).await.unwrap();

        let batch = store.acquire(60_000, EventLatency::Off, 0).await.unwrap();
        assert!(batch.is_empty());

        let batch = store.acquire(60_000, EventLatency::Off, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reselectable() {
        let store = create_test_store(StoreConfig::default()).await;
        store.store(record("d", "t1", EventLatency::Normal)).await.unwrap();

        let first = store.acquire(1, EventLatency::Normal, 10).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = store.acquire(60_000, EventLatency::Normal, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "d");
    }

    #[tokio::test]
    async fn test_complete_deletes_and_tolerates_unknown_ids() {
        let store = create_test_store(StoreConfig::default()).await;
        store.store(record("a", "t1", EventLatency::Normal)).await.unwrap();

        store
            .complete(&["a".to_string(), "ghost".to_string()], &Vec::new())
            .await
            .unwrap();
        assert_eq!(store.get_record_count(None).await.unwrap(), 0);

        // Duplicate completion is silently a success
        store.complete(&["a".to_string()], &Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_restores_availability_and_counts_retries() {
        let store = create_test_store(StoreConfig::default()).await;
        store.store(record("a", "t1", EventLatency::Normal)).await.unwrap();

        let batch = store.acquire(60_000, EventLatency::Normal, 1).await.unwrap();
        assert_eq!(batch.len(), 1);

        let headers = vec![("Retry-After".to_string(), "30".to_string())];
        store.release(&["a".to_string()], true, &headers).await.unwrap();

        let batch = store.acquire(60_000, EventLatency::Normal, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].retry_count, 1);
        assert_eq!(
            batch[0].http_headers.as_deref(),
            Some(&headers[..])
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_deletes_and_notifies_once() {
        let observer = Arc::new(RecordingObserver::default());
        let store = SqliteEventStore::new(StoreConfig {
            in_memory: true,
            max_retry_count: 2,
            ..StoreConfig::default()
        });
        store.initialize(observer.clone()).await.unwrap();
        store.store(record("e", "t1", EventLatency::Normal)).await.unwrap();

        for _ in 0..3 {
            let _ = store.acquire(60_000, EventLatency::Normal, 1).await.unwrap();
            store.release(&["e".to_string()], true, &Vec::new()).await.unwrap();
        }

        assert_eq!(store.get_record_count(None).await.unwrap(), 0);
        let dropped = observer.dropped.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0], (DroppedReason::RetriesExhausted, 1));
    }

    #[tokio::test]
    async fn test_release_of_unknown_id_is_noop() {
        let store = create_test_store(StoreConfig::default()).await;
        store
            .release(&["ghost".to_string()], true, &Vec::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_record_is_quota_rejected() {
        let store = create_test_store(StoreConfig {
            cache_file_size: 1024,
            ..StoreConfig::default()
        })
        .await;

        let big = StorageRecord::new(
            "t1",
            EventLatency::Normal,
            EventPersistence::Normal,
            vec![0u8; 4096],
        );
        let result = store.store(big).await;
        assert!(matches!(result, Err(StoreError::QuotaRejected)));
        assert_eq!(store.get_record_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_matching_by_tenant() {
        let store = create_test_store(StoreConfig::default()).await;
        store.store(record("a", "t1", EventLatency::Normal)).await.unwrap();
        store.store(record("b", "t2", EventLatency::Normal)).await.unwrap();

        let mut filter = MetadataFilter::new();
        filter.insert("tenant_token".to_string(), "t1".to_string());
        assert_eq!(store.delete_matching(&filter).await.unwrap(), 1);
        assert_eq!(store.get_record_count(None).await.unwrap(), 1);

        let mut bad = MetadataFilter::new();
        bad.insert("color".to_string(), "red".to_string());
        assert!(matches!(
            store.delete_matching(&bad).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_last_writer_wins() {
        let store = create_test_store(StoreConfig::default()).await;

        store.store_setting("flag", "1").await.unwrap();
        store.store_setting("flag", "2").await.unwrap();
        assert_eq!(store.get_setting("flag").await.unwrap().as_deref(), Some("2"));

        store.delete_setting("flag").await.unwrap();
        assert_eq!(store.get_setting("flag").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_records_does_not_reserve() {
        let store = create_test_store(StoreConfig::default()).await;
        store.store(record("a", "t1", EventLatency::Normal)).await.unwrap();

        let snapshot = store.get_records(EventLatency::Off, 0).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].reserved_until, None);

        let batch = store.acquire(60_000, EventLatency::Normal, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
