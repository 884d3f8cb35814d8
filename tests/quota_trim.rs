/// Integration tests for quota-driven trimming under storage pressure
use std::sync::{Arc, Mutex};
use telemetry_store::store::{DroppedReason, TenantCounts};
use telemetry_store::{
    EventLatency, EventPersistence, OfflineStore, SqliteEventStore, StorageObserver, StorageRecord,
    StoreConfig,
};
use tempfile::TempDir;

#[derive(Default)]
struct QuotaObserver {
    full_notifications: Mutex<Vec<u8>>,
    dropped: Mutex<Vec<(DroppedReason, u64, TenantCounts)>>,
}

impl StorageObserver for QuotaObserver {
    fn on_storage_full(&self, utilization_pct: u8) {
        self.full_notifications.lock().unwrap().push(utilization_pct);
    }

    fn on_records_dropped(&self, reason: DroppedReason, count: u64, by_tenant: &TenantCounts) {
        self.dropped
            .lock()
            .unwrap()
            .push((reason, count, by_tenant.clone()));
    }
}

fn record(id: &str, tenant: &str, latency: EventLatency, timestamp: i64) -> StorageRecord {
    StorageRecord::new(tenant, latency, EventPersistence::Normal, vec![0u8; 2048])
        .with_id(id)
        .with_timestamp(timestamp)
}

/// Fill a generously-sized store with interleaved tenants, then reopen it
/// with a hard limit the contents exceed and run the quota check.
#[tokio::test]
async fn test_trim_under_pressure_prefers_overshare_tenant() {
    let dir = TempDir::new().unwrap();
    let path = dir
        .path()
        .join("telemetry.db")
        .to_string_lossy()
        .into_owned();

    let fill_config = StoreConfig {
        cache_file_path: path.clone(),
        ..StoreConfig::default()
    };
    let store = SqliteEventStore::new(fill_config);
    store.initialize(Arc::new(QuotaObserver::default())).await.unwrap();

    // Tenant t1 contributes 80% of the records, t2 the rest. t2 records are
    // RealTime so reverse-selection-order eviction reaches them last.
    let mut t2_emitted = 0;
    for i in 0..100i64 {
        let (tenant, latency) = if i % 5 == 4 {
            t2_emitted += 1;
            ("t2", EventLatency::RealTime)
        } else {
            ("t1", EventLatency::Normal)
        };
        store
            .store(record(&format!("r{}", i), tenant, latency, i))
            .await
            .unwrap();
    }
    assert_eq!(t2_emitted, 20);
    let filled_size = store.get_size().await.unwrap();
    store.shutdown().await;

    // Reopen with a hard limit the current contents overshoot by ~20%
    let observer = Arc::new(QuotaObserver::default());
    let squeeze_config = StoreConfig {
        cache_file_path: path,
        cache_file_size: filled_size * 10 / 12,
        ..StoreConfig::default()
    };
    let store = SqliteEventStore::new(squeeze_config);
    store.initialize(observer.clone()).await.unwrap();

    let t1_before = store
        .get_record_count(Some(EventLatency::Normal))
        .await
        .unwrap();
    assert_eq!(t1_before, 80);

    let within = store.resize().await.unwrap();
    assert!(within, "store should fit its limit after trimming");

    let t1_after = store
        .get_record_count(Some(EventLatency::Normal))
        .await
        .unwrap();
    let t2_after = store
        .get_record_count(Some(EventLatency::RealTime))
        .await
        .unwrap();

    // t1 was over its fair share and loses at least the trim percentage
    assert!(
        t1_after <= t1_before - 20,
        "t1 kept {} of {} records",
        t1_after,
        t1_before
    );
    assert_eq!(t2_after, 20, "t2 was within its fair share");

    // Trim activity is attributed to t1 only
    let dropped = observer.dropped.lock().unwrap();
    assert!(!dropped.is_empty());
    for (_, _, by_tenant) in dropped.iter() {
        assert!(!by_tenant.contains_key("t2"));
    }
    drop(dropped);

    // A second pass inside the notification window stays silent
    let _ = store.resize().await.unwrap();
    assert_eq!(observer.full_notifications.lock().unwrap().len(), 1);

    store.shutdown().await;
}

#[tokio::test]
async fn test_soft_threshold_is_advisory_only() {
    let dir = TempDir::new().unwrap();
    let path = dir
        .path()
        .join("telemetry.db")
        .to_string_lossy()
        .into_owned();

    let fill_config = StoreConfig {
        cache_file_path: path.clone(),
        ..StoreConfig::default()
    };
    let store = SqliteEventStore::new(fill_config);
    store.initialize(Arc::new(QuotaObserver::default())).await.unwrap();
    for i in 0..40i64 {
        store
            .store(record(&format!("r{}", i), "t1", EventLatency::Normal, i))
            .await
            .unwrap();
    }
    let filled_size = store.get_size().await.unwrap();
    store.shutdown().await;

    // Between the soft threshold (50%) and the hard limit
    let observer = Arc::new(QuotaObserver::default());
    let config = StoreConfig {
        cache_file_path: path,
        cache_file_size: filled_size * 2,
        cache_file_full_notification_percentage: 40,
        ..StoreConfig::default()
    };
    let store = SqliteEventStore::new(config);
    store.initialize(observer.clone()).await.unwrap();

    store.quota_check().await.unwrap();

    assert_eq!(observer.full_notifications.lock().unwrap().len(), 1);
    assert!(observer.dropped.lock().unwrap().is_empty());
    assert_eq!(store.get_record_count(None).await.unwrap(), 40);

    store.shutdown().await;
}

#[tokio::test]
async fn test_oversized_record_rejected_without_truncation() {
    let store = SqliteEventStore::new(StoreConfig {
        in_memory: true,
        cache_file_size: 4096,
        ..StoreConfig::default()
    });
    store
        .initialize(Arc::new(QuotaObserver::default()))
        .await
        .unwrap();

    let oversized = StorageRecord::new(
        "t1",
        EventLatency::Normal,
        EventPersistence::Critical,
        vec![0u8; 8192],
    );
    let result = store.store(oversized).await;
    assert!(matches!(
        result,
        Err(telemetry_store::StoreError::QuotaRejected)
    ));
    assert_eq!(store.get_record_count(None).await.unwrap(), 0);
}
