//! Offline event storage and reservation engine for a client-side telemetry SDK
//!
//! The crate buffers application-emitted events durably on the local device
//! and loans batches to an uploader under time-bounded leases:
//! - **Store**: SQLite-backed record table with tenant-aware quota trimming,
//!   plus an in-memory twin used for tests and as the corruption fallback
//! - **Leases**: crash-safe reservation accounting with a bounded retry budget
//! - **Admission**: diagnostic-level gate, per-tenant exclusion/sampling
//!   filters, and hierarchical context stamping
//!
//! Transport, wire encoding, and upload scheduling live outside this crate;
//! uploaders only see `acquire`/`complete`/`release`.

pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod store;

pub use config::{load_config, StoreConfig};
pub use context::{ContextFieldsProvider, TicketType};
pub use error::StoreError;
pub use filter::{DiagLevelFilter, EventFilterRegulator};
pub use pipeline::{spawn_quota_task, AdmissionOutcome, EngineRegistry, FilteredReason, TelemetryEngine};
pub use record::{
    Event, EventLatency, EventPersistence, EventProperty, HttpHeaders, PiiKind, PropertyValue,
    RecordId, StorageRecord,
};
pub use store::{
    DroppedReason, InMemoryEventStore, OfflineStore, SqliteEventStore, StorageKind,
    StorageObserver, TenantCounts,
};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once; host applications that
/// install their own subscriber should skip it.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
