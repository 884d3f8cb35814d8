use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initialize metric descriptions (can be called multiple times safely)
///
/// The host application owns recorder installation; this crate only emits
/// through the `metrics` facade.
pub fn init_metric_descriptions() {
    describe_counter!(
        "telemetry_records_stored_total",
        "Records admitted to offline storage"
    );
    describe_counter!(
        "telemetry_records_completed_total",
        "Records deleted after a successful upload"
    );
    describe_counter!(
        "telemetry_records_dropped_total",
        "Records removed without upload success"
    );
    describe_counter!(
        "telemetry_records_filtered_total",
        "Events rejected by the admission filters"
    );
    describe_gauge!(
        "telemetry_store_size_bytes",
        "Current backing store size estimate"
    );
    describe_histogram!(
        "telemetry_acquire_batch_size",
        "Records delivered per acquire call"
    );
}

/// Record an admitted record
pub fn record_stored(tenant: &str) {
    counter!(
        "telemetry_records_stored_total",
        "tenant" => tenant.to_string(),
    )
    .increment(1);
}

/// Record records deleted after upload acknowledgment
pub fn record_completed(count: u64) {
    counter!("telemetry_records_completed_total").increment(count);
}

/// Record records dropped without upload success
pub fn record_dropped(reason: &'static str, count: u64) {
    counter!(
        "telemetry_records_dropped_total",
        "reason" => reason,
    )
    .increment(count);
}

/// Record an event rejected by an admission filter
pub fn record_filtered(stage: &'static str) {
    counter!(
        "telemetry_records_filtered_total",
        "stage" => stage,
    )
    .increment(1);
}

/// Update the store size gauge
pub fn update_store_size(bytes: u64) {
    gauge!("telemetry_store_size_bytes").set(bytes as f64);
}

/// Record the batch size delivered by one acquire call
pub fn record_acquire_batch(count: usize) {
    histogram!("telemetry_acquire_batch_size").record(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        init_metric_descriptions();

        // Record some metrics; without an installed recorder these are no-ops
        record_stored("t1");
        record_completed(3);
        record_dropped("retries_exhausted", 1);
        record_filtered("diag_level");
        update_store_size(1024);
        record_acquire_batch(16);
    }
}
