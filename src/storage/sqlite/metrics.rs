//! Storage operation metrics.

use std::time::Instant;

/// Records a counter and a latency histogram for one storage operation.
///
/// `status` is `"success"` or `"error"`.
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "notegraph_storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "notegraph_storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_without_recorder_is_a_noop() {
        let start = Instant::now();
        record_operation_metrics("graph", "upsert", start, "success");
        record_operation_metrics("search", "search", start, "error");
    }
}
