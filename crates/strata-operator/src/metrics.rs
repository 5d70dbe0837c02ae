//! Operator metrics.
//!
//! Recorded through the `metrics` facade; the binary installs the
//! Prometheus recorder. Without a recorder the calls are no-ops.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Duration of one entity operation
pub const OPERATION_DURATION: &str = "strata_operator_duration_seconds";

/// Failed entity operations
pub const OPERATION_FAILURES: &str = "strata_operator_failures_total";

/// Bytes uploaded to the staging storage
pub const UPLOADED_BYTES: &str = "strata_slice_uploaded_bytes_total";

/// Files deleted by the metadata cleanup
pub const CLEANUP_DELETED_FILES: &str = "strata_cleanup_deleted_files_total";

/// Errors of the metadata cleanup
pub const CLEANUP_ERRORS: &str = "strata_cleanup_errors_total";

/// Register metric descriptions, once after the recorder is installed
pub fn register_metrics() {
    describe_histogram!(OPERATION_DURATION, "Duration of operator entity operations in seconds");
    describe_counter!(OPERATION_FAILURES, "Total failed operator entity operations");
    describe_counter!(UPLOADED_BYTES, "Total bytes of uploaded slices");
    describe_counter!(CLEANUP_DELETED_FILES, "Total files deleted by the metadata cleanup");
    describe_counter!(CLEANUP_ERRORS, "Total metadata cleanup errors");
}

pub fn record_operation(operation: &'static str, duration: Duration, success: bool) {
    let result = if success { "success" } else { "error" };
    histogram!(OPERATION_DURATION, "operation" => operation, "result" => result).record(duration.as_secs_f64());
    if !success {
        counter!(OPERATION_FAILURES, "operation" => operation).increment(1);
    }
}

pub fn record_upload(compressed: u64, uncompressed: u64) {
    counter!(UPLOADED_BYTES, "kind" => "compressed").increment(compressed);
    counter!(UPLOADED_BYTES, "kind" => "uncompressed").increment(uncompressed);
}

pub fn record_cleanup(deleted: u64, errors: u64) {
    counter!(CLEANUP_DELETED_FILES).increment(deleted);
    counter!(CLEANUP_ERRORS).increment(errors);
}
