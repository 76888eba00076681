//! Metrics collection using metrics-rs.

use ::metrics::{counter, describe_counter, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const CAPTURES_COMMITTED: &str = "capflow_captures_committed";
const CAPTURE_BYTES: &str = "capflow_capture_bytes";
const BUFFERS_RECYCLED: &str = "capflow_buffers_recycled";
const BUFFERS_RETIRED: &str = "capflow_buffers_retired";
const BATCHES_EMITTED: &str = "capflow_batches_emitted";
const BATCH_ITEMS: &str = "capflow_batch_items";
const TRANSFERS_ISSUED: &str = "capflow_transfers_issued";
const TRANSFER_BYTES: &str = "capflow_transfer_bytes";
const CREDIT_WAITS: &str = "capflow_credit_waits";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    describe_counter!(
        CAPTURES_COMMITTED,
        Unit::Count,
        "Total number of captures committed by producers"
    );
    describe_counter!(
        CAPTURE_BYTES,
        Unit::Bytes,
        "Total payload bytes committed by producers"
    );
    describe_counter!(
        BUFFERS_RECYCLED,
        Unit::Count,
        "Total number of buffers re-armed with a fresh host pairing"
    );
    describe_counter!(
        BUFFERS_RETIRED,
        Unit::Count,
        "Total number of buffers fully drained and handed back"
    );
    describe_counter!(
        BATCHES_EMITTED,
        Unit::Count,
        "Total number of contiguous item batches dispatched to workers"
    );
    describe_counter!(
        BATCH_ITEMS,
        Unit::Count,
        "Total items covered by dispatched batches"
    );
    describe_counter!(
        TRANSFERS_ISSUED,
        Unit::Count,
        "Total number of transfer requests issued to the transfer engine"
    );
    describe_counter!(
        TRANSFER_BYTES,
        Unit::Bytes,
        "Total payload bytes covered by issued transfers"
    );
    describe_counter!(
        CREDIT_WAITS,
        Unit::Count,
        "Number of poll iterations spent waiting for a transfer credit"
    );
}

/// Record a capture committed by a producer.
#[inline]
pub fn record_capture_committed(bytes: usize) {
    counter!(CAPTURES_COMMITTED).increment(1);
    counter!(CAPTURE_BYTES).increment(bytes as u64);
}

/// Record a buffer re-armed for reuse.
#[inline]
pub fn record_buffer_recycled() {
    counter!(BUFFERS_RECYCLED).increment(1);
}

/// Record a buffer fully drained and retired.
#[inline]
pub fn record_buffer_retired() {
    counter!(BUFFERS_RETIRED).increment(1);
}

/// Record a batch handed to the worker pool.
#[inline]
pub fn record_batch_emitted(items: u32) {
    counter!(BATCHES_EMITTED).increment(1);
    counter!(BATCH_ITEMS).increment(items as u64);
}

/// Record a transfer request issued to the engine.
#[inline]
pub fn record_transfer_issued(bytes: usize) {
    counter!(TRANSFERS_ISSUED).increment(1);
    counter!(TRANSFER_BYTES).increment(bytes as u64);
}

/// Record one poll iteration spent waiting on the credit gate.
#[inline]
pub fn record_credit_wait() {
    counter!(CREDIT_WAITS).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics();
        init_metrics();
        // Recording without an installed recorder is a no-op, not a panic.
        record_capture_committed(128);
        record_credit_wait();
    }
}
