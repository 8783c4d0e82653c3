//! Metric instrument factories for jobtree.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobtree"` meter.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobtree instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobtree")
}

/// Counter: job counter increments.
/// Labels: `backend` ("local" | "postgres").
pub fn jobs_registered() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.job.registered")
        .with_description("Work items registered against a job counter")
        .build()
}

/// Counter: job counter decrements.
/// Labels: `backend`.
pub fn jobs_completed() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.job.completed")
        .with_description("Work items completed against a job counter")
        .build()
}

/// Counter: job records removed after draining.
/// Labels: `path` ("dispatch" | "fault").
pub fn jobs_finalized() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.job.finalized")
        .with_description("Jobs finalized")
        .build()
}

/// Counter: delivered messages by outcome.
/// Labels: `outcome` ("completed" | "faulted" | "retry" | "poison").
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.work.dispatched")
        .with_description("Work items handled by a dispatcher")
        .build()
}

/// Counter: items compensated by the fault handler.
/// Labels: `backend`.
pub fn work_faulted() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.work.faulted")
        .with_description("Faulted work items compensated")
        .build()
}

/// Counter: child items registered and published.
pub fn children_published() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.work.children_published")
        .with_description("Child work items published")
        .build()
}

/// Counter: best-effort document/blob writes that failed.
/// Labels: `store` ("document" | "blob").
pub fn store_failures() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.store.failures")
        .with_description("Failed document or blob writes")
        .build()
}

/// Counter: queue-level operations (send, read, ack, nack).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobtree.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: time to dispatch one item, in milliseconds.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobtree.dispatch.duration_ms")
        .with_description("Dispatch duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub(crate) fn record_queue_op(queue: &str, operation: &'static str) {
    queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
