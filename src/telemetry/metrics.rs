//! Metric instrument factories for dispatchd.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"dispatchd"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for dispatchd instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dispatchd")
}

/// Counter: inbound events by ingest result.
/// Labels: `result` ("accepted" | "duplicate" | "malformed" | "denied" | "unroutable").
pub fn events_ingested() -> Counter<u64> {
    meter()
        .u64_counter("dispatchd.events.ingested")
        .with_description("Number of inbound events by ingest result")
        .build()
}

/// Counter: gate decisions.
/// Labels: `decision`, `reason` (denials only).
pub fn gate_decisions() -> Counter<u64> {
    meter()
        .u64_counter("dispatchd.gate.decisions")
        .with_description("Number of cross-account authorization decisions")
        .build()
}

/// Counter: dispatch record state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dispatchd.dispatch.state_transitions")
        .with_description("Number of dispatch record state transitions")
        .build()
}

/// Counter: launch attempts.
/// Labels: `template`, `result` ("started" | "rejected" | "capacity_exceeded").
pub fn launches() -> Counter<u64> {
    meter()
        .u64_counter("dispatchd.launcher.launches")
        .with_description("Number of task launch attempts")
        .build()
}

/// Counter: preemptions reconciled by the reclaimer.
/// Labels: `outcome` ("requeued" | "exhausted").
pub fn preemptions() -> Counter<u64> {
    meter()
        .u64_counter("dispatchd.reclaim.preemptions")
        .with_description("Number of preempted tasks reconciled")
        .build()
}

/// Gauge: current concurrency ceiling.
pub fn concurrency_ceiling() -> Gauge<u64> {
    meter()
        .u64_gauge("dispatchd.autoscale.ceiling")
        .with_description("Current concurrency ceiling")
        .build()
}

/// Gauge: tasks holding an in-flight slot.
pub fn in_flight() -> Gauge<u64> {
    meter()
        .u64_gauge("dispatchd.launcher.in_flight")
        .with_description("Tasks in Launching or Running")
        .build()
}

/// Histogram: time spent waiting for a launch slot, in milliseconds.
pub fn slot_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatchd.launcher.slot_wait_ms")
        .with_description("Time spent waiting for a launch slot")
        .with_unit("ms")
        .build()
}
