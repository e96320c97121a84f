//! Observability and fault-escalation collaborators.
//!
//! The dispatch layer feeds latency and queue-depth samples into opaque
//! accumulator sinks and reports request completion to an admission-control
//! monitor. None of these own any policy here; real deployments plug in
//! their statistics tables and load monitor through the builder.

use tracing::error;

/// Sink for a statistics histogram. Implementations aggregate however they
/// like; the core only ever calls `accumulate`.
pub trait EventAccumulator: Send + Sync {
    fn accumulate(&self, value: u64);
}

/// Admission-control collaborator fed with per-request latency.
pub trait LoadMonitor: Send + Sync {
    fn request_complete(&self, latency_us: u64);
}

/// Last-resort escalation for faults the node cannot recover from locally:
/// a deadlocked queue, or a trapped fault in a single-worker pool. The
/// production implementation terminates the process so the supervisor can
/// restart a clean instance.
pub trait ExceptionHandler: Send + Sync {
    fn abort_process(&self, reason: &str);
}

/// Accumulator that discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccumulator;

impl EventAccumulator for NullAccumulator {
    fn accumulate(&self, _value: u64) {}
}

/// Load monitor that ignores completions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLoadMonitor;

impl LoadMonitor for NullLoadMonitor {
    fn request_complete(&self, _latency_us: u64) {}
}

/// Production exception handler: log and abort so the orchestrator restarts
/// the node.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFault;

impl ExceptionHandler for AbortOnFault {
    fn abort_process(&self, reason: &str) {
        error!(reason, "unrecoverable fault, aborting process");
        std::process::abort();
    }
}
