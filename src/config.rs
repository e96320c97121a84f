#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tuning for the message dispatch layer: the worker pool draining the
/// shared event queue and the queue's own watchdog.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of worker threads servicing the event queue. Must be at
    /// least one. With a single worker the pool cannot survive a trapped
    /// fault and escalates to a process abort instead.
    pub num_worker_threads: usize,
    /// How long the oldest queued message may wait, with no pop succeeding,
    /// before the queue is considered deadlocked.
    pub deadlock_threshold_ms: u64,
    /// Soft bound on queue depth. When the queue is at or above this depth,
    /// ingress answers new requests with a stateless 503 instead of
    /// enqueuing them. `None` disables the bound.
    pub queue_high_watermark: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            num_worker_threads: 1,
            deadlock_threshold_ms: 4000,
            queue_high_watermark: None,
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Binding lifetime applied when a REGISTER carries no expiry at all.
    pub default_expires: u32,
    /// Upper bound on any requested binding lifetime.
    pub max_expires: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            default_expires: 3600,
            max_expires: 86400,
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Home network domain. Initial filter criteria resolve a service named
    /// `svc` when a request is addressed to the host `svc.<home_domain>`.
    pub home_domain: String,
    pub dispatch: DispatchConfig,
    pub registrar: RegistrarConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            home_domain: String::new(),
            dispatch: DispatchConfig::default(),
            registrar: RegistrarConfig::default(),
        }
    }
}
