//! Configuration of the optimized relaxation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for [`OptimizedRelaxationTransform`](crate::OptimizedRelaxationTransform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxationConfig {
    /// Tighten the bounds of every variable feeding a max activation by LP
    /// before relaxing it.
    pub tighten_activations: bool,

    /// Wall-clock budget of each tightening solve, in milliseconds.
    /// `None` or `Some(0)` means unbounded.
    pub tighten_time_limit_ms: Option<u64>,

    /// Run per-sample solver work on the rayon pool.
    pub parallel_samples: bool,

    /// Minimum batch size before enabling parallelism.
    /// Below this threshold, samples are processed serially.
    pub min_samples_for_parallel: usize,
}

impl Default for RelaxationConfig {
    fn default() -> Self {
        Self {
            tighten_activations: true,
            tighten_time_limit_ms: None,
            parallel_samples: true,
            min_samples_for_parallel: 2,
        }
    }
}

impl RelaxationConfig {
    /// Time limit handed to each tightening solve.
    pub fn tighten_time_limit(&self) -> Option<Duration> {
        self.tighten_time_limit_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    /// Whether a batch of `batch` samples is processed in parallel.
    pub fn parallel_for(&self, batch: usize) -> bool {
        self.parallel_samples && batch >= self.min_samples_for_parallel.max(2)
    }
}
