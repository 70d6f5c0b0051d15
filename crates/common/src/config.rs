use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Global engine configuration shared across planner/execution layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of step-vectors produced per operator pull.
    pub steps_per_batch: usize,
    /// Maximum age in milliseconds of a sample considered valid for an
    /// instant evaluation.
    pub lookback_delta_ms: i64,
    /// How far before the range window extended-range functions may reach
    /// for their seed sample, in milliseconds.
    pub ext_lookback_delta_ms: i64,
    /// Range functions that consult one sample before the window start.
    ///
    /// The default set covers the counter/gauge rate family; deployments can
    /// extend or shrink it without code changes.
    #[serde(default = "default_extended_range_functions")]
    pub extended_range_functions: HashSet<String>,
    /// Whether a Deduplicate node may mask the failure of one remote engine
    /// when sibling engines cover the time range. Fail-closed by default.
    #[serde(default)]
    pub allow_partial_remote_results: bool,
}

fn default_extended_range_functions() -> HashSet<String> {
    ["rate", "increase", "delta"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            steps_per_batch: 10,
            lookback_delta_ms: 5 * 60 * 1000,
            ext_lookback_delta_ms: 60 * 60 * 1000,
            extended_range_functions: default_extended_range_functions(),
            allow_partial_remote_results: false,
        }
    }
}

impl EngineConfig {
    /// Returns whether `name` is configured as an extended-range function.
    pub fn is_extended_range_function(&self, name: &str) -> bool {
        self.extended_range_functions.contains(name)
    }
}

/// Per-query evaluation window and step grid.
///
/// Timestamps are unix milliseconds. An instant query is expressed as
/// `start == end` with `step_ms == 0`; operators internally treat the step as
/// 1 ms so that they terminate after a single evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueryOptions {
    /// First evaluation timestamp.
    pub start_ms: i64,
    /// Last evaluation timestamp (inclusive).
    pub end_ms: i64,
    /// Spacing of the step grid; 0 for instant queries.
    pub step_ms: i64,
    /// Lookback delta for instant selections.
    pub lookback_delta_ms: i64,
    /// Number of step-vectors produced per operator pull.
    pub steps_per_batch: usize,
}

impl QueryOptions {
    /// Create options for an instant query at `ts`.
    pub fn instant(ts_ms: i64, lookback_delta_ms: i64, steps_per_batch: usize) -> Self {
        Self {
            start_ms: ts_ms,
            end_ms: ts_ms,
            step_ms: 0,
            lookback_delta_ms,
            steps_per_batch,
        }
    }

    /// Total number of timestamps on the step grid.
    pub fn total_steps(&self) -> i64 {
        if self.step_ms == 0 {
            return 1;
        }
        (self.end_ms - self.start_ms) / self.step_ms + 1
    }

    /// Number of step-vectors an operator should emit per pull.
    pub fn num_steps(&self) -> usize {
        (self.steps_per_batch as i64).min(self.total_steps()) as usize
    }
}
