//! Logical planning for FMQ query execution.
//!
//! Architecture role:
//! - converts parsed expressions into a plan tree the engine can rewrite
//! - rewrites plans for distributed execution (aggregation push-down,
//!   deduplicated remote fan-out, step-aligned remote starts)
//! - renders plans for explain output
//!
//! Key modules:
//! - [`logical_plan`]
//! - [`distribute`]
//! - [`explain`]

pub mod distribute;
pub mod explain;
pub mod logical_plan;

pub use distribute::{calculate_step_aligned_start, DistributedOptimizer};
pub use explain::explain_plan;
pub use logical_plan::{
    format_duration_ms, AggOp, Deduplicate, LogicalPlan, RemoteExecution, VectorSelectorPlan,
};
