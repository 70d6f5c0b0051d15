//! Distributed-execution rewrite of logical plans.
//!
//! Contract:
//! - distributive aggregations are pushed down to every engine covering the
//!   query range, with grouping expanded by the engines' advertised label
//!   sets;
//! - `count` is re-aggregated locally as `sum` (engines already counted);
//! - non-distributive nodes stop descent; everything below a
//!   non-distributive parent is distributed whole;
//! - remote starts are aligned to the local step grid.

use std::collections::BTreeSet;
use std::sync::Arc;

use fmq_common::QueryOptions;
use fmq_execution::RemoteEngine;
use tracing::debug;

use crate::logical_plan::{AggOp, Deduplicate, LogicalPlan, RemoteExecution};

/// Rewrites a plan into local operators over remote-execution subtrees.
pub struct DistributedOptimizer {
    engines: Vec<Arc<dyn RemoteEngine>>,
}

impl DistributedOptimizer {
    pub fn new(engines: Vec<Arc<dyn RemoteEngine>>) -> Self {
        Self { engines }
    }

    /// Rewrite `plan` for distributed execution over `opts`' range.
    pub fn optimize(&self, mut plan: LogicalPlan, opts: &QueryOptions) -> LogicalPlan {
        traverse_bottom_up(None, &mut plan, &mut |parent, current| {
            // If the current operation is not distributive, stop the
            // traversal.
            if !is_distributive(Some(&*current)) {
                return true;
            }

            // If the current node is an aggregation, distribute the
            // operation and stop the traversal.
            let aggregate = match &*current {
                LogicalPlan::Aggregate {
                    op,
                    expr,
                    param,
                    grouping,
                    without,
                } => {
                    let local_op = if *op == AggOp::Count { AggOp::Sum } else { *op };
                    let remote = LogicalPlan::Aggregate {
                        op: *op,
                        expr: expr.clone(),
                        param: param.clone(),
                        grouping: self.remote_grouping(grouping, *without),
                        without: *without,
                    };
                    debug!(remote = %remote, "pushing aggregation down");
                    Some((
                        local_op,
                        self.distribute(&remote, opts),
                        param.clone(),
                        grouping.clone(),
                        *without,
                    ))
                }
                _ => None,
            };
            if let Some((op, subqueries, param, grouping, without)) = aggregate {
                *current = LogicalPlan::Aggregate {
                    op,
                    expr: Box::new(LogicalPlan::Dedup(subqueries)),
                    param,
                    grouping,
                    without,
                };
                return true;
            }

            // If the parent operation is distributive, the push-down happens
            // at a higher level.
            if is_distributive(parent) {
                return false;
            }

            *current = LogicalPlan::Dedup(self.distribute(current, opts));
            true
        });
        plan
    }

    /// Expand grouping labels with every label name the engines advertise:
    /// remote engines must keep those labels so the local re-aggregation can
    /// still distinguish per-engine partial results.
    fn remote_grouping(&self, grouping: &[String], without: bool) -> Vec<String> {
        let mut set: BTreeSet<String> = grouping.iter().cloned().collect();
        for engine in &self.engines {
            for labels in engine.label_sets() {
                for label in labels.iter() {
                    if without {
                        set.remove(&label.name);
                    } else {
                        set.insert(label.name.clone());
                    }
                }
            }
        }
        set.into_iter().collect()
    }

    /// One `RemoteExecution` per engine overlapping the query range, each
    /// scoped to a step-aligned start, wrapped in a `Deduplicate`.
    fn distribute(&self, expr: &LogicalPlan, opts: &QueryOptions) -> Deduplicate {
        let mut expressions = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            if engine.max_t() < opts.start_ms - opts.lookback_delta_ms {
                continue;
            }
            if engine.min_t() > opts.end_ms {
                continue;
            }

            let mut start_ms = opts.start_ms;
            if engine.min_t() > start_ms {
                start_ms = calculate_step_aligned_start(engine.as_ref(), opts);
            }

            expressions.push(RemoteExecution {
                engine: Arc::clone(engine),
                query: expr.to_string(),
                start_ms,
            });
        }
        Deduplicate { expressions }
    }
}

/// The latest timestamp at or after the engine's earliest data that lies on
/// the query's step grid, so remote steps coincide with local ones.
pub fn calculate_step_aligned_start(engine: &dyn RemoteEngine, opts: &QueryOptions) -> i64 {
    let step = opts.step_ms.max(1);
    let total_steps = num_steps(opts.start_ms, opts.end_ms, step);
    let remote_steps = num_steps(engine.min_t(), opts.end_ms, step);
    let steps_to_skip = total_steps - remote_steps;
    opts.start_ms + steps_to_skip * step
}

fn num_steps(start_ms: i64, end_ms: i64, step_ms: i64) -> i64 {
    (end_ms - start_ms) / step_ms + 1
}

fn is_distributive(plan: Option<&LogicalPlan>) -> bool {
    match plan {
        None => false,
        // Binary expressions are joins over the entire data set, so
        // aggregations over them cannot be pushed down.
        Some(LogicalPlan::Binary { .. }) => false,
        Some(LogicalPlan::Aggregate { op, .. }) => op.is_distributive(),
        Some(LogicalPlan::Call { args, .. }) => !args.is_empty(),
        Some(_) => true,
    }
}

/// Visit children before their parent; a visit may rewrite `current` in
/// place and returns whether descent should stop. A stopped subtree also
/// suppresses the transform of its ancestors.
fn traverse_bottom_up<F>(
    parent: Option<&LogicalPlan>,
    current: &mut LogicalPlan,
    transform: &mut F,
) -> bool
where
    F: FnMut(Option<&LogicalPlan>, &mut LogicalPlan) -> bool,
{
    // Children see a pre-rewrite snapshot of their parent; the transform
    // only inspects node kinds.
    let snapshot = current.clone();
    let stopped = match current {
        LogicalPlan::Aggregate { expr, .. } => traverse_bottom_up(Some(&snapshot), expr, transform),
        LogicalPlan::Binary { lhs, rhs, .. } => {
            let l = traverse_bottom_up(Some(&snapshot), lhs, transform);
            let r = traverse_bottom_up(Some(&snapshot), rhs, transform);
            l || r
        }
        LogicalPlan::Call { args, .. } => {
            let mut stopped = false;
            for arg in args.iter_mut() {
                stopped |= traverse_bottom_up(Some(&snapshot), arg, transform);
            }
            stopped
        }
        LogicalPlan::Unary { expr }
        | LogicalPlan::Paren { expr }
        | LogicalPlan::Subquery { expr, .. } => traverse_bottom_up(Some(&snapshot), expr, transform),
        LogicalPlan::VectorSelector(_)
        | LogicalPlan::MatrixSelector { .. }
        | LogicalPlan::NumberLiteral(_)
        | LogicalPlan::StringLiteral(_)
        | LogicalPlan::Remote(_)
        | LogicalPlan::Dedup(_) => false,
    };
    if stopped {
        return true;
    }
    transform(parent, current)
}
