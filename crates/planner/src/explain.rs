//! Human-readable plan rendering.

use crate::logical_plan::{format_duration_ms, LogicalPlan};

/// Render a logical plan as indented multiline text.
pub fn explain_plan(plan: &LogicalPlan) -> String {
    let mut out = String::new();
    fmt_plan(plan, 0, &mut out);
    out
}

fn fmt_plan(plan: &LogicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        LogicalPlan::VectorSelector(_) | LogicalPlan::MatrixSelector { .. } => {
            out.push_str(&format!("{pad}Select {plan}\n"));
        }
        LogicalPlan::Call { func, args } => {
            out.push_str(&format!("{pad}Call {func}\n"));
            for arg in args {
                fmt_plan(arg, indent + 1, out);
            }
        }
        LogicalPlan::Aggregate {
            op,
            expr,
            param,
            grouping,
            without,
        } => {
            let clause = if *without { "without" } else { "by" };
            out.push_str(&format!(
                "{pad}Aggregate {} {clause}=({})\n",
                op.as_str(),
                grouping.join(", ")
            ));
            if let Some(param) = param {
                fmt_plan(param, indent + 1, out);
            }
            fmt_plan(expr, indent + 1, out);
        }
        LogicalPlan::Binary { lhs, rhs, .. } => {
            out.push_str(&format!("{pad}Binary {plan}\n"));
            fmt_plan(lhs, indent + 1, out);
            fmt_plan(rhs, indent + 1, out);
        }
        LogicalPlan::Unary { expr } => {
            out.push_str(&format!("{pad}Unary -\n"));
            fmt_plan(expr, indent + 1, out);
        }
        LogicalPlan::Paren { expr } => fmt_plan(expr, indent, out),
        LogicalPlan::Subquery {
            expr,
            range_ms,
            step_ms,
            ..
        } => {
            let step = (*step_ms).map(format_duration_ms).unwrap_or_default();
            out.push_str(&format!(
                "{pad}Subquery [{}:{}]\n",
                format_duration_ms(*range_ms),
                step
            ));
            fmt_plan(expr, indent + 1, out);
        }
        LogicalPlan::NumberLiteral(_) | LogicalPlan::StringLiteral(_) => {
            out.push_str(&format!("{pad}Literal {plan}\n"));
        }
        LogicalPlan::Remote(remote) => {
            out.push_str(&format!(
                "{pad}Remote engine={} start={} query={}\n",
                remote.engine.name(),
                remote.start_ms,
                remote.query
            ));
        }
        LogicalPlan::Dedup(dedup) => {
            out.push_str(&format!("{pad}Dedup\n"));
            for remote in &dedup.expressions {
                fmt_plan(&LogicalPlan::Remote(remote.clone()), indent + 1, out);
            }
        }
    }
}
