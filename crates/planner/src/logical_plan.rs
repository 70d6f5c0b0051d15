//! Logical plan nodes: language expressions plus engine-specific nodes.
//!
//! The plan tree mirrors the parsed expression shape so that the distributed
//! optimizer can splice [`LogicalPlan::Remote`] and [`LogicalPlan::Dedup`]
//! nodes into arbitrary positions, something the parser's closed expression
//! enum does not allow.

use std::fmt;
use std::sync::Arc;

use fmq_common::{FmqError, Result};
use fmq_execution::RemoteEngine;
use fmq_storage::format_matchers;
use promql_parser::label::Matchers;
use promql_parser::parser::token::{
    TokenType, T_ADD, T_ATAN2, T_AVG, T_BOTTOMK, T_COUNT, T_COUNT_VALUES, T_DIV, T_EQLC, T_GROUP,
    T_GTE, T_GTR, T_LAND, T_LOR, T_LSS, T_LTE, T_LUNLESS, T_MAX, T_MIN, T_MOD, T_MUL, T_NEQ,
    T_POW, T_QUANTILE, T_STDDEV, T_STDVAR, T_SUB, T_SUM, T_TOPK,
};
use promql_parser::parser::{Expr, LabelModifier, Offset};

/// Aggregation operators of the query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Group,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    CountValues,
    Quantile,
}

impl AggOp {
    fn from_token(op: TokenType) -> Result<Self> {
        Ok(match op.id() {
            T_SUM => Self::Sum,
            T_AVG => Self::Avg,
            T_COUNT => Self::Count,
            T_MIN => Self::Min,
            T_MAX => Self::Max,
            T_GROUP => Self::Group,
            T_STDDEV => Self::Stddev,
            T_STDVAR => Self::Stdvar,
            T_TOPK => Self::Topk,
            T_BOTTOMK => Self::Bottomk,
            T_COUNT_VALUES => Self::CountValues,
            T_QUANTILE => Self::Quantile,
            _ => {
                return Err(FmqError::Planning(format!(
                    "unsupported aggregation operator: {op:?}"
                )))
            }
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Group => "group",
            Self::Stddev => "stddev",
            Self::Stdvar => "stdvar",
            Self::Topk => "topk",
            Self::Bottomk => "bottomk",
            Self::CountValues => "count_values",
            Self::Quantile => "quantile",
        }
    }

    /// Whether the global answer can be assembled from per-engine partial
    /// answers without cross-engine data movement.
    pub fn is_distributive(&self) -> bool {
        matches!(
            self,
            Self::Sum | Self::Min | Self::Max | Self::Group | Self::Count | Self::Bottomk | Self::Topk
        )
    }
}

/// A vector selector: metric name, matchers, and offset.
#[derive(Debug, Clone)]
pub struct VectorSelectorPlan {
    pub name: Option<String>,
    pub matchers: Matchers,
    pub offset_ms: i64,
}

/// A remote execution of a subquery against one engine.
#[derive(Clone)]
pub struct RemoteExecution {
    pub engine: Arc<dyn RemoteEngine>,
    /// Textual form of the distributed expression.
    pub query: String,
    /// Step-aligned start of the engine's assigned range.
    pub start_ms: i64,
}

impl fmt::Debug for RemoteExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteExecution")
            .field("engine", &self.engine.name())
            .field("query", &self.query)
            .field("start_ms", &self.start_ms)
            .finish()
    }
}

impl fmt::Display for RemoteExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_ms == 0 {
            return write!(f, "remote({})", self.query);
        }
        write!(f, "remote({}) [start={}]", self.query, self.start_ms)
    }
}

/// Deduplication over remote executions sharing one result shape.
#[derive(Debug, Clone, Default)]
pub struct Deduplicate {
    pub expressions: Vec<RemoteExecution>,
}

impl fmt::Display for Deduplicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.expressions.iter().map(|r| r.to_string()).collect();
        write!(f, "dedup({})", parts.join(", "))
    }
}

/// One node of the logical plan.
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    VectorSelector(VectorSelectorPlan),
    MatrixSelector {
        selector: VectorSelectorPlan,
        range_ms: i64,
    },
    Call {
        func: String,
        args: Vec<LogicalPlan>,
    },
    Aggregate {
        op: AggOp,
        expr: Box<LogicalPlan>,
        param: Option<Box<LogicalPlan>>,
        grouping: Vec<String>,
        without: bool,
    },
    Binary {
        op: TokenType,
        lhs: Box<LogicalPlan>,
        rhs: Box<LogicalPlan>,
        return_bool: bool,
    },
    Unary {
        expr: Box<LogicalPlan>,
    },
    Paren {
        expr: Box<LogicalPlan>,
    },
    Subquery {
        expr: Box<LogicalPlan>,
        range_ms: i64,
        step_ms: Option<i64>,
        offset_ms: i64,
    },
    NumberLiteral(f64),
    StringLiteral(String),
    /// Engine-specific: dispatch of a subquery to one remote engine.
    Remote(RemoteExecution),
    /// Engine-specific: deduplicated fan-out over remote engines.
    Dedup(Deduplicate),
}

impl LogicalPlan {
    /// Convert a parsed expression into a plan tree.
    pub fn from_expr(expr: &Expr) -> Result<Self> {
        Ok(match expr {
            Expr::VectorSelector(vs) => Self::VectorSelector(vector_selector_plan(vs)?),
            Expr::MatrixSelector(ms) => Self::MatrixSelector {
                selector: vector_selector_plan(&ms.vs)?,
                range_ms: ms.range.as_millis() as i64,
            },
            Expr::Call(call) => Self::Call {
                func: call.func.name.to_string(),
                args: call
                    .args
                    .args
                    .iter()
                    .map(|arg| Self::from_expr(arg))
                    .collect::<Result<Vec<_>>>()?,
            },
            Expr::Aggregate(agg) => {
                let (grouping, without) = match &agg.modifier {
                    None => (Vec::new(), false),
                    Some(LabelModifier::Include(labels)) => (labels.labels.clone(), false),
                    Some(LabelModifier::Exclude(labels)) => (labels.labels.clone(), true),
                };
                Self::Aggregate {
                    op: AggOp::from_token(agg.op)?,
                    expr: Box::new(Self::from_expr(&agg.expr)?),
                    param: match &agg.param {
                        Some(p) => Some(Box::new(Self::from_expr(p)?)),
                        None => None,
                    },
                    grouping,
                    without,
                }
            }
            Expr::Binary(bin) => Self::Binary {
                op: bin.op,
                lhs: Box::new(Self::from_expr(&bin.lhs)?),
                rhs: Box::new(Self::from_expr(&bin.rhs)?),
                return_bool: bin.return_bool(),
            },
            Expr::Unary(u) => Self::Unary {
                expr: Box::new(Self::from_expr(&u.expr)?),
            },
            Expr::Paren(p) => Self::Paren {
                expr: Box::new(Self::from_expr(&p.expr)?),
            },
            Expr::Subquery(sq) => Self::Subquery {
                expr: Box::new(Self::from_expr(&sq.expr)?),
                range_ms: sq.range.as_millis() as i64,
                step_ms: sq.step.map(|s| s.as_millis() as i64),
                offset_ms: offset_ms(sq.offset.as_ref()),
            },
            Expr::NumberLiteral(n) => Self::NumberLiteral(n.val),
            Expr::StringLiteral(s) => Self::StringLiteral(s.val.clone()),
            Expr::Extension(_) => {
                return Err(FmqError::Planning(
                    "extension expressions are not plannable".to_string(),
                ))
            }
        })
    }
}

fn vector_selector_plan(vs: &promql_parser::parser::VectorSelector) -> Result<VectorSelectorPlan> {
    if vs.at.is_some() {
        return Err(FmqError::Planning(
            "@ modifiers are not supported".to_string(),
        ));
    }
    Ok(VectorSelectorPlan {
        name: vs.name.clone(),
        matchers: vs.matchers.clone(),
        offset_ms: offset_ms(vs.offset.as_ref()),
    })
}

fn offset_ms(offset: Option<&Offset>) -> i64 {
    match offset {
        None => 0,
        Some(Offset::Pos(d)) => d.as_millis() as i64,
        Some(Offset::Neg(d)) => -(d.as_millis() as i64),
    }
}

fn binary_op_str(op: TokenType) -> &'static str {
    match op.id() {
        T_ADD => "+",
        T_SUB => "-",
        T_MUL => "*",
        T_DIV => "/",
        T_MOD => "%",
        T_POW => "^",
        T_EQLC => "==",
        T_NEQ => "!=",
        T_GTR => ">",
        T_LSS => "<",
        T_GTE => ">=",
        T_LTE => "<=",
        T_LAND => "and",
        T_LOR => "or",
        T_LUNLESS => "unless",
        T_ATAN2 => "atan2",
        _ => "?",
    }
}

/// Render milliseconds as a query-language duration, e.g. `90000` -> `1m30s`.
pub fn format_duration_ms(ms: i64) -> String {
    if ms == 0 {
        return "0s".to_string();
    }
    let (sign, mut ms) = if ms < 0 {
        ("-", -ms)
    } else {
        ("", ms)
    };
    let mut out = sign.to_string();
    for (unit, unit_ms) in [
        ("d", 24 * 60 * 60 * 1000),
        ("h", 60 * 60 * 1000),
        ("m", 60 * 1000),
        ("s", 1000),
        ("ms", 1),
    ] {
        if ms >= unit_ms {
            out.push_str(&format!("{}{}", ms / unit_ms, unit));
            ms %= unit_ms;
        }
    }
    out
}

fn fmt_selector(f: &mut fmt::Formatter<'_>, selector: &VectorSelectorPlan) -> fmt::Result {
    if let Some(name) = &selector.name {
        write!(f, "{name}")?;
    }
    // The metric name renders outside the braces; drop any redundant
    // __name__ matcher the parser may carry for it.
    let visible = Matchers::new(
        selector
            .matchers
            .matchers
            .iter()
            .filter(|m| selector.name.is_none() || m.name != fmq_storage::METRIC_NAME)
            .cloned()
            .collect(),
    );
    if !visible.matchers.is_empty() {
        write!(f, "{{{}}}", format_matchers(&visible))?;
    } else if selector.name.is_none() {
        write!(f, "{{}}")?;
    }
    Ok(())
}

fn fmt_offset(f: &mut fmt::Formatter<'_>, offset_ms: i64) -> fmt::Result {
    if offset_ms != 0 {
        write!(f, " offset {}", format_duration_ms(offset_ms))?;
    }
    Ok(())
}

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VectorSelector(vs) => {
                fmt_selector(f, vs)?;
                fmt_offset(f, vs.offset_ms)
            }
            Self::MatrixSelector { selector, range_ms } => {
                fmt_selector(f, selector)?;
                write!(f, "[{}]", format_duration_ms(*range_ms))?;
                fmt_offset(f, selector.offset_ms)
            }
            Self::Call { func, args } => {
                let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{func}({})", rendered.join(", "))
            }
            Self::Aggregate {
                op,
                expr,
                param,
                grouping,
                without,
            } => {
                write!(f, "{}", op.as_str())?;
                if *without || !grouping.is_empty() {
                    let clause = if *without { "without" } else { "by" };
                    write!(f, " {clause} ({}) ", grouping.join(", "))?;
                }
                match param {
                    Some(param) => write!(f, "({param}, {expr})"),
                    None => write!(f, "({expr})"),
                }
            }
            Self::Binary {
                op,
                lhs,
                rhs,
                return_bool,
            } => {
                let op = binary_op_str(*op);
                if *return_bool {
                    write!(f, "{lhs} {op} bool {rhs}")
                } else {
                    write!(f, "{lhs} {op} {rhs}")
                }
            }
            Self::Unary { expr } => write!(f, "-{expr}"),
            Self::Paren { expr } => write!(f, "({expr})"),
            Self::Subquery {
                expr,
                range_ms,
                step_ms,
                offset_ms,
            } => {
                write!(f, "{expr}[{}:", format_duration_ms(*range_ms))?;
                if let Some(step) = step_ms {
                    write!(f, "{}", format_duration_ms(*step))?;
                }
                write!(f, "]")?;
                fmt_offset(f, *offset_ms)
            }
            Self::NumberLiteral(v) => write!(f, "{v}"),
            Self::StringLiteral(s) => write!(f, "\"{s}\""),
            Self::Remote(remote) => write!(f, "{remote}"),
            Self::Dedup(dedup) => write!(f, "{dedup}"),
        }
    }
}
