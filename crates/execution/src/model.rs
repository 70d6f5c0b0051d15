//! Operator contract and pooled step-vector storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fmq_common::{FmqError, Result};
use fmq_storage::{FloatHistogram, Labels};
use tokio_util::sync::CancellationToken;

/// Samples for one evaluation timestamp, sparse over series signatures.
///
/// Entries for series with no sample at `t` are absent. Float and histogram
/// entries live in parallel id/value columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepVector {
    /// Evaluation timestamp in unix milliseconds.
    pub t: i64,
    /// Signatures of series carrying float samples.
    pub sample_ids: Vec<u64>,
    /// Float samples, parallel to `sample_ids`.
    pub samples: Vec<f64>,
    /// Signatures of series carrying histogram samples.
    pub histogram_ids: Vec<u64>,
    /// Histogram samples, parallel to `histogram_ids`.
    pub histograms: Vec<FloatHistogram>,
}

impl StepVector {
    pub fn append_sample(&mut self, signature: u64, value: f64) {
        self.sample_ids.push(signature);
        self.samples.push(value);
    }

    pub fn append_histogram(&mut self, signature: u64, histogram: FloatHistogram) {
        self.histogram_ids.push(signature);
        self.histograms.push(histogram);
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty() && self.histogram_ids.is_empty()
    }

    fn reset(&mut self, t: i64) {
        self.t = t;
        self.sample_ids.clear();
        self.samples.clear();
        self.histogram_ids.clear();
        self.histograms.clear();
    }
}

/// Recyclable storage for step-vector batches.
///
/// Allocation is amortized across pulls: released batches hand their vectors
/// back to a free list, and `set_step_size` records the expected per-step
/// entry count so fresh vectors come with the right capacity. Safe to share
/// across operators running on different tasks.
#[derive(Debug)]
pub struct VectorPool {
    batch_capacity: usize,
    step_size: AtomicUsize,
    vectors: Mutex<Vec<StepVector>>,
}

impl VectorPool {
    /// `batch_capacity` is the steps-per-batch budget batches are sized for.
    pub fn new(batch_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            batch_capacity,
            step_size: AtomicUsize::new(0),
            vectors: Mutex::new(Vec::new()),
        })
    }

    /// Record the known series count so step vectors carry capacity hints.
    pub fn set_step_size(&self, n: usize) {
        self.step_size.store(n, Ordering::Relaxed);
    }

    /// An empty batch sized for the steps-per-batch budget.
    pub fn get_vector_batch(&self) -> Vec<StepVector> {
        Vec::with_capacity(self.batch_capacity)
    }

    /// An empty step vector for timestamp `t`, recycled when possible.
    pub fn get_step_vector(&self, t: i64) -> StepVector {
        if let Some(mut v) = self.vectors.lock().expect("vector pool poisoned").pop() {
            v.reset(t);
            return v;
        }
        let step_size = self.step_size.load(Ordering::Relaxed);
        StepVector {
            t,
            sample_ids: Vec::with_capacity(step_size),
            samples: Vec::with_capacity(step_size),
            histogram_ids: Vec::new(),
            histograms: Vec::new(),
        }
    }

    /// Return a finished batch's vectors to the pool.
    pub fn put_vectors(&self, batch: Vec<StepVector>) {
        let mut vectors = self.vectors.lock().expect("vector pool poisoned");
        vectors.extend(batch);
    }
}

/// A pull-based operator producing step-vector batches.
///
/// Operators are single-consumer: at most one pull is in flight per instance,
/// which `&mut self` enforces at compile time. Distinct instances may advance
/// in parallel. Every pull checks the cancellation token before doing work,
/// and a storage or iterator failure latches the operator so subsequent pulls
/// return the same error.
#[async_trait]
pub trait VectorOperator: Send {
    /// Self-description and child operators, for explain output.
    fn explain(&self) -> (String, Vec<&dyn VectorOperator>);

    /// The labels of every series this operator may emit, enumerated lazily
    /// and memoized for the operator's lifetime.
    async fn series(&mut self, token: &CancellationToken) -> Result<Vec<Labels>>;

    /// Produce the next batch of step-vectors in ascending timestamp order,
    /// or `None` at end of stream.
    async fn next(&mut self, token: &CancellationToken) -> Result<Option<Vec<StepVector>>>;

    /// The pool backing this operator's batches. Callers release batches
    /// here once consumed.
    fn pool(&self) -> Arc<VectorPool>;
}

/// Render an operator tree as an indented multiline description.
pub fn explain_operator(op: &dyn VectorOperator) -> String {
    let mut out = String::new();
    fmt_operator(op, 0, &mut out);
    out
}

fn fmt_operator(op: &dyn VectorOperator, indent: usize, out: &mut String) {
    let (desc, children) = op.explain();
    out.push_str(&"  ".repeat(indent));
    out.push_str(&desc);
    out.push('\n');
    for child in children {
        fmt_operator(child, indent + 1, out);
    }
}

/// Fail fast when the caller's token has fired.
pub fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(FmqError::Cancelled);
    }
    Ok(())
}
