//! Remote engines, the remote-execution leaf, and result deduplication.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use fmq_common::{global_metrics, FmqError, QueryOptions, Result};
use fmq_storage::Labels;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{check_cancelled, StepVector, VectorOperator, VectorPool};
use crate::stream::SendableStepVectorStream;

/// A peer query engine holding a slice of the data.
///
/// Engines advertise the time window they cover and the label sets of the
/// data they may carry; the planner uses both to scope and shape remote
/// subqueries.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    /// Stable engine identifier for explain output and metrics.
    fn name(&self) -> &str;

    /// Earliest timestamp this engine holds data for, unix milliseconds.
    fn min_t(&self) -> i64;

    /// Latest timestamp this engine holds data for, unix milliseconds.
    fn max_t(&self) -> i64;

    /// Label sets this engine's series may carry (for example external
    /// labels identifying the cluster).
    fn label_sets(&self) -> &[Labels];

    /// Evaluate `query` over the assigned range and stream step-vector
    /// batches back on the local step grid.
    async fn execute(
        &self,
        token: &CancellationToken,
        query: &str,
        opts: &QueryOptions,
    ) -> Result<SendableStepVectorStream>;
}

/// Leaf operator dispatching one subquery to a remote engine.
///
/// The dispatch happens lazily on the first pull (or series request) and the
/// resulting stream is drained batch by batch.
pub struct RemoteExec {
    engine: Arc<dyn RemoteEngine>,
    query: String,
    opts: QueryOptions,
    pool: Arc<VectorPool>,

    stream: Option<SendableStepVectorStream>,
    failed: Option<FmqError>,
}

impl RemoteExec {
    /// `opts` carries the engine's assigned range; its start is already
    /// step-aligned by the planner.
    pub fn new(
        pool: Arc<VectorPool>,
        engine: Arc<dyn RemoteEngine>,
        query: String,
        opts: QueryOptions,
    ) -> Self {
        Self {
            engine,
            query,
            opts,
            pool,
            stream: None,
            failed: None,
        }
    }

    async fn ensure_stream(&mut self, token: &CancellationToken) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let result = self.engine.execute(token, &self.query, &self.opts).await;
        global_metrics().record_remote_query(self.engine.name(), result.is_err());
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => {
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl VectorOperator for RemoteExec {
    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            format!(
                "[remote_exec] {} @ {} [start={}]",
                self.query,
                self.engine.name(),
                self.opts.start_ms
            ),
            Vec::new(),
        )
    }

    async fn series(&mut self, token: &CancellationToken) -> Result<Vec<Labels>> {
        check_cancelled(token)?;
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.ensure_stream(token).await?;
        Ok(self
            .stream
            .as_ref()
            .map(|s| s.series().to_vec())
            .unwrap_or_default())
    }

    async fn next(&mut self, token: &CancellationToken) -> Result<Option<Vec<StepVector>>> {
        check_cancelled(token)?;
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.ensure_stream(token).await?;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(None),
        };
        match stream.next().await {
            None => Ok(None),
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(err)) => {
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}

/// Merges step-vectors from parallel remote leaves by `(t, signature)`.
///
/// Children may start at different (step-aligned) timestamps and advance
/// independently; the merge picks the smallest pending timestamp across
/// children each round. For one `(t, signature)` the first child's entry
/// wins and later duplicates are dropped.
pub struct Deduplicate {
    children: Vec<Box<dyn VectorOperator>>,
    pool: Arc<VectorPool>,
    steps_per_batch: usize,
    /// When set, a failed child is dropped with a warning instead of
    /// failing the query. Fail-closed by default.
    allow_partial: bool,

    buffers: Vec<VecDeque<StepVector>>,
    done: Vec<bool>,
    series: Option<Vec<Labels>>,
    failed: Option<FmqError>,
}

impl Deduplicate {
    pub fn new(
        pool: Arc<VectorPool>,
        children: Vec<Box<dyn VectorOperator>>,
        steps_per_batch: usize,
        allow_partial: bool,
    ) -> Self {
        let n = children.len();
        Self {
            children,
            pool,
            steps_per_batch,
            allow_partial,
            buffers: (0..n).map(|_| VecDeque::new()).collect(),
            done: vec![false; n],
            series: None,
            failed: None,
        }
    }

    /// Pull a batch from every child that has an empty buffer, in parallel.
    async fn refill(&mut self, token: &CancellationToken) -> Result<()> {
        let buffers = &self.buffers;
        let done = &self.done;
        let pulls = self
            .children
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| !done[*i] && buffers[*i].is_empty())
            .map(|(i, child)| async move { (i, child.next(token).await) });
        let results = futures::future::join_all(pulls).await;

        for (i, result) in results {
            match result {
                Ok(Some(batch)) => self.buffers[i].extend(batch),
                Ok(None) => self.done[i] = true,
                Err(err) => {
                    if self.allow_partial && !matches!(err, FmqError::Cancelled) {
                        warn!(child = i, error = %err, "dropping failed remote child");
                        self.done[i] = true;
                        continue;
                    }
                    self.failed = Some(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn merge_at(&mut self, t: i64) -> StepVector {
        let mut merged = self.pool.get_step_vector(t);
        let mut seen: HashSet<u64> = HashSet::new();
        for buffer in &mut self.buffers {
            if !matches!(buffer.front(), Some(front) if front.t == t) {
                continue;
            }
            let Some(front) = buffer.pop_front() else {
                continue;
            };
            for (id, v) in front.sample_ids.iter().zip(front.samples.iter()) {
                if seen.insert(*id) {
                    merged.append_sample(*id, *v);
                }
            }
            for (id, h) in front.histogram_ids.iter().zip(front.histograms.iter()) {
                if seen.insert(*id) {
                    merged.append_histogram(*id, h.clone());
                }
            }
        }
        merged
    }
}

#[async_trait]
impl VectorOperator for Deduplicate {
    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            "[dedup]".to_string(),
            self.children.iter().map(|c| c.as_ref()).collect(),
        )
    }

    async fn series(&mut self, token: &CancellationToken) -> Result<Vec<Labels>> {
        check_cancelled(token)?;
        if let Some(series) = &self.series {
            return Ok(series.clone());
        }
        let mut merged: Vec<Labels> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        for child in &mut self.children {
            for labels in child.series(token).await? {
                if seen.insert(labels.signature()) {
                    merged.push(labels);
                }
            }
        }
        self.series = Some(merged.clone());
        Ok(merged)
    }

    async fn next(&mut self, token: &CancellationToken) -> Result<Option<Vec<StepVector>>> {
        check_cancelled(token)?;
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let mut out = self.pool.get_vector_batch();
        loop {
            self.refill(token).await?;

            let next_t = self
                .buffers
                .iter()
                .filter_map(|b| b.front().map(|v| v.t))
                .min();
            let t = match next_t {
                Some(t) => t,
                None => {
                    // Children that are not done produced empty batches;
                    // keep pulling until data or end of stream.
                    if self.done.iter().all(|d| *d) {
                        break;
                    }
                    continue;
                }
            };
            out.push(self.merge_at(t));
            if out.len() == self.steps_per_batch {
                return Ok(Some(out));
            }
        }

        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}
