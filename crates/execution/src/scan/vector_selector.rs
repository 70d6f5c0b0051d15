//! Instant-vector selection with lookback.

use std::sync::Arc;

use async_trait::async_trait;
use fmq_common::{global_metrics, FmqError, QueryOptions, Result};
use fmq_storage::{format_matchers, is_stale_nan, Labels, SampleIterator, SeriesSelector, ValueKind};
use tokio_util::sync::CancellationToken;

use crate::model::{check_cancelled, StepVector, VectorOperator, VectorPool};

struct VectorScanner {
    signature: u64,
    samples: Box<dyn SampleIterator>,

    // Previous-sample cache supporting lookback delta.
    past_first_iteration: bool,
    prev: Option<(i64, f64)>,
}

impl VectorScanner {
    /// Advance the cursor to the first sample with timestamp `>= ts`,
    /// snapshotting the sample stepped past so lookback can fall back to it.
    fn advance(&mut self, ts: i64) -> Result<bool> {
        loop {
            if self.past_first_iteration {
                if let Some(s) = self.samples.at() {
                    // A cursor already at or past ts is the first sample at
                    // or after ts: nothing is stepped past, so `prev` must
                    // keep the sample from before the cursor.
                    if s.t >= ts {
                        return Ok(true);
                    }
                    if let Some(v) = s.as_float() {
                        self.prev = Some((s.t, v));
                    }
                }
            }
            match self.samples.next_value() {
                ValueKind::None => {
                    if let Some(err) = self.samples.error() {
                        return Err(err);
                    }
                    return Ok(false);
                }
                _ => {
                    self.past_first_iteration = true;
                    if let Some(s) = self.samples.at() {
                        if s.t >= ts {
                            return Ok(true);
                        }
                    }
                }
            }
        }
    }

    /// The float value visible at `ts`, looking back at most
    /// `lookback_delta` milliseconds. Stale markers and out-of-window
    /// samples yield no value.
    fn select_point(&mut self, ts: i64, lookback_delta: i64) -> Result<Option<f64>> {
        let found = self.advance(ts)?;
        let mut chosen: Option<(i64, f64)> = None;
        if found {
            if let Some(s) = self.samples.at() {
                if let Some(v) = s.as_float() {
                    chosen = Some((s.t, v));
                }
            }
        }
        let (t, v) = match chosen {
            Some((t, v)) if t <= ts => (t, v),
            _ => match self.prev {
                Some((t, v)) => (t, v),
                None => return Ok(None),
            },
        };
        if t < ts - lookback_delta {
            return Ok(None);
        }
        if is_stale_nan(v) {
            return Ok(None);
        }
        Ok(Some(v))
    }
}

/// Operator emitting one sample per series per step via lookback.
pub struct VectorSelector {
    storage: Arc<SeriesSelector>,
    pool: Arc<VectorPool>,

    scanners: Vec<VectorScanner>,
    series: Option<Vec<Labels>>,

    mint: i64,
    maxt: i64,
    step: i64,
    current_step: i64,
    steps_per_batch: usize,
    lookback_delta: i64,

    shard: usize,
    num_shards: usize,

    failed: Option<FmqError>,
}

impl VectorSelector {
    pub fn new(
        pool: Arc<VectorPool>,
        storage: Arc<SeriesSelector>,
        opts: &QueryOptions,
        shard: usize,
        num_shards: usize,
    ) -> Self {
        Self {
            storage,
            pool,
            scanners: Vec::new(),
            series: None,
            mint: opts.start_ms,
            maxt: opts.end_ms,
            step: opts.step_ms,
            current_step: opts.start_ms,
            steps_per_batch: opts.steps_per_batch,
            lookback_delta: opts.lookback_delta_ms,
            shard,
            num_shards,
            failed: None,
        }
    }

    async fn load_series(&mut self, token: &CancellationToken) -> Result<()> {
        if self.series.is_some() {
            return Ok(());
        }
        let series = self
            .storage
            .get_series(token, self.shard, self.num_shards)
            .await?;
        self.scanners = series
            .iter()
            .map(|s| VectorScanner {
                signature: s.signature(),
                samples: s.sample_iter(),
                past_first_iteration: false,
                prev: None,
            })
            .collect();
        self.series = Some(series.iter().map(|s| s.labels().clone()).collect());
        self.pool.set_step_size(series.len());
        global_metrics().record_series_loaded("vector_selector", series.len() as u64);
        Ok(())
    }
}

#[async_trait]
impl VectorOperator for VectorSelector {
    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            format!(
                "[vector_selector] {{{}}} {} mod {}",
                format_matchers(self.storage.matchers()),
                self.shard,
                self.num_shards
            ),
            Vec::new(),
        )
    }

    async fn series(&mut self, token: &CancellationToken) -> Result<Vec<Labels>> {
        check_cancelled(token)?;
        self.load_series(token).await?;
        Ok(self.series.clone().unwrap_or_default())
    }

    async fn next(&mut self, token: &CancellationToken) -> Result<Option<Vec<StepVector>>> {
        check_cancelled(token)?;
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.current_step > self.maxt {
            return Ok(None);
        }
        if let Err(err) = self.load_series(token).await {
            self.failed = Some(err.clone());
            return Err(err);
        }

        // Instant evaluation runs as a range evaluation with one step; the
        // step is forced positive so the operator terminates.
        let total_steps = if self.step != 0 {
            (self.maxt - self.mint) / self.step + 1
        } else {
            self.step = 1;
            1
        };
        let num_steps = (self.steps_per_batch as i64).min(total_steps) as usize;

        let mut vectors = self.pool.get_vector_batch();
        let ts = self.current_step;
        for i in 0..self.scanners.len() {
            let mut series_ts = ts;
            let mut curr_step = 0;
            while curr_step < num_steps && series_ts <= self.maxt {
                if vectors.len() <= curr_step {
                    vectors.push(self.pool.get_step_vector(series_ts));
                }
                let scanner = &mut self.scanners[i];
                match scanner.select_point(series_ts, self.lookback_delta) {
                    Ok(Some(v)) => vectors[curr_step].append_sample(scanner.signature, v),
                    Ok(None) => {}
                    Err(err) => {
                        self.failed = Some(err.clone());
                        return Err(err);
                    }
                }
                series_ts += self.step;
                curr_step += 1;
            }
        }
        self.current_step += self.step * num_steps as i64;

        global_metrics().record_operator_batch("vector_selector", vectors.len() as u64);
        Ok(Some(vectors))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}
