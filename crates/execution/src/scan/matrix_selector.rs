//! Range-vector selection with buffered point reuse across steps.

use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use fmq_common::{global_metrics, EngineConfig, FmqError, QueryOptions, Result};
use fmq_storage::{
    format_matchers, BufferedIterator, Labels, Sample, SeriesSelector, Value, ValueKind,
};
use tokio_util::sync::CancellationToken;

use crate::functions::{new_range_function, FunctionArgs, RangeFunctionCall};
use crate::model::{check_cancelled, StepVector, VectorOperator, VectorPool};

struct MatrixScanner {
    labels: Labels,
    signature: u64,
    previous_points: Vec<Sample>,
    samples: BufferedIterator,
}

/// Operator emitting, per step, a range function applied to the window of
/// points `[t - offset - range, t - offset]` for each series.
///
/// Windows of consecutive steps usually overlap, so each series keeps its
/// point buffer across steps and only fetches points newer than the ones
/// already held.
pub struct MatrixSelector {
    storage: Arc<SeriesSelector>,
    pool: Arc<VectorPool>,
    call: RangeFunctionCall,
    func_name: String,

    scanners: Vec<MatrixScanner>,
    series: Option<Vec<Labels>>,

    num_steps: usize,
    maxt: i64,
    step: i64,
    select_range: i64,
    offset: i64,
    current_step: i64,

    shard: usize,
    num_shards: usize,

    // Lookback for extended-range functions.
    ext_range: bool,
    ext_lookback_delta: i64,

    failed: Option<FmqError>,
}

impl MatrixSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<VectorPool>,
        storage: Arc<SeriesSelector>,
        func_name: &str,
        opts: &QueryOptions,
        config: &EngineConfig,
        select_range: i64,
        offset: i64,
        shard: usize,
        num_shards: usize,
    ) -> Result<Self> {
        let call = new_range_function(func_name)?;
        Ok(Self {
            storage,
            pool,
            call,
            func_name: func_name.to_string(),
            scanners: Vec::new(),
            series: None,
            num_steps: opts.num_steps(),
            maxt: opts.end_ms,
            step: opts.step_ms,
            select_range,
            offset,
            current_step: opts.start_ms,
            shard,
            num_shards,
            ext_range: config.is_extended_range_function(func_name),
            ext_lookback_delta: config.ext_lookback_delta_ms,
            failed: None,
        })
    }

    async fn load_series(&mut self, token: &CancellationToken) -> Result<()> {
        if self.series.is_some() {
            return Ok(());
        }
        let series = self
            .storage
            .get_series(token, self.shard, self.num_shards)
            .await?;

        // Extended-range functions need to search further into the past for
        // their seed sample.
        let mut buffer_range = self.select_range;
        if self.ext_range {
            buffer_range += self.ext_lookback_delta;
        }

        let mut scanners = Vec::with_capacity(series.len());
        let mut labels = Vec::with_capacity(series.len());
        for s in &series {
            // Storage may reuse the labels allocation between enumerations,
            // so mutate a copy.
            let mut lbls = s.labels().clone();
            if self.func_name != "last_over_time" {
                lbls.drop_metric_name();
            }
            lbls.sort();

            scanners.push(MatrixScanner {
                labels: lbls.clone(),
                signature: s.signature(),
                previous_points: Vec::new(),
                samples: BufferedIterator::new(s.sample_iter(), buffer_range),
            });
            labels.push(lbls);
        }
        self.scanners = scanners;
        self.series = Some(labels);
        self.pool.set_step_size(series.len());
        global_metrics().record_series_loaded("matrix_selector", series.len() as u64);
        Ok(())
    }
}

#[async_trait]
impl VectorOperator for MatrixSelector {
    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            format!(
                "[matrix_selector] {}({{{}}}[{}ms]) {} mod {}",
                self.func_name,
                format_matchers(self.storage.matchers()),
                self.select_range,
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

        let mut vectors = self.pool.get_vector_batch();
        let ts = self.current_step;
        for i in 0..self.scanners.len() {
            let mut series_ts = ts;
            let mut curr_step = 0;
            while curr_step < self.num_steps && series_ts <= self.maxt {
                if vectors.len() <= curr_step {
                    vectors.push(self.pool.get_step_vector(series_ts));
                }
                let scanner = &mut self.scanners[i];
                let maxt = series_ts - self.offset;
                let mint = maxt - self.select_range;

                let out = mem::take(&mut scanner.previous_points);
                let range_points = match select_points(
                    &mut scanner.samples,
                    mint,
                    maxt,
                    out,
                    self.ext_range,
                    self.ext_lookback_delta,
                ) {
                    Ok(points) => points,
                    Err(err) => {
                        self.failed = Some(err.clone());
                        return Err(err);
                    }
                };

                let result = (self.call)(&FunctionArgs {
                    labels: &scanner.labels,
                    points: &range_points,
                    step_time: series_ts,
                    select_range: self.select_range,
                    offset: self.offset,
                });
                match result {
                    Some(Value::Float(v)) => vectors[curr_step].append_sample(scanner.signature, v),
                    Some(Value::Histogram(h)) => {
                        vectors[curr_step].append_histogram(scanner.signature, h)
                    }
                    None => {}
                }

                scanner.previous_points = range_points;

                // Only buffer one step's worth of samples from the second
                // step on: the next window starts at mint + step.
                let step_range = self.select_range.min(self.step);
                scanner.samples.reduce_delta(step_range);

                series_ts += self.step;
                curr_step += 1;
            }
        }
        // For instant queries, force a positive step so the operator can
        // terminate.
        if self.step == 0 {
            self.step = 1;
        }
        self.current_step += self.step * self.num_steps as i64;

        global_metrics().record_operator_batch("matrix_selector", vectors.len() as u64);
        Ok(Some(vectors))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}

/// Populate the window `[mint, maxt]` for one series, reusing the points
/// gathered for an earlier step where the windows overlap.
///
/// `out` is the previous step's window. Points before the new window start
/// are dropped from its head; only points newer than the ones retained are
/// fetched from the iterator. For extended-range functions the head keeps
/// one sample from before the window start (within `ext_lookback_delta`) to
/// seed the function, and later pre-window samples replace that anchor in
/// place so that exactly the latest one survives.
fn select_points(
    it: &mut BufferedIterator,
    mut mint: i64,
    maxt: i64,
    mut out: Vec<Sample>,
    ext_range: bool,
    ext_lookback_delta: i64,
) -> Result<Vec<Sample>> {
    let ext_mint = mint - ext_lookback_delta;

    if matches!(out.last(), Some(last) if last.t >= mint) {
        // There is an overlap between the previous and current ranges:
        // retain the common points. The overlap is usually much larger than
        // the step, so a linear scan is as fast as a binary search.
        let mut drop = 0;
        if !ext_range {
            while drop < out.len() && out[drop].t < mint {
                drop += 1;
            }
            // Only fetch points newer than the last one retained.
            if let Some(last) = out.last() {
                mint = last.t + 1;
            }
        } else {
            // Go past the window start first, then step back one sample if
            // it is still within the extended lookback.
            while drop < out.len() && out[drop].t <= mint {
                drop += 1;
            }
            if drop > 0 && out[drop - 1].t >= ext_mint {
                drop -= 1;
            }
            if matches!(out.last(), Some(last) if last.t >= mint) {
                mint = out[out.len() - 1].t + 1;
            }
        }
        out.drain(..drop);
    } else {
        out.clear();
    }

    let sought = it.seek(maxt);
    if sought == ValueKind::None {
        if let Some(err) = it.error() {
            return Err(err);
        }
    }

    let mut appended_point_before_mint = !out.is_empty();
    for s in it.buffer() {
        match &s.value {
            // Histograms are preserved whenever they fall into the window;
            // there is no staleness filter for them.
            Value::Histogram(_) => {
                if s.t >= mint {
                    out.push(s.clone());
                }
            }
            Value::Float(v) => {
                if fmq_storage::is_stale_nan(*v) {
                    continue;
                }
                if !ext_range {
                    // Buffered values are guaranteed to be smaller than maxt.
                    if s.t >= mint {
                        out.push(s.clone());
                    }
                } else if s.t > mint || !appended_point_before_mint {
                    out.push(s.clone());
                    appended_point_before_mint = true;
                } else if let Some(last) = out.last_mut() {
                    // Keep replacing the pre-window anchor while still at or
                    // before the window start.
                    *last = s.clone();
                }
            }
        }
    }

    // The sought sample itself might sit exactly on the window end.
    if let Some(s) = it.at() {
        if s.t == maxt && !s.is_stale() {
            out.push(s.clone());
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmq_storage::SliceIterator;

    fn buffered(samples: Vec<Sample>, delta: i64) -> BufferedIterator {
        BufferedIterator::new(Box::new(SliceIterator::new(samples)), delta)
    }

    fn floats(ts: &[(i64, f64)]) -> Vec<Sample> {
        ts.iter().map(|&(t, v)| Sample::float(t, v)).collect()
    }

    fn times(points: &[Sample]) -> Vec<i64> {
        points.iter().map(|s| s.t).collect()
    }

    #[test]
    fn windows_overlap_with_buffered_reuse() {
        let samples = floats(&[(0, 1.0), (15, 1.0), (30, 1.0), (45, 1.0), (60, 1.0)]);
        let mut it = buffered(samples, 30);

        let w1 = select_points(&mut it, 0, 30, Vec::new(), false, 0).unwrap();
        assert_eq!(times(&w1), vec![0, 15, 30]);

        it.reduce_delta(15);
        let w2 = select_points(&mut it, 15, 45, w1, false, 0).unwrap();
        assert_eq!(times(&w2), vec![15, 30, 45]);

        it.reduce_delta(15);
        let w3 = select_points(&mut it, 30, 60, w2, false, 0).unwrap();
        assert_eq!(times(&w3), vec![30, 45, 60]);
    }

    #[test]
    fn buffered_reuse_matches_stateless_evaluation() {
        let samples = floats(&[
            (0, 1.0),
            (7, 2.0),
            (15, 3.0),
            (22, 4.0),
            (30, 5.0),
            (41, 6.0),
            (45, 7.0),
            (60, 8.0),
        ]);
        for (mint, maxt) in [(0, 30), (15, 45), (30, 60)] {
            let mut fresh = buffered(samples.clone(), 30);
            let stateless = select_points(&mut fresh, mint, maxt, Vec::new(), false, 0).unwrap();

            let expected: Vec<Sample> = samples
                .iter()
                .filter(|s| s.t >= mint && s.t <= maxt)
                .cloned()
                .collect();
            assert_eq!(stateless, expected, "window [{mint}, {maxt}]");
        }

        // Now the same windows with buffer reuse.
        let mut it = buffered(samples.clone(), 30);
        let mut out = Vec::new();
        for (mint, maxt) in [(0, 30), (15, 45), (30, 60)] {
            out = select_points(&mut it, mint, maxt, out, false, 0).unwrap();
            let expected: Vec<Sample> = samples
                .iter()
                .filter(|s| s.t >= mint && s.t <= maxt)
                .cloned()
                .collect();
            assert_eq!(out, expected, "reused window [{mint}, {maxt}]");
            it.reduce_delta(15);
        }
    }

    #[test]
    fn extended_range_keeps_one_anchor_before_window() {
        // Anchor 6m before the window end, next sample just inside.
        let minute = 60_000;
        let maxt = 10 * minute;
        let mint = maxt - 4 * minute;
        let samples = floats(&[(maxt - 6 * minute, 100.0), (mint + 1_000, 110.0)]);
        let mut it = buffered(samples, 4 * minute + 5 * minute);

        let out = select_points(&mut it, mint, maxt, Vec::new(), true, 5 * minute).unwrap();
        assert_eq!(times(&out), vec![maxt - 6 * minute, mint + 1_000]);
        assert_eq!(out[0].as_float(), Some(100.0));
    }

    #[test]
    fn extended_range_replaces_older_anchors() {
        let samples = floats(&[(5, 1.0), (8, 2.0), (10, 3.0), (25, 4.0)]);
        let mut it = buffered(samples, 20 + 10);
        // Window [10, 30]: samples 5, 8, 10 are all at or before mint; only
        // the latest of them survives as the anchor.
        let out = select_points(&mut it, 10, 30, Vec::new(), true, 10).unwrap();
        assert_eq!(times(&out), vec![10, 25]);
        assert_eq!(out[0].as_float(), Some(3.0));
    }

    #[test]
    fn stale_nan_is_filtered_from_windows() {
        let samples = vec![
            Sample::float(10, 1.0),
            Sample::float(20, fmq_storage::stale_nan()),
            Sample::float(30, 2.0),
        ];
        let mut it = buffered(samples, 30);
        let out = select_points(&mut it, 0, 30, Vec::new(), false, 0).unwrap();
        assert_eq!(times(&out), vec![10, 30]);

        // A stale sample exactly at the window end is excluded too.
        let samples = vec![
            Sample::float(10, 1.0),
            Sample::float(30, fmq_storage::stale_nan()),
        ];
        let mut it = buffered(samples, 30);
        let out = select_points(&mut it, 0, 30, Vec::new(), false, 0).unwrap();
        assert_eq!(times(&out), vec![10]);
    }
}
