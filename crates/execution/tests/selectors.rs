//! End-to-end selector scenarios over the in-memory backend.

use std::sync::Arc;

use fmq_common::{EngineConfig, FmqError, QueryOptions};
use fmq_execution::{MatrixSelector, VectorOperator, VectorPool, VectorSelector};
use fmq_storage::{
    selector_matchers, stale_nan, Labels, MemStorage, Sample, SeriesSelector, METRIC_NAME,
};
use tokio_util::sync::CancellationToken;

fn selector_for(storage: MemStorage, query: &str, mint: i64, maxt: i64) -> Arc<SeriesSelector> {
    let matchers = match promql_parser::parser::parse(query).expect("valid selector") {
        promql_parser::parser::Expr::VectorSelector(vs) => {
            selector_matchers(vs.name.as_deref(), &vs.matchers)
        }
        other => panic!("expected vector selector, got {other:?}"),
    };
    Arc::new(SeriesSelector::new(Arc::new(storage), matchers, mint, maxt))
}

fn range_opts(start: i64, end: i64, step: i64) -> QueryOptions {
    QueryOptions {
        start_ms: start,
        end_ms: end,
        step_ms: step,
        lookback_delta_ms: 5 * 60 * 1000,
        steps_per_batch: 10,
    }
}

#[tokio::test]
async fn instant_vector_with_lookback() {
    let storage = MemStorage::new().with_series(
        Labels::from_pairs([(METRIC_NAME, "up"), ("i", "1")]),
        vec![Sample::float(0, 1.0), Sample::float(15_000, 1.0)],
    );
    let selector = selector_for(storage, "up", 0, 30_000);
    let opts = QueryOptions::instant(30_000, 30_000, 10);
    let mut op = VectorSelector::new(VectorPool::new(10), selector, &opts, 0, 1);
    let token = CancellationToken::new();

    let batch = op.next(&token).await.unwrap().expect("one batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].t, 30_000);
    assert_eq!(batch[0].samples, vec![1.0]);
    assert_eq!(batch[0].sample_ids.len(), 1);

    assert!(op.next(&token).await.unwrap().is_none());
}

#[tokio::test]
async fn step_timestamps_form_the_exact_grid() {
    let samples: Vec<Sample> = (0..=4).map(|i| Sample::float(i * 15_000, 1.0)).collect();
    let storage = MemStorage::new().with_series(
        Labels::from_pairs([(METRIC_NAME, "up"), ("i", "1")]),
        samples,
    );
    let selector = selector_for(storage, "up", 0, 60_000);
    let opts = range_opts(0, 60_000, 15_000);
    let mut op = VectorSelector::new(VectorPool::new(10), selector, &opts, 0, 1);
    let token = CancellationToken::new();

    let mut timestamps = Vec::new();
    while let Some(batch) = op.next(&token).await.unwrap() {
        timestamps.extend(batch.iter().map(|v| v.t));
    }
    assert_eq!(timestamps, vec![0, 15_000, 30_000, 45_000, 60_000]);
}

#[tokio::test]
async fn steps_finer_than_sample_spacing_never_see_future_samples() {
    // Samples every 15s but steps every 5s, so several evaluation steps
    // fall inside each inter-sample gap. Every step must see the latest
    // sample at or before its own timestamp, never a later one.
    let storage = MemStorage::new().with_series(
        Labels::from_pairs([(METRIC_NAME, "up"), ("i", "1")]),
        vec![
            Sample::float(0, 1.0),
            Sample::float(15_000, 2.0),
            Sample::float(30_000, 3.0),
        ],
    );
    let selector = selector_for(storage, "up", 0, 30_000);
    let opts = range_opts(0, 30_000, 5_000);
    let mut op = VectorSelector::new(VectorPool::new(10), selector, &opts, 0, 1);
    let token = CancellationToken::new();

    let mut values = Vec::new();
    while let Some(batch) = op.next(&token).await.unwrap() {
        for v in &batch {
            assert_eq!(v.samples.len(), 1, "one series expected at t={}", v.t);
            values.push((v.t, v.samples[0]));
        }
    }
    assert_eq!(
        values,
        vec![
            (0, 1.0),
            (5_000, 1.0),
            (10_000, 1.0),
            (15_000, 2.0),
            (20_000, 2.0),
            (25_000, 2.0),
            (30_000, 3.0),
        ]
    );
}

#[tokio::test]
async fn lookback_is_bounded_and_stale_markers_hide_series() {
    let storage = MemStorage::new()
        .with_series(
            Labels::from_pairs([(METRIC_NAME, "up"), ("i", "old")]),
            vec![Sample::float(0, 1.0)],
        )
        .with_series(
            Labels::from_pairs([(METRIC_NAME, "up"), ("i", "stale")]),
            vec![Sample::float(29_000, stale_nan())],
        );
    let selector = selector_for(storage, "up", 0, 30_000);
    // Lookback of 10s: the sample at t=0 is too old at t=30s, and the stale
    // marker never surfaces.
    let opts = QueryOptions::instant(30_000, 10_000, 10);
    let mut op = VectorSelector::new(VectorPool::new(10), selector, &opts, 0, 1);
    let token = CancellationToken::new();

    let batch = op.next(&token).await.unwrap().expect("one batch");
    assert_eq!(batch.len(), 1);
    assert!(batch[0].is_empty());
}

#[tokio::test]
async fn matrix_windows_overlap_across_steps() {
    // Samples every 15s valued by their second offset; sum_over_time makes
    // the window contents observable per step.
    let samples: Vec<Sample> = (0..=4)
        .map(|i| Sample::float(i * 15_000, (i * 15) as f64))
        .collect();
    let storage = MemStorage::new().with_series(
        Labels::from_pairs([(METRIC_NAME, "x"), ("job", "api")]),
        samples,
    );
    let selector = selector_for(storage, "x", 0, 60_000);
    let opts = range_opts(30_000, 60_000, 15_000);
    let mut op = MatrixSelector::new(
        VectorPool::new(10),
        selector,
        "sum_over_time",
        &opts,
        &EngineConfig::default(),
        30_000,
        0,
        0,
        1,
    )
    .unwrap();
    let token = CancellationToken::new();

    let batch = op.next(&token).await.unwrap().expect("one batch");
    let sums: Vec<(i64, f64)> = batch.iter().map(|v| (v.t, v.samples[0])).collect();
    assert_eq!(
        sums,
        vec![(30_000, 45.0), (45_000, 90.0), (60_000, 135.0)],
        "windows [0,30] [15,45] [30,60] summed"
    );
    assert!(op.next(&token).await.unwrap().is_none());
}

#[tokio::test]
async fn matrix_drops_metric_name_except_last_over_time() {
    let storage = || {
        MemStorage::new().with_series(
            Labels::from_pairs([(METRIC_NAME, "x"), ("job", "api")]),
            vec![Sample::float(0, 1.0)],
        )
    };
    let opts = QueryOptions::instant(60_000, 300_000, 10);
    let token = CancellationToken::new();

    let mut rate_op = MatrixSelector::new(
        VectorPool::new(10),
        selector_for(storage(), "x", 0, 60_000),
        "rate",
        &opts,
        &EngineConfig::default(),
        60_000,
        0,
        0,
        1,
    )
    .unwrap();
    let series = rate_op.series(&token).await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].get(METRIC_NAME), None);
    assert_eq!(series[0].get("job"), Some("api"));

    let mut last_op = MatrixSelector::new(
        VectorPool::new(10),
        selector_for(storage(), "x", 0, 60_000),
        "last_over_time",
        &opts,
        &EngineConfig::default(),
        60_000,
        0,
        0,
        1,
    )
    .unwrap();
    let series = last_op.series(&token).await.unwrap();
    assert_eq!(series[0].get(METRIC_NAME), Some("x"));
}

#[tokio::test]
async fn matrix_rate_over_counter() {
    // A steady 1/s counter sampled every 15s over a fully covered window.
    let samples: Vec<Sample> = (0..=8)
        .map(|i| Sample::float(i * 15_000, (i * 15) as f64))
        .collect();
    let storage = MemStorage::new().with_series(
        Labels::from_pairs([(METRIC_NAME, "reqs_total"), ("job", "api")]),
        samples,
    );
    let selector = selector_for(storage, "reqs_total", 0, 120_000);
    let opts = range_opts(60_000, 120_000, 30_000);
    let mut op = MatrixSelector::new(
        VectorPool::new(10),
        selector,
        "rate",
        &opts,
        &EngineConfig::default(),
        60_000,
        0,
        0,
        1,
    )
    .unwrap();
    let token = CancellationToken::new();

    let batch = op.next(&token).await.unwrap().expect("one batch");
    assert_eq!(batch.len(), 3);
    for v in &batch {
        assert_eq!(v.samples.len(), 1, "step {}", v.t);
        assert!(
            (v.samples[0] - 1.0).abs() < 1e-9,
            "rate at {} was {}",
            v.t,
            v.samples[0]
        );
    }
}

#[tokio::test]
async fn cancellation_latches_all_pulls() {
    let storage = MemStorage::new().with_series(
        Labels::from_pairs([(METRIC_NAME, "up")]),
        vec![Sample::float(0, 1.0)],
    );
    let selector = selector_for(storage, "up", 0, 30_000);
    let opts = QueryOptions::instant(30_000, 30_000, 10);
    let mut op = VectorSelector::new(VectorPool::new(10), selector, &opts, 0, 1);

    let token = CancellationToken::new();
    token.cancel();
    assert_eq!(op.next(&token).await.unwrap_err(), FmqError::Cancelled);
    assert_eq!(op.next(&token).await.unwrap_err(), FmqError::Cancelled);
}

#[tokio::test]
async fn storage_errors_are_terminal() {
    let selector = selector_for(MemStorage::failing("backend down"), "up", 0, 30_000);
    let opts = QueryOptions::instant(30_000, 30_000, 10);
    let mut op = VectorSelector::new(VectorPool::new(10), selector, &opts, 0, 1);
    let token = CancellationToken::new();

    let first = op.next(&token).await.unwrap_err();
    assert!(matches!(first, FmqError::Storage(_)));
    let second = op.next(&token).await.unwrap_err();
    assert_eq!(first, second);
}
