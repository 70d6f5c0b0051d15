//! Range functions applied by the matrix selector.
//!
//! Each function collapses one series' window of points into at most one
//! sample. Returning `None` means "no sample for this series at this step",
//! which is an empty result, not an error.

use fmq_common::{FmqError, Result};
use fmq_storage::{Labels, Sample, Value};

/// The window handed to a range function for one series at one step.
pub struct FunctionArgs<'a> {
    pub labels: &'a Labels,
    /// Points inside the window, ascending by timestamp. Extended-range
    /// functions may see one leading point from before the window start.
    pub points: &'a [Sample],
    /// Evaluation timestamp of the step.
    pub step_time: i64,
    /// Window length in milliseconds.
    pub select_range: i64,
    /// Selector offset in milliseconds.
    pub offset: i64,
}

/// A range function: window in, at most one value out.
pub type RangeFunctionCall = fn(&FunctionArgs<'_>) -> Option<Value>;

/// Resolve a range function by name.
pub fn new_range_function(name: &str) -> Result<RangeFunctionCall> {
    Ok(match name {
        "rate" => rate,
        "increase" => increase,
        "delta" => delta,
        "irate" => irate,
        "idelta" => idelta,
        "sum_over_time" => sum_over_time,
        "avg_over_time" => avg_over_time,
        "min_over_time" => min_over_time,
        "max_over_time" => max_over_time,
        "count_over_time" => count_over_time,
        "last_over_time" => last_over_time,
        "present_over_time" => present_over_time,
        other => {
            return Err(FmqError::Planning(format!(
                "unknown range function: {other}"
            )))
        }
    })
}

fn float_points(points: &[Sample]) -> impl Iterator<Item = (i64, f64)> + '_ {
    points.iter().filter_map(|s| s.as_float().map(|v| (s.t, v)))
}

fn rate(args: &FunctionArgs<'_>) -> Option<Value> {
    extrapolated_rate(args, true, true)
}

fn increase(args: &FunctionArgs<'_>) -> Option<Value> {
    extrapolated_rate(args, true, false)
}

fn delta(args: &FunctionArgs<'_>) -> Option<Value> {
    extrapolated_rate(args, false, false)
}

/// Rate/increase/delta with extrapolation to the window edges, following the
/// reference PromQL semantics: the sampled interval is extended toward each
/// edge unless the gap exceeds 1.1x the average sample spacing, and counters
/// are additionally clamped so the extrapolated start never dips below zero.
fn extrapolated_rate(args: &FunctionArgs<'_>, is_counter: bool, is_rate: bool) -> Option<Value> {
    let pts: Vec<(i64, f64)> = float_points(args.points).collect();
    if pts.len() < 2 {
        return None;
    }
    let range_start = args.step_time - args.offset - args.select_range;
    let range_end = args.step_time - args.offset;

    let (first_t, first_v) = pts[0];
    let (last_t, last_v) = pts[pts.len() - 1];

    let mut result = last_v - first_v;
    if is_counter {
        let mut prev = first_v;
        for &(_, v) in &pts[1..] {
            if v < prev {
                result += prev;
            }
            prev = v;
        }
    }

    let mut duration_to_start = (first_t - range_start) as f64 / 1000.0;
    let mut duration_to_end = (range_end - last_t) as f64 / 1000.0;
    let sampled_interval = (last_t - first_t) as f64 / 1000.0;
    if sampled_interval <= 0.0 {
        return None;
    }
    let avg_duration_between_samples = sampled_interval / (pts.len() - 1) as f64;

    if is_counter && result > 0.0 && first_v >= 0.0 {
        let duration_to_zero = sampled_interval * (first_v / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let extrapolation_threshold = avg_duration_between_samples * 1.1;
    if duration_to_start >= extrapolation_threshold {
        duration_to_start = avg_duration_between_samples / 2.0;
    }
    if duration_to_end >= extrapolation_threshold {
        duration_to_end = avg_duration_between_samples / 2.0;
    }
    let extrapolate_to_interval = sampled_interval + duration_to_start + duration_to_end;

    let mut factor = extrapolate_to_interval / sampled_interval;
    if is_rate {
        factor /= args.select_range as f64 / 1000.0;
    }
    Some(Value::Float(result * factor))
}

fn irate(args: &FunctionArgs<'_>) -> Option<Value> {
    instant_delta(args, true)
}

fn idelta(args: &FunctionArgs<'_>) -> Option<Value> {
    instant_delta(args, false)
}

fn instant_delta(args: &FunctionArgs<'_>, is_rate: bool) -> Option<Value> {
    let pts: Vec<(i64, f64)> = float_points(args.points).collect();
    if pts.len() < 2 {
        return None;
    }
    let (prev_t, prev_v) = pts[pts.len() - 2];
    let (last_t, last_v) = pts[pts.len() - 1];
    if last_t == prev_t {
        return None;
    }
    let mut value = last_v - prev_v;
    if is_rate {
        if last_v < prev_v {
            // Counter reset.
            value = last_v;
        }
        value /= (last_t - prev_t) as f64 / 1000.0;
    }
    Some(Value::Float(value))
}

fn sum_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    aggregate_floats(args, |values| {
        let (sum, c) = values.fold((0.0f64, 0.0f64), |(sum, c), v| kahan_add(sum, c, v));
        if sum.is_infinite() {
            sum
        } else {
            sum + c
        }
    })
}

fn avg_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    let mut count = 0usize;
    let result = aggregate_floats(args, |values| {
        let (sum, c) = values.fold((0.0f64, 0.0f64), |(sum, c), v| {
            count += 1;
            kahan_add(sum, c, v)
        });
        sum + c
    });
    match result {
        Some(Value::Float(sum)) => Some(Value::Float(sum / count as f64)),
        other => other,
    }
}

// Prometheus does not use plain f64::min/max here: a leading NaN must be
// replaced by the first real number, while an all-NaN window stays NaN.
fn min_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    aggregate_floats(args, |mut values| {
        let mut min = values.next().unwrap_or(f64::NAN);
        for v in values {
            if v < min || min.is_nan() {
                min = v;
            }
        }
        min
    })
}

fn max_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    aggregate_floats(args, |mut values| {
        let mut max = values.next().unwrap_or(f64::NAN);
        for v in values {
            if v > max || max.is_nan() {
                max = v;
            }
        }
        max
    })
}

fn count_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    if args.points.is_empty() {
        return None;
    }
    Some(Value::Float(args.points.len() as f64))
}

fn last_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    args.points.last().map(|s| s.value.clone())
}

fn present_over_time(args: &FunctionArgs<'_>) -> Option<Value> {
    if args.points.is_empty() {
        return None;
    }
    Some(Value::Float(1.0))
}

fn aggregate_floats(
    args: &FunctionArgs<'_>,
    agg: impl FnOnce(&mut dyn Iterator<Item = f64>) -> f64,
) -> Option<Value> {
    let mut any = false;
    let mut values = float_points(args.points).map(|(_, v)| {
        any = true;
        v
    });
    // Drive lazily through the aggregator, then check whether anything flowed.
    let result = agg(&mut values);
    if !any {
        return None;
    }
    Some(Value::Float(result))
}

fn kahan_add(sum: f64, c: f64, v: f64) -> (f64, f64) {
    let t = sum + v;
    let c = if sum.abs() >= v.abs() {
        c + ((sum - t) + v)
    } else {
        c + ((v - t) + sum)
    };
    (t, c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmq_storage::FloatHistogram;

    fn args<'a>(points: &'a [Sample], step_time: i64, range: i64) -> FunctionArgs<'a> {
        static NO_LABELS: Labels = Labels::empty();
        FunctionArgs {
            labels: &NO_LABELS,
            points,
            step_time,
            select_range: range,
            offset: 0,
        }
    }

    #[test]
    fn rate_of_perfectly_aligned_counter() {
        // One sample every 15s over [0, 60s], increasing by 15 each time:
        // a steady 1/s counter fully covering the window.
        let points: Vec<Sample> = (0..=4)
            .map(|i| Sample::float(i * 15_000, (i * 15) as f64))
            .collect();
        let a = args(&points, 60_000, 60_000);
        match rate(&a) {
            Some(Value::Float(v)) => assert!((v - 1.0).abs() < 1e-9, "rate was {v}"),
            other => panic!("expected float rate, got {other:?}"),
        }
    }

    #[test]
    fn rate_handles_counter_reset() {
        let points = vec![
            Sample::float(0, 10.0),
            Sample::float(30_000, 20.0),
            Sample::float(60_000, 5.0),
        ];
        let a = args(&points, 60_000, 60_000);
        match rate(&a) {
            // Reset at t=60s: total increase is (20-10) + 5 = 15.
            Some(Value::Float(v)) => assert!(v > 0.0),
            other => panic!("expected float rate, got {other:?}"),
        }
    }

    #[test]
    fn rate_needs_two_points() {
        let points = vec![Sample::float(0, 10.0)];
        assert!(rate(&args(&points, 60_000, 60_000)).is_none());
        assert!(rate(&args(&[], 60_000, 60_000)).is_none());
    }

    #[test]
    fn delta_is_not_counter_corrected() {
        let points = vec![Sample::float(0, 10.0), Sample::float(60_000, 4.0)];
        let a = args(&points, 60_000, 60_000);
        match delta(&a) {
            Some(Value::Float(v)) => assert!(v < 0.0),
            other => panic!("expected float delta, got {other:?}"),
        }
    }

    #[test]
    fn irate_uses_last_two_points() {
        let points = vec![
            Sample::float(0, 0.0),
            Sample::float(30_000, 30.0),
            Sample::float(60_000, 90.0),
        ];
        match irate(&args(&points, 60_000, 60_000)) {
            Some(Value::Float(v)) => assert!((v - 2.0).abs() < 1e-9),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn over_time_family() {
        let points = vec![
            Sample::float(0, 1.0),
            Sample::float(10, 3.0),
            Sample::float(20, 2.0),
        ];
        let a = args(&points, 20, 20);
        assert_eq!(sum_over_time(&a), Some(Value::Float(6.0)));
        assert_eq!(avg_over_time(&a), Some(Value::Float(2.0)));
        assert_eq!(min_over_time(&a), Some(Value::Float(1.0)));
        assert_eq!(max_over_time(&a), Some(Value::Float(3.0)));
        assert_eq!(count_over_time(&a), Some(Value::Float(3.0)));
        assert_eq!(present_over_time(&a), Some(Value::Float(1.0)));
        assert_eq!(last_over_time(&a), Some(Value::Float(2.0)));
    }

    #[test]
    fn min_replaces_leading_nan() {
        let points = vec![Sample::float(0, f64::NAN), Sample::float(10, 5.0)];
        let a = args(&points, 10, 10);
        assert_eq!(min_over_time(&a), Some(Value::Float(5.0)));
        assert_eq!(max_over_time(&a), Some(Value::Float(5.0)));
    }

    #[test]
    fn last_over_time_passes_histograms_through() {
        let h = FloatHistogram {
            count: 2.0,
            sum: 10.0,
            buckets: vec![],
        };
        let points = vec![Sample::float(0, 1.0), Sample::histogram(10, h.clone())];
        let a = args(&points, 10, 10);
        assert_eq!(last_over_time(&a), Some(Value::Histogram(h)));
    }

    #[test]
    fn unknown_function_is_planning_error() {
        assert!(new_range_function("resets_per_minute").is_err());
        assert!(new_range_function("rate").is_ok());
    }
}
