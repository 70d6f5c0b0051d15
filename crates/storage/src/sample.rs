//! Sample values, float histograms, and the staleness sentinel.

/// Bit pattern of the NaN payload Prometheus-compatible scrapers emit to mark
/// a series as stale.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// The staleness marker value.
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Returns whether `v` carries the staleness payload. A regular NaN does not.
pub fn is_stale_nan(v: f64) -> bool {
    v.to_bits() == STALE_NAN_BITS
}

/// One bucket of a float histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
    /// Inclusive upper bound of the bucket.
    pub upper_bound: f64,
    /// Cumulative observation count at this bound.
    pub count: f64,
}

/// A float-valued histogram sample.
///
/// Integer histograms from the wire are materialized into this shape before
/// they reach operators, mirroring how chunk iterators expose
/// `AtFloatHistogram` regardless of the encoded kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FloatHistogram {
    pub count: f64,
    pub sum: f64,
    pub buckets: Vec<HistogramBucket>,
}

/// Payload of one sample: exactly one of float or histogram.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Histogram(FloatHistogram),
}

/// Kind of the sample under an iterator cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// The iterator is exhausted or not positioned.
    None,
    Float,
    Histogram,
}

/// One timestamped sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Unix milliseconds.
    pub t: i64,
    pub value: Value,
}

impl Sample {
    pub fn float(t: i64, v: f64) -> Self {
        Self {
            t,
            value: Value::Float(v),
        }
    }

    pub fn histogram(t: i64, h: FloatHistogram) -> Self {
        Self {
            t,
            value: Value::Histogram(h),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self.value {
            Value::Float(_) => ValueKind::Float,
            Value::Histogram(_) => ValueKind::Histogram,
        }
    }

    /// Float payload; `None` for histogram samples.
    pub fn as_float(&self) -> Option<f64> {
        match self.value {
            Value::Float(v) => Some(v),
            Value::Histogram(_) => None,
        }
    }

    /// Histogram payload; `None` for float samples.
    pub fn as_histogram(&self) -> Option<&FloatHistogram> {
        match &self.value {
            Value::Histogram(h) => Some(h),
            Value::Float(_) => None,
        }
    }

    /// Whether this is a float sample carrying the staleness marker.
    pub fn is_stale(&self) -> bool {
        matches!(self.value, Value::Float(v) if is_stale_nan(v))
    }
}
