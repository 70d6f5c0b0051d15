//! Series, label, and sample model plus the storage seams the FMQ engine
//! consumes.
//!
//! Architecture role:
//! - defines labels, signatures, samples, and the staleness sentinel
//! - provides sample cursors and the sliding back-window wrapper used by
//!   range evaluation
//! - resolves matchers to sharded series sets with cross-operator sharing
//!
//! Key modules:
//! - [`labels`]
//! - [`sample`]
//! - [`iterator`] / [`buffered`]
//! - [`series`] / [`selector`]
//! - [`memory`] (reference in-memory backend, also used by tests)

pub mod buffered;
pub mod iterator;
pub mod labels;
pub mod memory;
pub mod sample;
pub mod selector;
pub mod series;

pub use buffered::BufferedIterator;
pub use iterator::{SampleIterator, SliceIterator};
pub use labels::{Label, Labels, METRIC_NAME};
pub use memory::MemStorage;
pub use sample::{
    is_stale_nan, stale_nan, FloatHistogram, HistogramBucket, Sample, Value, ValueKind,
};
pub use selector::{format_matchers, selector_matchers, SelectorCache, SeriesSelector};
pub use series::{Queryable, SignedSeries, StoredSeries};
