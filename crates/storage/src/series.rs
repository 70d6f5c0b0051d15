//! Storage seams: queryable backends and resolved series handles.

use std::sync::Arc;

use async_trait::async_trait;
use fmq_common::Result;
use promql_parser::label::Matchers;
use tokio_util::sync::CancellationToken;

use crate::iterator::SampleIterator;
use crate::labels::Labels;

/// One stored series: its labels and the ability to open sample cursors.
///
/// Implementations may reuse the labels allocation between enumerations;
/// callers must clone before mutating.
pub trait StoredSeries: Send + Sync {
    fn labels(&self) -> &Labels;

    /// Open a fresh cursor over the series' samples.
    fn sample_iter(&self) -> Box<dyn SampleIterator>;
}

impl std::fmt::Debug for dyn StoredSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSeries")
            .field("labels", self.labels())
            .finish()
    }
}

/// A storage backend that resolves label matchers to stored series.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Return every series matching `matchers` that may carry samples within
    /// `[mint, maxt]`.
    async fn select(
        &self,
        token: &CancellationToken,
        mint: i64,
        maxt: i64,
        matchers: &Matchers,
    ) -> Result<Vec<Arc<dyn StoredSeries>>>;
}

/// A series resolved by a selector: copied labels plus a stable signature.
#[derive(Clone)]
pub struct SignedSeries {
    labels: Labels,
    signature: u64,
    series: Arc<dyn StoredSeries>,
}

impl SignedSeries {
    pub fn new(series: Arc<dyn StoredSeries>) -> Self {
        let labels = series.labels().clone();
        let signature = labels.signature();
        Self {
            labels,
            signature,
            series,
        }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Open a fresh cursor over the underlying series.
    pub fn sample_iter(&self) -> Box<dyn SampleIterator> {
        self.series.sample_iter()
    }
}

impl std::fmt::Debug for SignedSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedSeries")
            .field("labels", &self.labels)
            .field("signature", &self.signature)
            .finish()
    }
}
