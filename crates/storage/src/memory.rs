//! In-memory storage backend.
//!
//! Serves as the reference [`Queryable`] implementation and as the test
//! backend across the workspace. Series are matched with full PromQL
//! matcher semantics: an absent label matches as the empty string.

use std::sync::Arc;

use async_trait::async_trait;
use fmq_common::{FmqError, Result};
use promql_parser::label::{MatchOp, Matcher, Matchers};
use tokio_util::sync::CancellationToken;

use crate::iterator::{SampleIterator, SliceIterator};
use crate::labels::Labels;
use crate::sample::Sample;
use crate::series::{Queryable, StoredSeries};

struct MemSeries {
    labels: Labels,
    samples: Vec<Sample>,
}

impl StoredSeries for MemSeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn sample_iter(&self) -> Box<dyn SampleIterator> {
        Box::new(SliceIterator::new(self.samples.clone()))
    }
}

/// An immutable in-memory series set.
#[derive(Default)]
pub struct MemStorage {
    series: Vec<Arc<MemSeries>>,
    fail_with: Option<String>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one series. `samples` must be sorted by timestamp.
    pub fn with_series(mut self, labels: Labels, samples: Vec<Sample>) -> Self {
        self.series.push(Arc::new(MemSeries { labels, samples }));
        self
    }

    /// Make every `select` fail, for exercising storage error paths.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            series: Vec::new(),
            fail_with: Some(message.into()),
        }
    }
}

#[async_trait]
impl Queryable for MemStorage {
    async fn select(
        &self,
        token: &CancellationToken,
        _mint: i64,
        _maxt: i64,
        matchers: &Matchers,
    ) -> Result<Vec<Arc<dyn StoredSeries>>> {
        if token.is_cancelled() {
            return Err(FmqError::Cancelled);
        }
        if let Some(msg) = &self.fail_with {
            return Err(FmqError::Storage(msg.clone()));
        }
        Ok(self
            .series
            .iter()
            .filter(|s| matches_all(&s.labels, matchers))
            .map(|s| Arc::clone(s) as Arc<dyn StoredSeries>)
            .collect())
    }
}

fn matches_all(labels: &Labels, matchers: &Matchers) -> bool {
    matchers.matchers.iter().all(|m| matches_one(labels, m))
}

fn matches_one(labels: &Labels, matcher: &Matcher) -> bool {
    let value = labels.get(&matcher.name).unwrap_or("");
    match &matcher.op {
        MatchOp::Equal => value == matcher.value,
        MatchOp::NotEqual => value != matcher.value,
        MatchOp::Re(re) => re.is_match(value),
        MatchOp::NotRe(re) => !re.is_match(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> MemStorage {
        MemStorage::new()
            .with_series(
                Labels::from_pairs([("__name__", "up"), ("job", "api")]),
                vec![Sample::float(0, 1.0)],
            )
            .with_series(
                Labels::from_pairs([("__name__", "up"), ("job", "db")]),
                vec![Sample::float(0, 1.0)],
            )
            .with_series(
                Labels::from_pairs([("__name__", "errors_total"), ("job", "api")]),
                vec![Sample::float(0, 2.0)],
            )
    }

    fn selector(query: &str) -> Matchers {
        // Parse a vector selector to borrow the parser's matcher construction.
        match promql_parser::parser::parse(query).expect("valid selector") {
            promql_parser::parser::Expr::VectorSelector(vs) => {
                crate::selector::selector_matchers(vs.name.as_deref(), &vs.matchers)
            }
            other => panic!("expected vector selector, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn equality_and_regex_matching() {
        let storage = storage();
        let token = CancellationToken::new();

        let up = storage
            .select(&token, 0, 100, &selector("up"))
            .await
            .unwrap();
        assert_eq!(up.len(), 2);

        let api = storage
            .select(&token, 0, 100, &selector("up{job=\"api\"}"))
            .await
            .unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].labels().get("job"), Some("api"));

        let re = storage
            .select(&token, 0, 100, &selector("{job=~\"a.*\"}"))
            .await
            .unwrap();
        assert_eq!(re.len(), 2);

        let neg = storage
            .select(&token, 0, 100, &selector("up{job!=\"api\"}"))
            .await
            .unwrap();
        assert_eq!(neg.len(), 1);
        assert_eq!(neg[0].labels().get("job"), Some("db"));
    }

    #[tokio::test]
    async fn absent_label_matches_empty() {
        let storage = storage();
        let token = CancellationToken::new();
        let matched = storage
            .select(&token, 0, 100, &selector("up{cluster=\"\"}"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[tokio::test]
    async fn failing_storage_surfaces_error() {
        let storage = MemStorage::failing("backend down");
        let token = CancellationToken::new();
        let err = storage
            .select(&token, 0, 100, &selector("up"))
            .await
            .unwrap_err();
        assert!(matches!(err, FmqError::Storage(_)));
    }
}
