//! Shard-aware series selection with cross-operator sharing.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use fmq_common::{global_metrics, FmqError, Result};
use promql_parser::label::{MatchOp, Matchers};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::series::{Queryable, SignedSeries};

/// Resolves one matcher set against storage, memoizing the enumeration for
/// the life of the selector and serving shard-restricted views of it.
///
/// The enumeration runs at most once even under concurrent first pulls from
/// multiple operators; losers of the race observe the winner's series list
/// or its error.
pub struct SeriesSelector {
    storage: Arc<dyn Queryable>,
    matchers: Matchers,
    mint: i64,
    maxt: i64,
    once: OnceCell<Result<Arc<Vec<SignedSeries>>>>,
}

impl SeriesSelector {
    pub fn new(storage: Arc<dyn Queryable>, matchers: Matchers, mint: i64, maxt: i64) -> Self {
        Self {
            storage,
            matchers,
            mint,
            maxt,
            once: OnceCell::new(),
        }
    }

    /// The matcher set this selector resolves.
    pub fn matchers(&self) -> &Matchers {
        &self.matchers
    }

    /// All matching series, enumerated on first use.
    pub async fn series(&self, token: &CancellationToken) -> Result<Arc<Vec<SignedSeries>>> {
        self.once
            .get_or_init(|| async { self.load(token).await })
            .await
            .clone()
    }

    /// The shard `(shard, num_shards)` of the matching series: those with
    /// `signature % num_shards == shard`.
    pub async fn get_series(
        &self,
        token: &CancellationToken,
        shard: usize,
        num_shards: usize,
    ) -> Result<Vec<SignedSeries>> {
        let all = self.series(token).await?;
        if num_shards <= 1 {
            return Ok(all.as_ref().clone());
        }
        Ok(all
            .iter()
            .filter(|s| s.signature() % num_shards as u64 == shard as u64)
            .cloned()
            .collect())
    }

    async fn load(&self, token: &CancellationToken) -> Result<Arc<Vec<SignedSeries>>> {
        if token.is_cancelled() {
            return Err(FmqError::Cancelled);
        }
        let stored = self
            .storage
            .select(token, self.mint, self.maxt, &self.matchers)
            .await?;
        let series: Vec<SignedSeries> = stored.into_iter().map(SignedSeries::new).collect();
        debug!(matchers = %format_matchers(&self.matchers), count = series.len(), "series enumerated");
        Ok(Arc::new(series))
    }
}

/// Process-scoped selector cache keyed by matcher fingerprint, so operators
/// selecting the same matchers over the same time range share one storage
/// enumeration.
pub struct SelectorCache {
    storage: Arc<dyn Queryable>,
    selectors: Mutex<HashMap<u64, Arc<SeriesSelector>>>,
}

impl SelectorCache {
    pub fn new(storage: Arc<dyn Queryable>) -> Self {
        Self {
            storage,
            selectors: Mutex::new(HashMap::new()),
        }
    }

    /// The shared selector for `(matchers, mint, maxt)`, creating it on
    /// first use.
    pub fn selector(&self, matchers: &Matchers, mint: i64, maxt: i64) -> Arc<SeriesSelector> {
        let key = selector_fingerprint(matchers, mint, maxt);
        let mut selectors = self.selectors.lock().expect("selector cache poisoned");
        if let Some(existing) = selectors.get(&key) {
            global_metrics().record_selector_cache(true);
            return Arc::clone(existing);
        }
        global_metrics().record_selector_cache(false);
        let selector = Arc::new(SeriesSelector::new(
            Arc::clone(&self.storage),
            matchers.clone(),
            mint,
            maxt,
        ));
        selectors.insert(key, Arc::clone(&selector));
        selector
    }
}

fn selector_fingerprint(matchers: &Matchers, mint: i64, maxt: i64) -> u64 {
    let mut hasher = DefaultHasher::new();
    mint.hash(&mut hasher);
    maxt.hash(&mut hasher);
    for m in &matchers.matchers {
        m.name.hash(&mut hasher);
        m.value.hash(&mut hasher);
        match_op_tag(&m.op).hash(&mut hasher);
    }
    hasher.finish()
}

fn match_op_tag(op: &MatchOp) -> u8 {
    match op {
        MatchOp::Equal => 0,
        MatchOp::NotEqual => 1,
        MatchOp::Re(_) => 2,
        MatchOp::NotRe(_) => 3,
    }
}

/// Combine a selector's metric name and matcher list into one matcher set.
///
/// The parser keeps the bare metric name out of the matcher list; storage
/// backends only see matchers, so the name is folded in here unless an
/// explicit `__name__` matcher is already present.
pub fn selector_matchers(name: Option<&str>, matchers: &Matchers) -> Matchers {
    let mut combined = matchers.clone();
    if let Some(name) = name {
        let has_name = combined
            .matchers
            .iter()
            .any(|m| m.name == crate::labels::METRIC_NAME);
        if !has_name {
            combined.matchers.push(promql_parser::label::Matcher {
                op: MatchOp::Equal,
                name: crate::labels::METRIC_NAME.to_string(),
                value: name.to_string(),
            });
        }
    }
    combined
}

/// Render matchers in selector syntax for logs and explain output.
pub fn format_matchers(matchers: &Matchers) -> String {
    let parts: Vec<String> = matchers
        .matchers
        .iter()
        .map(|m| {
            let op = match m.op {
                MatchOp::Equal => "=",
                MatchOp::NotEqual => "!=",
                MatchOp::Re(_) => "=~",
                MatchOp::NotRe(_) => "!~",
            };
            format!("{}{}\"{}\"", m.name, op, m.value)
        })
        .collect();
    parts.join(", ")
}
