//! Time-ordered per-series sample iteration.

use fmq_common::FmqError;

use crate::sample::{Sample, ValueKind};

/// A cursor over one series' samples in ascending timestamp order.
///
/// The cursor starts unpositioned; the first [`next_value`] or [`seek`]
/// positions it. After exhaustion both keep returning [`ValueKind::None`].
///
/// [`next_value`]: SampleIterator::next_value
/// [`seek`]: SampleIterator::seek
pub trait SampleIterator: Send {
    /// Advance the cursor one sample; returns the kind now under the cursor.
    fn next_value(&mut self) -> ValueKind;

    /// The sample under the cursor, or `None` when unpositioned/exhausted.
    fn at(&self) -> Option<&Sample>;

    /// Advance the cursor to the first sample with timestamp `>= ts`.
    ///
    /// Seeking is forward-only; a target before the cursor leaves it in
    /// place.
    fn seek(&mut self, ts: i64) -> ValueKind {
        loop {
            match self.at() {
                Some(s) if s.t >= ts => return s.kind(),
                _ => {
                    if self.next_value() == ValueKind::None {
                        return ValueKind::None;
                    }
                }
            }
        }
    }

    /// Sticky error raised by the underlying sample stream, if any.
    fn error(&self) -> Option<FmqError> {
        None
    }
}

/// Iterator over an owned, time-sorted sample vector.
pub struct SliceIterator {
    samples: Vec<Sample>,
    pos: usize,
    started: bool,
}

impl SliceIterator {
    /// `samples` must already be sorted by timestamp.
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            pos: 0,
            started: false,
        }
    }
}

impl SampleIterator for SliceIterator {
    fn next_value(&mut self) -> ValueKind {
        if !self.started {
            self.started = true;
        } else if self.pos < self.samples.len() {
            self.pos += 1;
        }
        match self.at() {
            Some(s) => s.kind(),
            None => ValueKind::None,
        }
    }

    fn at(&self) -> Option<&Sample> {
        if !self.started {
            return None;
        }
        self.samples.get(self.pos)
    }
}
