//! Buffered iteration with a sliding back-window.

use std::collections::VecDeque;

use fmq_common::FmqError;

use crate::iterator::SampleIterator;
use crate::sample::{Sample, ValueKind};

/// Wraps a [`SampleIterator`] and retains the samples scanned past during a
/// seek, bounded to a sliding window before the seek target.
///
/// After `seek(t)` the buffer holds every sample with timestamp in
/// `[t - delta, t)`, and the cursor holds the first sample with
/// timestamp `>= t` (the "sought" sample). Seeking is forward-only.
pub struct BufferedIterator {
    it: Box<dyn SampleIterator>,
    buf: VecDeque<Sample>,
    delta: i64,
    last_seek: i64,
    started: bool,
}

impl BufferedIterator {
    /// Retain `delta` milliseconds of samples behind each seek target.
    pub fn new(it: Box<dyn SampleIterator>, delta: i64) -> Self {
        Self {
            it,
            buf: VecDeque::new(),
            delta,
            last_seek: i64::MIN,
            started: false,
        }
    }

    /// Advance to the first sample with timestamp `>= ts`, buffering every
    /// sample scanned past. Returns the kind of the sought sample, or
    /// [`ValueKind::None`] when the stream is exhausted before `ts`.
    pub fn seek(&mut self, ts: i64) -> ValueKind {
        if !self.started {
            self.it.next_value();
            self.started = true;
        }
        loop {
            match self.it.at() {
                None => break,
                Some(s) if s.t >= ts => break,
                Some(s) => {
                    self.buf.push_back(s.clone());
                    self.it.next_value();
                }
            }
        }
        if ts > self.last_seek {
            self.last_seek = ts;
        }
        self.evict();
        match self.it.at() {
            Some(s) => s.kind(),
            None => ValueKind::None,
        }
    }

    /// The sought sample, if the last seek found one.
    pub fn at(&self) -> Option<&Sample> {
        self.it.at()
    }

    /// Iterate the retained back-window in ascending timestamp order.
    pub fn buffer(&self) -> impl Iterator<Item = &Sample> {
        self.buf.iter()
    }

    /// Shrink the retention window. Growing is rejected.
    pub fn reduce_delta(&mut self, delta: i64) -> bool {
        if delta > self.delta {
            return false;
        }
        self.delta = delta;
        self.evict();
        true
    }

    /// Sticky error from the underlying stream.
    pub fn error(&self) -> Option<FmqError> {
        self.it.error()
    }

    fn evict(&mut self) {
        if self.last_seek == i64::MIN {
            return;
        }
        let min_t = self.last_seek - self.delta;
        while matches!(self.buf.front(), Some(s) if s.t < min_t) {
            self.buf.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::SliceIterator;

    fn buffered(ts: &[i64], delta: i64) -> BufferedIterator {
        let samples = ts.iter().map(|&t| Sample::float(t, t as f64)).collect();
        BufferedIterator::new(Box::new(SliceIterator::new(samples)), delta)
    }

    #[test]
    fn buffer_holds_window_before_seek_target() {
        let mut it = buffered(&[0, 15, 30, 45, 60], 30);
        assert_eq!(it.seek(45), ValueKind::Float);
        assert_eq!(it.at().unwrap().t, 45);
        let buffered: Vec<i64> = it.buffer().map(|s| s.t).collect();
        assert_eq!(buffered, vec![15, 30]);
    }

    #[test]
    fn consecutive_seeks_keep_overlap() {
        let mut it = buffered(&[0, 15, 30, 45, 60], 30);
        it.seek(30);
        assert_eq!(it.buffer().map(|s| s.t).collect::<Vec<_>>(), vec![0, 15]);
        it.seek(60);
        assert_eq!(it.buffer().map(|s| s.t).collect::<Vec<_>>(), vec![30, 45]);
        assert_eq!(it.at().unwrap().t, 60);
    }

    #[test]
    fn seek_past_end_retains_tail_window() {
        let mut it = buffered(&[0, 15, 30], 30);
        assert_eq!(it.seek(60), ValueKind::None);
        assert!(it.at().is_none());
        assert_eq!(it.buffer().map(|s| s.t).collect::<Vec<_>>(), vec![30]);
    }

    #[test]
    fn reduce_delta_shrinks_only() {
        let mut it = buffered(&[0, 15, 30, 45, 60], 30);
        it.seek(45);
        assert!(!it.reduce_delta(60));
        assert!(it.reduce_delta(15));
        assert_eq!(it.buffer().map(|s| s.t).collect::<Vec<_>>(), vec![30]);
    }
}
