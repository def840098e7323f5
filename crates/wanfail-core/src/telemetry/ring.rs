use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use wanfail_common::Sample;

/// Time-ordered samples of one link, oldest at the front.
#[derive(Debug, Default)]
pub struct SampleRing {
    buf: VecDeque<Sample>,
}

impl SampleRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Allocated slots, which is what the store's RAM budget counts.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn newest(&self) -> Option<&Sample> {
        self.buf.back()
    }

    pub fn oldest(&self) -> Option<&Sample> {
        self.buf.front()
    }

    pub fn accepts(&self, sample: &Sample) -> bool {
        self.buf
            .back()
            .is_none_or(|last| sample.timestamp >= last.timestamp)
    }

    /// Slots the next push allocates: none while there is spare room,
    /// otherwise a quarter of the current length.
    pub fn growth(&self) -> usize {
        if self.buf.len() < self.buf.capacity() {
            0
        } else {
            (self.buf.len() / 4).max(1)
        }
    }

    /// Appends `sample` unless it is older than the newest one held.
    /// Grows by exactly [`growth`](Self::growth) slots when full.
    pub fn push(&mut self, sample: Sample) -> bool {
        if !self.accepts(&sample) {
            return false;
        }
        let grow = self.growth();
        if grow > 0 {
            self.buf.reserve_exact(grow);
        }
        self.buf.push_back(sample);
        true
    }

    /// Releases spare capacity.
    pub fn shrink(&mut self) {
        self.buf.shrink_to_fit();
    }

    /// Drops samples older than `cutoff`. Returns how many went.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while self.buf.front().is_some_and(|s| s.timestamp < cutoff) {
            self.buf.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn pop_oldest(&mut self) -> bool {
        self.buf.pop_front().is_some()
    }

    /// Keeps every `stride`-th sample of the oldest half, counting from the
    /// oldest, which therefore always survives. Returns how many went.
    pub fn thin_oldest_half(&mut self, stride: usize) -> usize {
        let stride = stride.max(2);
        let half = self.buf.len() / 2;
        let before = self.buf.len();
        let mut idx = 0usize;
        self.buf.retain(|_| {
            let keep = idx >= half || idx % stride == 0;
            idx += 1;
            keep
        });
        before - self.buf.len()
    }

    /// Samples at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> impl DoubleEndedIterator<Item = &Sample> {
        let start = self.buf.partition_point(|s| s.timestamp < since);
        self.buf.range(start..)
    }
}
