//! Lazy, composable datapoint ranges
//!
//! Every read path in the engine produces a `DataRange`: a pull-based
//! iterator that decodes on demand. Ranges compose: a concatenation of a
//! cold chunked range and a hot in-memory range, narrowed by a time window
//! and a count limit, is itself a range. Wrappers never buffer: one `next`
//! on a composite produces at most one `next` on the source plus skips.
//!
//! `Ok(None)` signals end of sequence. `init` is idempotent; `close` is
//! idempotent and may be called before or after exhaustion.

use crate::core::{Datapoint, DatapointArray, Result};
use async_trait::async_trait;
use std::collections::VecDeque;

/// A pull-based range of datapoints
#[async_trait]
pub trait DataRange: Send {
    /// Prepare the range for iteration
    async fn init(&mut self) -> Result<()>;

    /// The next datapoint, or `Ok(None)` once the sequence is finished
    async fn next(&mut self) -> Result<Option<Datapoint>>;

    /// Release any held resources
    fn close(&mut self);
}

/// Drain a range into an array, closing it afterwards
pub async fn read_array(range: &mut dyn DataRange) -> Result<DatapointArray> {
    let mut out = DatapointArray::new();
    while let Some(dp) = range.next().await? {
        out.push(dp);
    }
    range.close();
    Ok(out)
}

/// The range equivalent of nothing: always already exhausted
#[derive(Debug, Default)]
pub struct EmptyRange;

#[async_trait]
impl DataRange for EmptyRange {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        Ok(None)
    }

    fn close(&mut self) {}
}

/// An in-memory range over a decoded array, tagged with the absolute index
/// of its first datapoint
#[derive(Debug)]
pub struct DatapointArrayRange {
    data: DatapointArray,
    pos: usize,
    start_index: i64,
}

impl DatapointArrayRange {
    /// Wrap an array whose first datapoint has absolute index `start_index`
    pub fn new(data: DatapointArray, start_index: i64) -> Self {
        Self {
            data,
            pos: 0,
            start_index,
        }
    }

    /// Absolute index of the first datapoint in the backing array
    pub fn start_index(&self) -> i64 {
        self.start_index
    }
}

#[async_trait]
impl DataRange for DatapointArrayRange {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let dp = self.data[self.pos].clone();
        self.pos += 1;
        Ok(Some(dp))
    }

    fn close(&mut self) {}
}

impl std::fmt::Debug for dyn DataRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn DataRange")
    }
}

/// An ordered list of ranges acting as one large range
///
/// Children are initialized lazily and closed as soon as they are
/// exhausted. Errors propagate immediately.
#[derive(Debug, Default)]
pub struct RangeList {
    ranges: VecDeque<Box<dyn DataRange>>,
}

impl RangeList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an uninitialized range to the end of the list
    pub fn append(&mut self, range: Box<dyn DataRange>) {
        self.ranges.push_back(range);
    }
}

#[async_trait]
impl DataRange for RangeList {
    async fn init(&mut self) -> Result<()> {
        match self.ranges.front_mut() {
            Some(first) => first.init().await,
            None => Ok(()),
        }
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        loop {
            let Some(front) = self.ranges.front_mut() else {
                return Ok(None);
            };
            if let Some(dp) = front.next().await? {
                return Ok(Some(dp));
            }
            // This child is spent: close it and move to the next one
            front.close();
            self.ranges.pop_front();
            if let Some(next) = self.ranges.front_mut() {
                next.init().await?;
            }
        }
    }

    fn close(&mut self) {
        for r in self.ranges.iter_mut() {
            r.close();
        }
        self.ranges.clear();
    }
}

/// A range narrowed to the time window `(start_time, end_time]`
///
/// Datapoints with `ts <= start_time` are skipped; the first datapoint with
/// `ts > end_time` terminates the range (when `end_time > 0`).
pub struct TimeWindowRange {
    inner: Box<dyn DataRange>,
    start_time: i64,
    end_time: i64,
}

impl TimeWindowRange {
    /// Wrap `inner` in the window `(start_time, end_time]`; `end_time == 0`
    /// leaves the range unbounded above
    pub fn new(inner: Box<dyn DataRange>, start_time: i64, end_time: i64) -> Self {
        Self {
            inner,
            start_time,
            end_time,
        }
    }
}

#[async_trait]
impl DataRange for TimeWindowRange {
    async fn init(&mut self) -> Result<()> {
        self.inner.init().await
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        loop {
            let Some(dp) = self.inner.next().await? else {
                return Ok(None);
            };
            if dp.timestamp <= self.start_time {
                continue;
            }
            if self.end_time > 0 && dp.timestamp > self.end_time {
                return Ok(None);
            }
            return Ok(Some(dp));
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// A range limited to the first `n` datapoints of its source
pub struct NumRange {
    inner: Box<dyn DataRange>,
    left: u64,
}

impl NumRange {
    /// Return at most `n` datapoints from `inner`
    pub fn new(inner: Box<dyn DataRange>, n: u64) -> Self {
        Self { inner, left: n }
    }

    /// Discard `n` datapoints from the source without counting them
    /// against the limit
    pub async fn skip(&mut self, n: u64) -> Result<()> {
        for _ in 0..n {
            if self.inner.next().await?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DataRange for NumRange {
    async fn init(&mut self) -> Result<()> {
        self.inner.init().await
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        if self.left == 0 {
            return Ok(None);
        }
        self.left -= 1;
        self.inner.next().await
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
