//! Lazy range over cold-store rows
//!
//! A `ChunkedRange` walks a cursor over the `timebatch` rows of one stream,
//! fetching and decoding one chunk at a time. Nothing is read until the
//! first `next`. The range can start at an absolute index (skipping the
//! in-chunk prefix by position) or at a timestamp (skipping by comparison,
//! with whole rows pruned through their stored timestamp bounds).

use crate::core::{decode, Datapoint, Result};
use crate::range::DataRange;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
enum Start {
    Index(i64),
    Time(i64),
}

/// Cursor-based range over the chunked table
pub struct ChunkedRange {
    pool: SqlitePool,
    key: String,
    start: Start,
    end_index: i64,
    end_time: i64,
    last_row_end: Option<i64>,
    buf: VecDeque<Datapoint>,
    next_index: i64,
    done: bool,
}

impl ChunkedRange {
    /// Range over absolute indices `[i1, i2)`
    pub(crate) fn by_index(pool: SqlitePool, key: String, i1: i64, i2: i64) -> Self {
        let i1 = i1.max(0);
        Self {
            pool,
            key,
            start: Start::Index(i1),
            end_index: i2,
            end_time: 0,
            last_row_end: None,
            buf: VecDeque::new(),
            next_index: i1,
            done: i1 >= i2,
        }
    }

    /// Range over timestamps `(t1, t2]`; `t2 == 0` is unbounded above
    pub(crate) fn by_time(pool: SqlitePool, key: String, t1: i64, t2: i64) -> Self {
        Self {
            pool,
            key,
            start: Start::Time(t1),
            end_index: i64::MAX,
            end_time: t2,
            last_row_end: None,
            buf: VecDeque::new(),
            next_index: 0,
            done: false,
        }
    }

    async fn fetch_next_row(&mut self) -> Result<()> {
        let row = match self.last_row_end {
            Some(prev) => {
                sqlx::query(
                    "SELECT end_index, start_ts, data FROM timebatch
                     WHERE key = ? AND end_index > ? ORDER BY end_index ASC LIMIT 1",
                )
                .bind(&self.key)
                .bind(prev)
                .fetch_optional(&self.pool)
                .await?
            }
            None => match self.start {
                Start::Index(i1) => {
                    sqlx::query(
                        "SELECT end_index, start_ts, data FROM timebatch
                         WHERE key = ? AND end_index > ? ORDER BY end_index ASC LIMIT 1",
                    )
                    .bind(&self.key)
                    .bind(i1)
                    .fetch_optional(&self.pool)
                    .await?
                }
                Start::Time(t1) => {
                    sqlx::query(
                        "SELECT end_index, start_ts, data FROM timebatch
                         WHERE key = ? AND end_ts > ? ORDER BY end_index ASC LIMIT 1",
                    )
                    .bind(&self.key)
                    .bind(t1)
                    .fetch_optional(&self.pool)
                    .await?
                }
            },
        };

        let Some(row) = row else {
            self.done = true;
            return Ok(());
        };

        let end_index: i64 = row.get("end_index");
        let start_ts: i64 = row.get("start_ts");
        if self.end_time > 0 && start_ts > self.end_time {
            self.done = true;
            return Ok(());
        }

        let chunk = decode(row.get::<Vec<u8>, _>("data").as_slice())?;
        let chunk_start = end_index - chunk.len() as i64;
        let mut points: VecDeque<Datapoint> = chunk.0.into();
        let mut idx = chunk_start;

        if self.last_row_end.is_none() {
            match self.start {
                Start::Index(i1) => {
                    while idx < i1 && points.pop_front().is_some() {
                        idx += 1;
                    }
                }
                Start::Time(t1) => {
                    while points.front().map_or(false, |dp| dp.timestamp <= t1) {
                        points.pop_front();
                        idx += 1;
                    }
                }
            }
        }

        self.next_index = idx;
        self.buf = points;
        self.last_row_end = Some(end_index);
        Ok(())
    }
}

#[async_trait]
impl DataRange for ChunkedRange {
    async fn init(&mut self) -> Result<()> {
        // Row fetches are lazy; there is nothing to prepare
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Datapoint>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.next_index >= self.end_index {
                self.done = true;
                return Ok(None);
            }
            if let Some(dp) = self.buf.pop_front() {
                if self.end_time > 0 && dp.timestamp > self.end_time {
                    self.done = true;
                    return Ok(None);
                }
                self.next_index += 1;
                return Ok(Some(dp));
            }
            self.fetch_next_row().await?;
        }
    }

    fn close(&mut self) {
        self.buf.clear();
        self.done = true;
    }
}
