//! Unified hot/cold engine
//!
//! The engine presents one logical append log per stream while routing
//! storage between the Redis hot cache and the SQL cold store. Writes go
//! to the cache, which cuts full batches onto a writer queue; the migrator
//! (see [`migrator`]) drains that queue into the cold store. Reads stitch
//! a cold chunked range and a hot tail range into one lazy iterator.
//!
//! Each public operation runs under the configured deadline; expiry
//! surfaces as [`Error::Cancelled`]. Admin operations fan out to the cold
//! store first and the hot cache second, so a crash in between never
//! leaves a hot tail without its cold prefix.

use crate::cache::HotCache;
use crate::config::EngineConfig;
use crate::core::{DatapointArray, Error, Result, StreamPath};
use crate::notify::Notifier;
use crate::range::{DataRange, DatapointArrayRange, NumRange, RangeList, TimeWindowRange};
use crate::store::ColdStore;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub mod migrator;

pub use migrator::{Migrator, MigratorStats};

/// Normalize `[i1, i2)` against a stream length: negative indices count
/// from the tail, `i2 == 0` means "to end", and an end past the stream
/// clamps. Returns [`Error::User`] when the window is inverted or the
/// start lies outside the stream.
pub(crate) fn normalize_range(i1: i64, i2: i64, total: i64) -> Result<(i64, i64)> {
    let mut a = i1;
    if a < 0 {
        a += total;
    }
    let mut b = i2;
    if b <= 0 {
        b += total;
    }
    if b > total {
        b = total;
    }
    if a < 0 || a > total || b < a {
        return Err(Error::User(format!(
            "invalid range [{i1}, {i2}) for stream of length {total}"
        )));
    }
    Ok((a, b))
}

/// Hot tail of a composite range; the cache read happens on first `next`
/// so construction stays cheap and the data reflects iteration time
struct HotTailRange {
    cache: HotCache,
    path: StreamPath,
    i1: i64,
    i2: i64,
    inner: Option<DatapointArrayRange>,
}

#[async_trait]
impl DataRange for HotTailRange {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<crate::core::Datapoint>> {
        if self.inner.is_none() {
            let (start, _, data) = self.cache.range(&self.path, self.i1, self.i2).await?;
            self.inner = Some(DatapointArrayRange::new(data, start));
        }
        match self.inner.as_mut() {
            Some(inner) => inner.next().await,
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

/// The unified time-series engine
#[derive(Clone)]
pub struct Engine {
    hot: HotCache,
    cold: ColdStore,
    notifier: Option<Notifier>,
    op_timeout: Duration,
    batch_wait: Duration,
}

impl Engine {
    /// Connect every backend named in the configuration
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        let hot = HotCache::connect(&config.redis_url, config.batch_size).await?;
        let cold = ColdStore::connect(&config.cold_store).await?;
        let notifier = if config.enable_notifier {
            Some(Notifier::connect(&config.redis_url).await?)
        } else {
            None
        };
        Ok(Self::assemble(hot, cold, notifier, config))
    }

    /// Build an engine from already-connected backends
    pub fn assemble(
        hot: HotCache,
        cold: ColdStore,
        notifier: Option<Notifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            hot,
            cold,
            notifier,
            op_timeout: config.op_timeout,
            batch_wait: config.batch_wait,
        }
    }

    /// The hot cache
    pub fn hot(&self) -> &HotCache {
        &self.hot
    }

    /// The cold store
    pub fn cold(&self) -> &ColdStore {
        &self.cold
    }

    /// The notifier, when enabled
    pub fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    pub(crate) fn batch_wait(&self) -> Duration {
        self.batch_wait
    }

    /// Run a backend future under the engine deadline
    async fn deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Insert datapoints into a stream
    ///
    /// The array must be internally ordered by timestamp
    /// ([`Error::UnorderedBatch`] otherwise). Against the stream itself the
    /// batch must start after `lastTs`: an equal or older first timestamp
    /// is [`Error::Ordering`] unless `restamp` repairs it (equal
    /// timestamps inside one array are fine). On success the batch is
    /// published to live subscribers best-effort.
    pub async fn insert(
        &self,
        writer_id: &str,
        path: &StreamPath,
        points: &DatapointArray,
        restamp: bool,
    ) -> Result<i64> {
        if !points.is_ordered() {
            return Err(Error::UnorderedBatch);
        }

        let len = self
            .deadline(self.hot.insert_after(writer_id, path, points, restamp))
            .await?;

        if !points.is_empty() {
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.publish(&path.routing_key(), points).await {
                    warn!(stream = %path, error = %e, "notification dropped");
                }
            }
        }
        Ok(len)
    }

    /// Total stream length. An unknown stream has length 0.
    pub async fn length(&self, path: &StreamPath) -> Result<i64> {
        self.deadline(self.hot.length(path)).await
    }

    /// Compose a lazy range over `[i1, i2)`
    ///
    /// Indices follow the normalization contract of [`normalize_range`].
    /// Returns the effective `(start, end)` window alongside the iterator;
    /// a window reaching into data lost to a lossy trim yields the
    /// available suffix (cold) or nothing (hot) for the missing part.
    pub async fn range(
        &self,
        path: &StreamPath,
        i1: i64,
        i2: i64,
    ) -> Result<(i64, i64, RangeList)> {
        let total = self.deadline(self.hot.length(path)).await?;
        let cold_len = self.deadline(self.hot.cold_length(path)).await?;
        let (a, b) = normalize_range(i1, i2, total)?;

        let mut list = RangeList::new();
        let cold_end = b.min(cold_len);
        if a < cold_end {
            list.append(Box::new(self.cold.range_by_index(
                &path.store_key(),
                a,
                cold_end,
            )));
        }
        let hot_start = a.max(cold_len);
        if hot_start < b {
            list.append(Box::new(HotTailRange {
                cache: self.hot.clone(),
                path: path.clone(),
                i1: hot_start,
                i2: b,
                inner: None,
            }));
        }
        Ok((a, b, list))
    }

    /// Smallest index whose timestamp is greater than `t`, clamped to
    /// `[0, length]`
    pub async fn time_to_index(&self, path: &StreamPath, t: i64) -> Result<i64> {
        self.deadline(async {
            let key = path.store_key();
            let (cold_stored, _) = self.cold.length_and_last_ts(&key).await?;
            let idx = self.cold.time_to_index(&key, t).await?;
            if idx < cold_stored {
                return Ok(idx);
            }
            // t reaches past the cold store; continue the search in hot
            let (hot_start, data) = self.hot.get(path).await?;
            let within = data.iter().take_while(|dp| dp.timestamp <= t).count() as i64;
            Ok(idx.max(hot_start + within))
        })
        .await
    }

    /// Compose a lazy range over the time window `(t1, t2]`, limited to
    /// `limit` datapoints (`0` = unlimited). `t2 == 0` leaves the window
    /// unbounded above.
    pub async fn time_range(
        &self,
        path: &StreamPath,
        t1: i64,
        t2: i64,
        limit: u64,
    ) -> Result<Box<dyn DataRange>> {
        if t2 != 0 && t1 > t2 {
            return Err(Error::User(format!("invalid time range ({t1}, {t2}]")));
        }
        let i1 = self.time_to_index(path, t1).await?;
        let total = self.deadline(self.hot.length(path)).await?;
        if i1 >= total {
            return Ok(Box::new(crate::range::EmptyRange));
        }
        let (_, _, list) = self.range(path, i1, 0).await?;
        let windowed: Box<dyn DataRange> = Box::new(TimeWindowRange::new(Box::new(list), t1, t2));
        Ok(if limit > 0 {
            Box::new(NumRange::new(windowed, limit))
        } else {
            windowed
        })
    }

    /// One migration step: move the oldest queued batch into the cold
    /// store. Returns `Ok(false)` when the writer queue is empty. Stale
    /// descriptors (a stream deleted or trimmed since the cut, or a chunk
    /// already written) are acknowledged with a warning and no error.
    pub async fn write_database_iteration(
        &self,
        writer_id: &str,
        done_id: &str,
    ) -> Result<bool> {
        let Some(desc) = self.deadline(self.hot.next_batch(writer_id, done_id)).await? else {
            return Ok(false);
        };
        self.migrate_batch(done_id, &desc).await?;
        Ok(true)
    }

    /// Migrate one batch previously moved onto a done queue
    pub(crate) async fn migrate_batch(
        &self,
        done_id: &str,
        desc: &crate::core::BatchDescriptor,
    ) -> Result<()> {
        let data = self.hot.read_batch(desc).await?;
        if (data.len() as i64) < desc.len() {
            debug!(descriptor = %desc, read = data.len(), "stale batch, acknowledging");
            return self.hot.ack_batch(done_id, desc).await;
        }

        match self
            .cold
            .append(&desc.path.store_key(), desc.start, &data)
            .await
        {
            Ok(()) => self.hot.ack_batch(done_id, desc).await,
            Err(Error::AppendMismatch { expected, got }) if got < expected => {
                // Chunk already written by an earlier attempt
                debug!(descriptor = %desc, expected, got, "duplicate batch, acknowledging");
                self.hot.ack_batch(done_id, desc).await
            }
            // Leave the descriptor on the done queue; recovery re-enqueues it
            Err(e) => Err(e),
        }
    }

    /// Delete a stream and its substreams from both stores, cold first
    pub async fn delete(&self, path: &StreamPath) -> Result<()> {
        self.deadline(async {
            self.cold.delete(&path.store_key()).await?;
            self.hot.delete(path).await
        })
        .await
    }

    /// Delete every stream whose name begins with `prefix`, cold first
    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.deadline(async {
            self.cold.delete_prefix(prefix).await?;
            self.hot.delete_prefix(prefix).await
        })
        .await
    }

    /// Discard all datapoints below `upto`, cold first. The stream length
    /// is unchanged; reads of the trimmed prefix return nothing.
    pub async fn trim(&self, path: &StreamPath, upto: i64) -> Result<()> {
        self.deadline(async {
            self.cold.trim(&path.store_key(), upto).await?;
            self.hot.trim(path, upto).await
        })
        .await
    }

    /// Whether the stream has any data in either store
    pub async fn exists(&self, path: &StreamPath) -> Result<bool> {
        if self.length(path).await? > 0 {
            return Ok(true);
        }
        Ok(self.deadline(self.cold.length(&path.store_key())).await? > 0)
    }

    /// Number of distinct streams in the cold store
    pub async fn stream_count(&self) -> Result<i64> {
        self.deadline(self.cold.stream_count()).await
    }

    /// Total migrated datapoints across all streams
    pub async fn datapoint_count(&self) -> Result<i64> {
        self.deadline(self.cold.datapoint_count()).await
    }

    /// Migrated stream keys beginning with `prefix`
    pub async fn streams(&self, prefix: &str) -> Result<Vec<String>> {
        self.deadline(self.cold.streams(prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain() {
        assert_eq!(normalize_range(0, 6, 7).unwrap(), (0, 6));
        assert_eq!(normalize_range(2, 8, 9).unwrap(), (2, 8));
    }

    #[test]
    fn test_normalize_zero_end_means_everything() {
        assert_eq!(normalize_range(0, 0, 9).unwrap(), (0, 9));
        assert_eq!(normalize_range(3, 0, 9).unwrap(), (3, 9));
    }

    #[test]
    fn test_normalize_negative_indices() {
        assert_eq!(normalize_range(-2, -1, 9).unwrap(), (7, 8));
        assert_eq!(normalize_range(-2, 20, 9).unwrap(), (7, 9));
        assert_eq!(normalize_range(-9, 0, 9).unwrap(), (0, 9));
    }

    #[test]
    fn test_normalize_clamps_end() {
        assert_eq!(normalize_range(4, 10, 7).unwrap(), (4, 7));
    }

    #[test]
    fn test_normalize_rejects_bad_windows() {
        assert!(normalize_range(2, 1, 9).is_err());
        assert!(normalize_range(-20, 0, 9).is_err());
        assert!(normalize_range(1, 8, 0).is_err());
        // An empty stream still allows the empty window
        assert_eq!(normalize_range(0, 8, 0).unwrap(), (0, 0));
    }
}
