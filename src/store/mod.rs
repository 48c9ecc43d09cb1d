//! Chunked SQL cold store
//!
//! Historic datapoints are packed `batch_size` at a time into rows of the
//! `timebatch` table, keyed by `(key, end_index)` where `end_index` is the
//! absolute index of the row's last datapoint plus one. Rows also carry the
//! first and last timestamp of their chunk so time ranges can prune without
//! decoding. The store is append-only: a row is written once by the
//! migrator and removed only by delete or trim.

use crate::core::{DatapointArray, Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub mod chunked_range;

pub use chunked_range::ChunkedRange;

/// Cold store configuration
#[derive(Debug, Clone)]
pub struct ColdStoreConfig {
    /// Database URL (e.g. "sqlite://timebatch.db" or "sqlite::memory:")
    pub url: String,

    /// Minimum number of pooled connections
    pub min_connections: u32,

    /// Maximum number of pooled connections
    pub max_connections: u32,

    /// Connection acquire timeout in seconds
    pub connect_timeout: u64,
}

impl Default for ColdStoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://timebatch.db".to_string(),
            min_connections: 1,
            max_connections: 16,
            connect_timeout: 30,
        }
    }
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS timebatch (
  key         TEXT NOT NULL,
  end_index   BIGINT NOT NULL,
  start_ts    BIGINT NOT NULL,
  end_ts      BIGINT NOT NULL,
  data        BLOB NOT NULL,
  PRIMARY KEY (key, end_index)
)";

const CREATE_TIME_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS timebatch_time ON timebatch(key, end_ts)";

/// Escape LIKE metacharacters so a literal stream key never widens a
/// pattern. Queries using the result must carry `ESCAPE '\'`.
fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Append-only chunked table of migrated datapoints
#[derive(Clone)]
pub struct ColdStore {
    pool: SqlitePool,
}

impl ColdStore {
    /// Open the store and create the schema if needed
    pub async fn connect(config: &ColdStoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(Error::Sql)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool; the caller is responsible for `migrate`
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table and its time index
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_TIME_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one chunk at `start_index`
    ///
    /// Strict append: fails with [`Error::AppendMismatch`] unless
    /// `start_index` equals the current stored length of the stream. The
    /// check and the insert run in one transaction so racing migrators
    /// cannot interleave.
    pub async fn append(&self, key: &str, start_index: i64, chunk: &DatapointArray) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let stored: i64 = sqlx::query(
            "SELECT COALESCE(MAX(end_index), 0) AS len FROM timebatch WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?
        .get("len");

        if stored != start_index {
            return Err(Error::AppendMismatch {
                expected: stored,
                got: start_index,
            });
        }

        let end_index = start_index + chunk.len() as i64;
        let start_ts = chunk.start_timestamp().unwrap_or(0);
        let end_ts = chunk.end_timestamp().unwrap_or(0);

        sqlx::query(
            "INSERT INTO timebatch (key, end_index, start_ts, end_ts, data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(end_index)
        .bind(start_ts)
        .bind(end_ts)
        .bind(chunk.encode())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(key, start_index, end_index, "appended chunk");
        Ok(())
    }

    /// Stored length and the timestamp of the newest stored datapoint
    pub async fn length_and_last_ts(&self, key: &str) -> Result<(i64, Option<i64>)> {
        let row = sqlx::query(
            "SELECT end_index, end_ts FROM timebatch
             WHERE key = ? ORDER BY end_index DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok((r.get("end_index"), Some(r.get("end_ts")))),
            None => Ok((0, None)),
        }
    }

    /// Stored length (`MAX(end_index)`, 0 when the stream has no rows)
    pub async fn length(&self, key: &str) -> Result<i64> {
        Ok(self.length_and_last_ts(key).await?.0)
    }

    /// Lazy range over datapoints with absolute indices in `[i1, i2)`
    pub fn range_by_index(&self, key: &str, i1: i64, i2: i64) -> ChunkedRange {
        ChunkedRange::by_index(self.pool.clone(), key.to_string(), i1, i2)
    }

    /// Lazy range over datapoints with timestamps in `(t1, t2]`; `t2 == 0`
    /// leaves the range unbounded above. Rows are pruned by their stored
    /// timestamp bounds before any chunk is decoded.
    pub fn range_by_time(&self, key: &str, t1: i64, t2: i64) -> ChunkedRange {
        ChunkedRange::by_time(self.pool.clone(), key.to_string(), t1, t2)
    }

    /// Smallest stored index whose timestamp is greater than `t`, clamped
    /// to `[0, stored_len]`
    pub async fn time_to_index(&self, key: &str, t: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT end_index, data FROM timebatch
             WHERE key = ? AND end_ts > ? ORDER BY end_index ASC LIMIT 1",
        )
        .bind(key)
        .bind(t)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            // Everything stored is at or before t
            return self.length(key).await;
        };

        let end_index: i64 = row.get("end_index");
        let chunk = crate::core::decode(row.get::<Vec<u8>, _>("data").as_slice())?;
        let chunk_start = end_index - chunk.len() as i64;
        let within = chunk.iter().take_while(|dp| dp.timestamp <= t).count() as i64;
        Ok(chunk_start + within)
    }

    /// Remove all rows whose key equals the argument or names one of its
    /// substreams
    pub async fn delete(&self, key: &str) -> Result<()> {
        let res = sqlx::query(
            "DELETE FROM timebatch WHERE key = ? OR key LIKE ? ESCAPE '\\'",
        )
        .bind(key)
        .bind(format!("{}:%", escape_like(key)))
        .execute(&self.pool)
        .await?;
        debug!(key, rows = res.rows_affected(), "deleted stream rows");
        Ok(())
    }

    /// Remove all rows whose key begins with `prefix`
    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let res = sqlx::query("DELETE FROM timebatch WHERE key LIKE ? ESCAPE '\\'")
            .bind(format!("{}%", escape_like(prefix)))
            .execute(&self.pool)
            .await?;
        debug!(prefix, rows = res.rows_affected(), "deleted rows by prefix");
        Ok(())
    }

    /// Drop whole rows that lie entirely below `upto`. Rows straddling the
    /// index survive; absolute indices of the remaining rows are unchanged.
    pub async fn trim(&self, key: &str, upto: i64) -> Result<()> {
        sqlx::query("DELETE FROM timebatch WHERE key = ? AND end_index <= ?")
            .bind(key)
            .bind(upto)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of distinct stream keys with stored rows
    pub async fn stream_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(DISTINCT key) AS n FROM timebatch")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Number of stored chunk rows
    pub async fn chunk_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM timebatch")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Total stored length summed over all streams
    pub async fn datapoint_count(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(len), 0) AS n
             FROM (SELECT MAX(end_index) AS len FROM timebatch GROUP BY key)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Distinct stream keys beginning with `prefix`, ordered
    pub async fn streams(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT key FROM timebatch WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(format!("{}%", escape_like(prefix)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Datapoint;
    use crate::range::{read_array, DataRange};

    async fn memory_store() -> ColdStore {
        let config = ColdStoreConfig {
            url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
            ..Default::default()
        };
        ColdStore::connect(&config).await.unwrap()
    }

    fn chunk(range: std::ops::Range<i64>) -> DatapointArray {
        range
            .map(|i| Datapoint::new(i * 100, format!("v{i}").into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_strict_append() {
        let store = memory_store().await;

        store.append("s", 0, &chunk(0..3)).await.unwrap();
        store.append("s", 3, &chunk(3..6)).await.unwrap();

        // A gap and a replay both violate strict append
        let err = store.append("s", 9, &chunk(9..12)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AppendMismatch { expected: 6, got: 9 }
        ));
        let err = store.append("s", 3, &chunk(3..6)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AppendMismatch { expected: 6, got: 3 }
        ));

        let (len, last) = store.length_and_last_ts("s").await.unwrap();
        assert_eq!(len, 6);
        assert_eq!(last, Some(500));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let store = memory_store().await;
        assert_eq!(store.length_and_last_ts("nope").await.unwrap(), (0, None));
        assert_eq!(store.time_to_index("nope", 50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_range_by_index_spans_rows() {
        let store = memory_store().await;
        store.append("s", 0, &chunk(0..3)).await.unwrap();
        store.append("s", 3, &chunk(3..6)).await.unwrap();
        store.append("s", 6, &chunk(6..9)).await.unwrap();

        let mut r = store.range_by_index("s", 1, 8);
        r.init().await.unwrap();
        let out = read_array(&mut r).await.unwrap();
        let ts: Vec<i64> = out.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![100, 200, 300, 400, 500, 600, 700]);
    }

    #[tokio::test]
    async fn test_range_by_index_clamps_to_stored() {
        let store = memory_store().await;
        store.append("s", 0, &chunk(0..3)).await.unwrap();

        let mut r = store.range_by_index("s", 0, 100);
        r.init().await.unwrap();
        assert_eq!(read_array(&mut r).await.unwrap().len(), 3);

        let mut r = store.range_by_index("s", 5, 10);
        r.init().await.unwrap();
        assert_eq!(read_array(&mut r).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_range_by_time() {
        let store = memory_store().await;
        store.append("s", 0, &chunk(0..3)).await.unwrap(); // ts 0, 100, 200
        store.append("s", 3, &chunk(3..6)).await.unwrap(); // ts 300, 400, 500

        let mut r = store.range_by_time("s", 100, 400);
        r.init().await.unwrap();
        let out = read_array(&mut r).await.unwrap();
        let ts: Vec<i64> = out.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![200, 300, 400]);

        // Unbounded above
        let mut r = store.range_by_time("s", 350, 0);
        r.init().await.unwrap();
        let out = read_array(&mut r).await.unwrap();
        let ts: Vec<i64> = out.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![400, 500]);
    }

    #[tokio::test]
    async fn test_time_to_index() {
        let store = memory_store().await;
        store.append("s", 0, &chunk(0..3)).await.unwrap();
        store.append("s", 3, &chunk(3..6)).await.unwrap();

        assert_eq!(store.time_to_index("s", -1).await.unwrap(), 0);
        assert_eq!(store.time_to_index("s", 0).await.unwrap(), 1);
        assert_eq!(store.time_to_index("s", 250).await.unwrap(), 3);
        assert_eq!(store.time_to_index("s", 300).await.unwrap(), 4);
        assert_eq!(store.time_to_index("s", 9_999).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_delete_covers_substreams() {
        let store = memory_store().await;
        store.append("s", 0, &chunk(0..3)).await.unwrap();
        store.append("s:downlink", 0, &chunk(0..3)).await.unwrap();
        store.append("salt", 0, &chunk(0..3)).await.unwrap();

        store.delete("s").await.unwrap();
        assert_eq!(store.length("s").await.unwrap(), 0);
        assert_eq!(store.length("s:downlink").await.unwrap(), 0);
        // "salt" shares only a name prefix, not the stream itself
        assert_eq!(store.length("salt").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = memory_store().await;
        store.append("hello/world", 0, &chunk(0..3)).await.unwrap();
        store.append("hello/moon", 0, &chunk(0..3)).await.unwrap();
        store.append("goodbye", 0, &chunk(0..3)).await.unwrap();

        store.delete_prefix("hello/").await.unwrap();
        assert_eq!(store.length("hello/world").await.unwrap(), 0);
        assert_eq!(store.length("hello/moon").await.unwrap(), 0);
        assert_eq!(store.length("goodbye").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_trim_drops_whole_rows() {
        let store = memory_store().await;
        store.append("s", 0, &chunk(0..3)).await.unwrap();
        store.append("s", 3, &chunk(3..6)).await.unwrap();

        store.trim("s", 3).await.unwrap();
        // Length is still MAX(end_index); the first row is gone
        assert_eq!(store.length("s").await.unwrap(), 6);
        assert_eq!(store.chunk_count().await.unwrap(), 1);

        let mut r = store.range_by_index("s", 0, 6);
        r.init().await.unwrap();
        let out = read_array(&mut r).await.unwrap();
        assert_eq!(out[0].timestamp, 300);
    }

    #[test]
    fn test_like_metacharacters_are_escaped() {
        assert_eq!(escape_like("a%b"), "a\\%b");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[tokio::test]
    async fn test_delete_prefix_treats_metacharacters_literally() {
        let store = memory_store().await;
        store.append("a%b/one", 0, &chunk(0..3)).await.unwrap();
        store.append("axxb/two", 0, &chunk(0..3)).await.unwrap();

        // "%" in the prefix is a literal character, not a wildcard
        store.delete_prefix("a%b").await.unwrap();
        assert_eq!(store.length("a%b/one").await.unwrap(), 0);
        assert_eq!(store.length("axxb/two").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_with_underscore_key_stays_literal() {
        let store = memory_store().await;
        store.append("a_b", 0, &chunk(0..3)).await.unwrap();
        store.append("a_b:sub", 0, &chunk(0..3)).await.unwrap();
        store.append("axb", 0, &chunk(0..3)).await.unwrap();
        store.append("axb:sub", 0, &chunk(0..3)).await.unwrap();

        store.delete("a_b").await.unwrap();
        assert_eq!(store.length("a_b").await.unwrap(), 0);
        assert_eq!(store.length("a_b:sub").await.unwrap(), 0);
        // "_" must not act as a single-character wildcard
        assert_eq!(store.length("axb").await.unwrap(), 3);
        assert_eq!(store.length("axb:sub").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_counts() {
        let store = memory_store().await;
        store.append("a", 0, &chunk(0..3)).await.unwrap();
        store.append("b", 0, &chunk(0..2)).await.unwrap();
        store.append("b", 2, &chunk(2..4)).await.unwrap();

        assert_eq!(store.stream_count().await.unwrap(), 2);
        assert_eq!(store.chunk_count().await.unwrap(), 3);
        assert_eq!(store.datapoint_count().await.unwrap(), 7);
        assert_eq!(store.streams("").await.unwrap(), vec!["a", "b"]);
    }
}
