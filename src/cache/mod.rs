//! Redis-resident hot cache
//!
//! Recent datapoints live in a per-stream Redis list of packed records,
//! with a metadata hash tracking `startIndex` (absolute index of the list
//! head), `coldLen` (datapoints already migrated) and `lastTs`. Every
//! multi-step operation (append plus batch cut, ack plus prefix trim)
//! runs as a single server-side Lua script so concurrent producers and the
//! migrator always observe a consistent (list, metadata, queue) triple.
//!
//! Key layout, part of the external contract:
//! - `{hash}stream:substream`: hot list of packed datapoints
//! - `meta:{hash}stream:substream`: metadata hash
//! - `batches:<writerId>`: writer batch queue, newest at head
//! - `done:<doneQueueId>`: in-flight descriptors of one migrator

use crate::core::codec::encode_one;
use crate::core::{decode, BatchDescriptor, DatapointArray, Error, Result, StreamPath};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, Value};
use std::time::Duration;
use tracing::debug;

/// Result of a hot range read: effective bounds plus the data. When the
/// requested prefix has been trimmed out of the cache the data is empty
/// and the bounds still describe what was asked for.
pub type HotRange = (i64, i64, DatapointArray);

/// Default number of datapoints per migration batch
pub const DEFAULT_BATCH_SIZE: i64 = 250;

// Sentinels returned by the scripts in place of error replies, so backend
// errors stay distinguishable from domain errors.
const ORDERING_VIOLATION: i64 = -1;
const BAD_RANGE: i64 = -1;

/// Atomic append: ordering check, optional restamp (rewriting the fixed
/// 8-byte timestamp prefix in place), RPUSH, lastTs update, and batch cut
/// on every `batch_size` boundary the new length crosses. Datapoints are
/// pushed in chunks because `unpack` has a bounded stack.
static INSERT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local restamp = ARGV[1] == '1'
local strict = ARGV[2] == '1'
local batchsize = tonumber(ARGV[3])
local npoints = #ARGV - 3

local startindex = redis.call('hget', KEYS[2], 'startIndex')
if startindex then
  startindex = tonumber(startindex)
else
  startindex = 0
  redis.call('hset', KEYS[2], 'startIndex', 0, 'coldLen', 0)
end
local oldlen = startindex + redis.call('llen', KEYS[1])
if npoints == 0 then
  return oldlen
end

local lastts = redis.call('hget', KEYS[2], 'lastTs')
if lastts then
  lastts = tonumber(lastts)
  local first = struct.unpack('<i8', ARGV[4])
  if not restamp then
    if first < lastts or (strict and first == lastts) then
      return -1
    end
  end
end

local points = {}
for i = 4, #ARGV do
  local p = ARGV[i]
  local ts = struct.unpack('<i8', p)
  if restamp and lastts and ts < lastts then
    ts = lastts
    p = struct.pack('<i8', ts) .. string.sub(p, 9)
  end
  lastts = ts
  points[i - 3] = p
end

for i = 1, #points, 5000 do
  redis.call('rpush', KEYS[1], unpack(points, i, math.min(i + 4999, #points)))
end
redis.call('hset', KEYS[2], 'lastTs', string.format('%d', lastts))

local newlen = oldlen + npoints
for b = math.floor(oldlen / batchsize), math.floor(newlen / batchsize) - 1 do
  redis.call('lpush', KEYS[3],
             KEYS[1] .. ':' .. (b * batchsize) .. ':' .. ((b + 1) * batchsize))
end
return newlen
"#,
    )
});

/// Consistent range read. Normalizes negative and zero bounds against the
/// total length, clamps the end, and returns `{i1, i2, records...}`. A
/// request reaching below `startIndex` yields the bounds with no records.
static RANGE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local startindex = tonumber(redis.call('hget', KEYS[2], 'startIndex') or '0')
local llen = redis.call('llen', KEYS[1])
local total = startindex + llen
local i1 = tonumber(ARGV[1])
local i2 = tonumber(ARGV[2])
if i1 < 0 then i1 = total + i1 end
if i2 <= 0 then i2 = total + i2 end
if i2 > total then i2 = total end
if i1 < 0 or i1 > total or i2 < i1 then
  return {-1, -1}
end
local out = {i1, i2}
if i1 == i2 or i1 < startindex then
  return out
end
local items = redis.call('lrange', KEYS[1], i1 - startindex, i2 - startindex - 1)
for j = 1, #items do
  out[j + 2] = items[j]
end
return out
"#,
    )
});

/// Read the packed records of one batch without removing them. A start
/// below `startIndex` means the batch was trimmed or its stream deleted;
/// the caller sees an empty read.
static READ_BATCH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local startindex = tonumber(redis.call('hget', KEYS[2], 'startIndex') or '0')
local s = tonumber(ARGV[1]) - startindex
local e = tonumber(ARGV[2]) - startindex - 1
if s < 0 then
  return {}
end
return redis.call('lrange', KEYS[1], s, e)
"#,
    )
});

/// Ack one migrated batch: drop the descriptor from the done queue, trim
/// the corresponding hot prefix and advance `startIndex`/`coldLen`. The
/// trim is skipped when the stream no longer covers the batch window.
static ACK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('lrem', KEYS[1], 1, ARGV[1])
local startindex = redis.call('hget', KEYS[3], 'startIndex')
if not startindex then
  return 0
end
startindex = tonumber(startindex)
local endindex = tonumber(ARGV[2])
local llen = redis.call('llen', KEYS[2])
if endindex > startindex and endindex <= startindex + llen then
  redis.call('ltrim', KEYS[2], endindex - startindex, -1)
  redis.call('hset', KEYS[3], 'startIndex', endindex)
end
local cold = tonumber(redis.call('hget', KEYS[3], 'coldLen') or '0')
if endindex > cold then
  redis.call('hset', KEYS[3], 'coldLen', endindex)
end
return 1
"#,
    )
});

/// Advance the hot head to `upto`, never backwards. The visible length is
/// unchanged; trimming is lossy for data the migrator has not copied yet.
static TRIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local startindex = redis.call('hget', KEYS[2], 'startIndex')
if not startindex then
  return 0
end
startindex = tonumber(startindex)
local upto = tonumber(ARGV[1])
local total = startindex + redis.call('llen', KEYS[1])
if upto > total then upto = total end
if upto > startindex then
  redis.call('ltrim', KEYS[1], upto - startindex, -1)
  redis.call('hset', KEYS[2], 'startIndex', upto)
end
return 1
"#,
    )
});

static LENGTH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local startindex = tonumber(redis.call('hget', KEYS[2], 'startIndex') or '0')
return startindex + redis.call('llen', KEYS[1])
"#,
    )
});

/// Drain a crashed migrator's done queue back onto the writer queue,
/// oldest descriptors ending up nearest the consuming tail.
static RECOVER_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local n = 0
local d = redis.call('lpop', KEYS[1])
while d do
  redis.call('rpush', KEYS[2], d)
  n = n + 1
  d = redis.call('lpop', KEYS[1])
end
return n
"#,
    )
});

/// Hot cache over a shared Redis connection
#[derive(Clone)]
pub struct HotCache {
    redis: ConnectionManager,
    batch_size: i64,
}

impl HotCache {
    /// Connect to Redis
    pub async fn connect(redis_url: &str, batch_size: i64) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis, batch_size))
    }

    /// Wrap an existing connection
    pub fn from_connection(redis: ConnectionManager, batch_size: i64) -> Self {
        Self { redis, batch_size }
    }

    /// Datapoints per migration batch
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    fn batches_key(writer_id: &str) -> String {
        format!("batches:{writer_id}")
    }

    fn done_key(done_id: &str) -> String {
        format!("done:{done_id}")
    }

    /// Escape glob metacharacters so a literal stream name never widens a
    /// SCAN MATCH pattern. Stream names may contain anything but ':'.
    fn escape_glob(s: &str) -> String {
        let mut escaped = String::with_capacity(s.len());
        for c in s.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }

    /// Append datapoints to a stream, cutting any newly complete batches
    /// onto the writer's queue. Returns the new total stream length.
    ///
    /// Fails with [`Error::Ordering`] when the first incoming timestamp
    /// precedes the stream's `lastTs` and `restamp` is false; equal
    /// timestamps are accepted. With `restamp`, violating timestamps are
    /// clamped to the running maximum instead. Arrays beyond the script
    /// argument ceiling are split into sequential script calls.
    pub async fn insert(
        &self,
        writer_id: &str,
        path: &StreamPath,
        points: &DatapointArray,
        restamp: bool,
    ) -> Result<i64> {
        self.insert_inner(writer_id, path, points, restamp, false).await
    }

    /// Like [`insert`](Self::insert) but an incoming first timestamp equal
    /// to `lastTs` is also rejected unless restamping. The engine-level
    /// insert uses this stricter historical rule; a restamped equal
    /// timestamp is preserved, not bumped.
    pub async fn insert_after(
        &self,
        writer_id: &str,
        path: &StreamPath,
        points: &DatapointArray,
        restamp: bool,
    ) -> Result<i64> {
        self.insert_inner(writer_id, path, points, restamp, true).await
    }

    async fn insert_inner(
        &self,
        writer_id: &str,
        path: &StreamPath,
        points: &DatapointArray,
        restamp: bool,
        strict: bool,
    ) -> Result<i64> {
        const CHUNK: usize = 5000;

        if points.is_empty() {
            return self.length(path).await;
        }

        let list_key = path.list_key();
        let meta_key = path.meta_key();
        let batches_key = Self::batches_key(writer_id);

        let mut new_len = 0;
        for (i, chunk) in points.chunks(CHUNK).enumerate() {
            let mut conn = self.redis.clone();
            let mut invocation = INSERT_SCRIPT.prepare_invoke();
            invocation
                .key(&list_key)
                .key(&meta_key)
                .key(&batches_key)
                .arg(if restamp { "1" } else { "0" })
                // Later chunks of one array continue from their own tail
                .arg(if strict && i == 0 { "1" } else { "0" })
                .arg(self.batch_size);
            for dp in chunk {
                invocation.arg(encode_one(dp));
            }
            let len: i64 = invocation.invoke_async(&mut conn).await?;
            if len == ORDERING_VIOLATION {
                return Err(Error::Ordering);
            }
            new_len = len;
        }
        Ok(new_len)
    }

    /// Total stream length: migrated prefix plus hot list
    pub async fn length(&self, path: &StreamPath) -> Result<i64> {
        let mut conn = self.redis.clone();
        let len: i64 = LENGTH_SCRIPT
            .prepare_invoke()
            .key(path.list_key())
            .key(path.meta_key())
            .invoke_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Timestamp of the most recent datapoint, if the stream has any
    pub async fn last_timestamp(&self, path: &StreamPath) -> Result<Option<i64>> {
        let mut conn = self.redis.clone();
        let ts: Option<String> = conn.hget(path.meta_key(), "lastTs").await?;
        match ts {
            Some(s) => Ok(Some(s.parse().map_err(|_| {
                Error::Backend(format!("corrupt lastTs for {path}: {s}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Absolute index of the first datapoint still in the hot list
    pub async fn start_index(&self, path: &StreamPath) -> Result<i64> {
        let mut conn = self.redis.clone();
        let idx: Option<i64> = conn.hget(path.meta_key(), "startIndex").await?;
        Ok(idx.unwrap_or(0))
    }

    /// Number of datapoints already migrated to the cold store
    pub async fn cold_length(&self, path: &StreamPath) -> Result<i64> {
        let mut conn = self.redis.clone();
        let len: Option<i64> = conn.hget(path.meta_key(), "coldLen").await?;
        Ok(len.unwrap_or(0))
    }

    /// Read `[i1, i2)` out of the stream by absolute index
    ///
    /// Negative indices count from the tail; `i2 == 0` means "to end"; an
    /// end past the stream clamps. The effective bounds come back with the
    /// data; a range reaching below the trimmed head yields empty data.
    pub async fn range(&self, path: &StreamPath, i1: i64, i2: i64) -> Result<HotRange> {
        let mut conn = self.redis.clone();
        let reply: Vec<Value> = RANGE_SCRIPT
            .prepare_invoke()
            .key(path.list_key())
            .key(path.meta_key())
            .arg(i1)
            .arg(i2)
            .invoke_async(&mut conn)
            .await?;

        let bound = |v: Option<&Value>| -> Result<i64> {
            match v {
                Some(Value::Int(i)) => Ok(*i),
                _ => Err(Error::Backend("malformed range reply".into())),
            }
        };
        let eff1 = bound(reply.first())?;
        let eff2 = bound(reply.get(1))?;
        if eff1 == BAD_RANGE && eff2 == BAD_RANGE {
            return Err(Error::User(format!("invalid range [{i1}, {i2})")));
        }

        let mut data = DatapointArray::new();
        for item in &reply[2..] {
            match item {
                Value::Data(bytes) => data.extend(decode(bytes)?),
                _ => return Err(Error::Backend("malformed range reply".into())),
            }
        }
        Ok((eff1, eff2, data))
    }

    /// The whole hot list plus the absolute index of its first datapoint
    pub async fn get(&self, path: &StreamPath) -> Result<(i64, DatapointArray)> {
        let mut conn = self.redis.clone();
        let start = self.start_index(path).await?;
        let items: Vec<Vec<u8>> = conn.lrange(path.list_key(), 0, -1).await?;
        let mut data = DatapointArray::new();
        for item in &items {
            data.extend(decode(item)?);
        }
        Ok((start, data))
    }

    /// Move the oldest descriptor from the writer queue to the done queue
    pub async fn next_batch(
        &self,
        writer_id: &str,
        done_id: &str,
    ) -> Result<Option<BatchDescriptor>> {
        let mut conn = self.redis.clone();
        let desc: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(Self::batches_key(writer_id))
            .arg(Self::done_key(done_id))
            .query_async(&mut conn)
            .await?;
        desc.map(|d| BatchDescriptor::parse(&d)).transpose()
    }

    /// Blocking variant of [`next_batch`](Self::next_batch); waits up to
    /// `timeout` before returning `None` so callers can re-check shutdown
    /// flags
    pub async fn next_batch_blocking(
        &self,
        writer_id: &str,
        done_id: &str,
        timeout: Duration,
    ) -> Result<Option<BatchDescriptor>> {
        let mut conn = self.redis.clone();
        let desc: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(Self::batches_key(writer_id))
            .arg(Self::done_key(done_id))
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        desc.map(|d| BatchDescriptor::parse(&d)).transpose()
    }

    /// Decode the datapoints a descriptor refers to without removing them.
    /// A trimmed or deleted batch window reads back empty.
    pub async fn read_batch(&self, desc: &BatchDescriptor) -> Result<DatapointArray> {
        let mut conn = self.redis.clone();
        let items: Vec<Vec<u8>> = READ_BATCH_SCRIPT
            .prepare_invoke()
            .key(desc.path.list_key())
            .key(desc.path.meta_key())
            .arg(desc.start)
            .arg(desc.end)
            .invoke_async(&mut conn)
            .await?;
        let mut data = DatapointArray::new();
        for item in &items {
            data.extend(decode(item)?);
        }
        Ok(data)
    }

    /// Drop a migrated descriptor from the done queue and trim the
    /// corresponding hot prefix, advancing `startIndex` and `coldLen`
    pub async fn ack_batch(&self, done_id: &str, desc: &BatchDescriptor) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = ACK_SCRIPT
            .prepare_invoke()
            .key(Self::done_key(done_id))
            .key(desc.path.list_key())
            .key(desc.path.meta_key())
            .arg(desc.to_string())
            .arg(desc.end)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Drop all datapoints below `upto` from the hot list. The visible
    /// stream length is unchanged and a later trim to a smaller index is a
    /// no-op.
    pub async fn trim(&self, path: &StreamPath, upto: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = TRIM_SCRIPT
            .prepare_invoke()
            .key(path.list_key())
            .key(path.meta_key())
            .arg(upto)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete exactly one (stream, substream) partition
    pub async fn delete_substream(&self, path: &StreamPath) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.del(vec![path.list_key(), path.meta_key()]).await?;
        Ok(())
    }

    /// Delete a stream and every substream under it
    pub async fn delete(&self, path: &StreamPath) -> Result<()> {
        let pattern = format!(
            "{{{}}}{}:*",
            Self::escape_glob(&path.hash),
            Self::escape_glob(&path.stream)
        );
        self.delete_matching(&pattern).await
    }

    /// Delete every stream whose name begins with `prefix`, across all
    /// hashes and substreams
    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{{*}}{}*", Self::escape_glob(prefix));
        self.delete_matching(&pattern).await
    }

    async fn delete_matching(&self, list_pattern: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        for pattern in [list_pattern.to_string(), format!("meta:{list_pattern}")] {
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    debug!(pattern = %pattern, count = keys.len(), "deleting hot keys");
                    let _: i64 = conn.del(keys).await?;
                }
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Read a batch or done queue without popping (oldest last)
    pub async fn queue_list(&self, queue_key: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.lrange(queue_key, 0, -1).await?)
    }

    /// Descriptors currently waiting on a writer's batch queue
    pub async fn writer_queue(&self, writer_id: &str) -> Result<Vec<String>> {
        self.queue_list(&Self::batches_key(writer_id)).await
    }

    /// Descriptors currently owned by a migrator's done queue
    pub async fn done_queue(&self, done_id: &str) -> Result<Vec<String>> {
        self.queue_list(&Self::done_key(done_id)).await
    }

    /// Push a crashed migrator's in-flight descriptors back onto the
    /// writer queue; returns how many were recovered
    pub async fn recover_done_queue(&self, done_id: &str, writer_id: &str) -> Result<i64> {
        let mut conn = self.redis.clone();
        let n: i64 = RECOVER_SCRIPT
            .prepare_invoke()
            .key(Self::done_key(done_id))
            .key(Self::batches_key(writer_id))
            .invoke_async(&mut conn)
            .await?;
        if n > 0 {
            debug!(done_id, writer_id, recovered = n, "recovered in-flight batches");
        }
        Ok(n)
    }

    /// Flush the entire cache. Test and maintenance use only.
    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}
