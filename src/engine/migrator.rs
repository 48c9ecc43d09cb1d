//! Background migration worker
//!
//! A migrator loops over one writer queue, moving batches from the hot
//! cache into the cold store. Several migrators may run against the same
//! writer queue as long as each owns a distinct done-queue id: the done
//! queue is the crash-recovery primitive. A worker that dies between
//! `next_batch` and `ack_batch` leaves its descriptor on the done queue;
//! on startup a worker drains its done queue back onto the writer queue
//! before processing anything new.

use crate::core::Result;
use crate::engine::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Migration progress counters
#[derive(Debug, Clone, Default)]
pub struct MigratorStats {
    /// Batches written to the cold store and acknowledged
    pub batches_migrated: u64,

    /// Failed iterations (descriptor left for retry)
    pub failures: u64,

    /// Descriptors recovered from the done queue at startup
    pub recovered: u64,

    /// When the last batch was processed
    pub last_batch_at: Option<DateTime<Utc>>,
}

/// One migration worker bound to a (writer queue, done queue) pair
pub struct Migrator {
    engine: Engine,
    writer_id: String,
    done_id: String,
    is_running: Arc<AtomicBool>,
    batches_migrated: AtomicU64,
    failures: AtomicU64,
    recovered: AtomicU64,
    last_batch_at: RwLock<Option<DateTime<Utc>>>,
}

impl Migrator {
    /// Create a worker. `done_id` must be unique per concurrently running
    /// worker; reusing the id of a crashed worker adopts its in-flight
    /// batches.
    pub fn new(engine: Engine, writer_id: impl Into<String>, done_id: impl Into<String>) -> Self {
        Self {
            engine,
            writer_id: writer_id.into(),
            done_id: done_id.into(),
            is_running: Arc::new(AtomicBool::new(false)),
            batches_migrated: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            last_batch_at: RwLock::new(None),
        }
    }

    /// The done-queue id this worker owns
    pub fn done_id(&self) -> &str {
        &self.done_id
    }

    /// Current counters
    pub fn stats(&self) -> MigratorStats {
        MigratorStats {
            batches_migrated: self.batches_migrated.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            last_batch_at: *self.last_batch_at.read(),
        }
    }

    /// Signal the run loop to stop after its current iteration
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Whether the run loop is active
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Requeue descriptors a previous incarnation left in flight
    pub async fn recover(&self) -> Result<i64> {
        let n = self
            .engine
            .hot()
            .recover_done_queue(&self.done_id, &self.writer_id)
            .await?;
        if n > 0 {
            info!(done_id = %self.done_id, recovered = n, "requeued in-flight batches");
            self.recovered.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(n)
    }

    /// Run until [`stop`](Self::stop). Blocks cooperatively on the batch
    /// queue and backs off on backend errors; a failed batch stays on the
    /// done queue and is retried after recovery.
    pub async fn run(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(done_id = %self.done_id, "migrator already running");
            return Ok(());
        }
        info!(writer = %self.writer_id, done_id = %self.done_id, "migrator starting");

        self.recover().await?;

        let wait = self.engine.batch_wait();
        while self.is_running.load(Ordering::SeqCst) {
            let desc = match self
                .engine
                .hot()
                .next_batch_blocking(&self.writer_id, &self.done_id, wait)
                .await
            {
                Ok(Some(desc)) => desc,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "batch queue unavailable");
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff(wait)).await;
                    continue;
                }
            };

            match self.engine.migrate_batch(&self.done_id, &desc).await {
                Ok(()) => {
                    self.batches_migrated.fetch_add(1, Ordering::Relaxed);
                    *self.last_batch_at.write() = Some(Utc::now());
                }
                Err(e) => {
                    warn!(descriptor = %desc, error = %e, "migration failed, will retry");
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff(wait)).await;
                    // The failed descriptor is still on the done queue
                    self.recover().await?;
                }
            }
        }

        info!(done_id = %self.done_id, "migrator stopped");
        Ok(())
    }
}

fn backoff(wait: Duration) -> Duration {
    wait.min(Duration::from_secs(5))
}
