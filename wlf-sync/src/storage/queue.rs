//! Bounded persistence queue.
//!
//! Rooms hand their exportable state to [`PersistQueue::enqueue`], which
//! never waits: when the queue is full the write is dropped with a warning
//! (the next accepted mutation persists the whole room again anyway). One
//! worker task drains the queue in FIFO order and retries each failed write
//! with exponential backoff.
//!
//! ```text
//! enqueue ──try_send──► [ job | job | job ] ──► worker ──put──► RoomStore
//!                                                 │  ▲
//!                                                 └──┘ retry: base, 2·base, 4·base, …
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::{encode_record, RoomStore};
use crate::config::PersistConfig;
use crate::room::RoomRecord;

struct PersistJob {
    key: String,
    record: RoomRecord,
    /// Set for writes whose completion someone waits on
    ack: Option<oneshot::Sender<bool>>,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub written: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the persistence worker. Cheap to clone; the worker exits once
/// every handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<Counters>,
}

impl PersistQueue {
    /// Spawn the worker on the current runtime.
    pub fn spawn(store: Arc<dyn RoomStore>, config: PersistConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(store, rx, config, Arc::clone(&counters)));
        Self { tx, counters }
    }

    /// Queue a write without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, key: &str, record: RoomRecord) -> bool {
        let job = PersistJob {
            key: key.to_string(),
            record,
            ack: None,
        };
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Persistence queue full, dropped write for room {}", job.key);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                log::error!("Persistence worker gone, dropped write for room {}", job.key);
                false
            }
        }
    }

    /// Queue a write behind everything already queued and wait until the
    /// worker reports it stored (`true`) or given up on (`false`).
    pub async fn persist_now(&self, key: &str, record: RoomRecord) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let job = PersistJob {
            key: key.to_string(),
            record,
            ack: Some(ack_tx),
        };
        if self.tx.send(job).await.is_err() {
            log::error!("Persistence worker gone, write for room {key} lost");
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            written: self.counters.written.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    store: Arc<dyn RoomStore>,
    mut rx: mpsc::Receiver<PersistJob>,
    config: PersistConfig,
    counters: Arc<Counters>,
) {
    while let Some(job) = rx.recv().await {
        let stored = write_with_retry(store.as_ref(), &job, &config, &counters).await;
        if stored {
            counters.written.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(ack) = job.ack {
            let _ = ack.send(stored);
        }
    }
    log::debug!("Persistence worker stopped");
}

async fn write_with_retry(
    store: &dyn RoomStore,
    job: &PersistJob,
    config: &PersistConfig,
    counters: &Counters,
) -> bool {
    let bytes = match encode_record(&job.record) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Cannot encode room {}: {e}", job.key);
            return false;
        }
    };

    let attempts = config.max_attempts.max(1);
    let mut delay = config.retry_base;
    for attempt in 1..=attempts {
        match store.put(&job.key, bytes.clone()).await {
            Ok(()) => {
                log::trace!("Persisted room {} ({} bytes)", job.key, bytes.len());
                return true;
            }
            Err(e) if attempt < attempts => {
                counters.retried.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Persisting room {} failed (attempt {attempt}/{attempts}): {e}, retrying in {delay:?}",
                    job.key
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                log::error!(
                    "Giving up persisting room {} after {attempts} attempts: {e}",
                    job.key
                );
            }
        }
    }
    false
}
