//! Hot-key micro-batching
//!
//! Concurrent increments for the same hot key are coalesced into a single
//! store operation, flushed on a short periodic tick. Submitters get a
//! one-shot promise that resolves to the counter value as it stood after
//! their own increment, in submit order, computed from the flushed total.
//! One store round-trip serves every waiter in the window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::store::{CounterOp, CounterStore, OpReply, Pipeline, StoreError, StoreResult};

/// Batcher tuning
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Flush tick; pending increments wait at most this long
    pub flush_window: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_window: Duration::from_micros(300),
        }
    }
}

struct Waiter {
    hits: u64,
    tx: oneshot::Sender<StoreResult<u64>>,
}

/// All pending increments for one key within the current flush window
#[derive(Default)]
struct PendingCounter {
    total_hits: u64,
    ttl_seconds: u64,
    waiters: Vec<Waiter>,
}

type PendingMap = HashMap<String, PendingCounter>;

/// Coalesces concurrent increments on hot keys
pub struct HotKeyBatcher {
    config: BatcherConfig,
    store: Arc<dyn CounterStore>,
    pending: Arc<Mutex<PendingMap>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HotKeyBatcher {
    /// A batcher flushing into the given store
    pub fn new(store: Arc<dyn CounterStore>, config: BatcherConfig) -> Self {
        Self {
            config,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        }
    }

    /// Queue `hits` increments of `key`, keeping the counter alive for at
    /// least `ttl_seconds`
    ///
    /// The returned promise resolves after the next flush with the counter
    /// value as of this submitter's increment, or with the flush error.
    pub fn submit(
        &self,
        key: &str,
        hits: u64,
        ttl_seconds: u64,
    ) -> oneshot::Receiver<StoreResult<u64>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let entry = pending.entry(key.to_string()).or_default();
        entry.total_hits += hits;
        entry.ttl_seconds = entry.ttl_seconds.max(ttl_seconds);
        entry.waiters.push(Waiter { hits, tx });
        rx
    }

    /// Launch the background flush worker
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = Arc::clone(&self.pending);
        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);
        let flush_window = self.config.flush_window;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(flush_window);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::flush(&pending, store.as_ref()).await;
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    /// Halt the worker and drain everything still pending
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Self::flush(&self.pending, self.store.as_ref()).await;
    }

    /// Swap the pending map out and flush the batch it held
    ///
    /// New submits land in the fresh map while the swapped batch is in
    /// flight; no lock is held across store I/O.
    async fn flush(pending: &Mutex<PendingMap>, store: &dyn CounterStore) {
        let batch = {
            let mut pending = pending.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        let mut slots: HashMap<u16, Vec<(String, PendingCounter)>> = HashMap::new();
        for (key, entry) in batch {
            slots.entry(store.slot_of(&key)).or_default().push((key, entry));
        }

        futures::future::join_all(
            slots
                .into_values()
                .map(|entries| Self::flush_slot(store, entries)),
        )
        .await;
    }

    /// Flush one slot's coalesced increments as a single pipeline
    async fn flush_slot(store: &dyn CounterStore, entries: Vec<(String, PendingCounter)>) {
        let mut pipeline = Pipeline::new();
        for (key, entry) in &entries {
            pipeline.push(CounterOp::IncrBy {
                key: key.clone(),
                delta: entry.total_hits,
            });
            pipeline.push(CounterOp::Expire {
                key: key.clone(),
                seconds: entry.ttl_seconds,
            });
        }

        match store.execute_pipeline(&pipeline).await {
            Ok(replies) => {
                for (index, (_, entry)) in entries.into_iter().enumerate() {
                    // Op order per key: IncrBy at 2i, Expire at 2i + 1
                    match replies.get(index * 2).and_then(OpReply::value) {
                        Some(final_count) => {
                            Self::deliver(entry.waiters, final_count.max(0) as u64);
                        }
                        None => Self::deliver_error(
                            entry.waiters,
                            StoreError::Protocol("increment returned no value".to_string()),
                        ),
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "hot key flush failed");
                for (_, entry) in entries {
                    Self::deliver_error(entry.waiters, error.clone());
                }
            }
        }
    }

    /// Allocate per-waiter results from the post-batch counter value
    ///
    /// Walking the waiter list in reverse from `final_count` yields, for
    /// each waiter, the counter as it stood once its own increment had been
    /// applied in submit order; a forward walk from a pre-read value would
    /// be stale by flush time.
    fn deliver(waiters: Vec<Waiter>, final_count: u64) {
        let mut running = final_count;
        for waiter in waiters.into_iter().rev() {
            let _ = waiter.tx.send(Ok(running));
            running = running.saturating_sub(waiter.hits);
        }
    }

    fn deliver_error(waiters: Vec<Waiter>, error: StoreError) {
        for waiter in waiters {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    async fn flush_now(&self) {
        Self::flush(&self.pending, self.store.as_ref()).await;
    }
}
