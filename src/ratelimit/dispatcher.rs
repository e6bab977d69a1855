//! Slot-aware pipeline dispatch
//!
//! Counter operations for one request rarely share a shard slot. The
//! dispatcher groups them into per-slot pipelines, runs every non-empty
//! pipeline as its own task, and reports the first error if any pipeline
//! fails. Slot-to-node routing lives below, in the store driver; the
//! dispatcher's only topology responsibility is never mixing two slots in
//! one pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::store::{CounterOp, CounterStore, Pipeline, StoreError, StoreResult};

struct SlotPipeline {
    pipeline: Pipeline,
    // One entry per op: the result index its reply feeds, if any
    bindings: Vec<Option<usize>>,
}

/// Operations for one request, grouped by shard slot
#[derive(Default)]
pub struct SlotBatch {
    groups: HashMap<u16, SlotPipeline>,
}

impl SlotBatch {
    /// An empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation to its slot's pipeline
    ///
    /// When `binding` is set, the operation's counter reply is routed to
    /// that index of the dispatch result.
    pub fn push(&mut self, slot: u16, op: CounterOp, binding: Option<usize>) {
        let group = self.groups.entry(slot).or_insert_with(|| SlotPipeline {
            pipeline: Pipeline::new(),
            bindings: Vec::new(),
        });
        group.pipeline.push(op);
        group.bindings.push(binding);
    }

    /// Whether no operations have been appended
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of distinct slot pipelines
    pub fn pipeline_count(&self) -> usize {
        self.groups.len()
    }
}

/// Executes slot batches against a counter store
pub struct PipelineDispatcher {
    store: Arc<dyn CounterStore>,
}

impl PipelineDispatcher {
    /// A dispatcher over the given store
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// The store this dispatcher executes against
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// The shard slot for a key
    pub fn slot_of(&self, key: &str) -> u16 {
        self.store.slot_of(key)
    }

    /// Execute every slot pipeline concurrently
    ///
    /// Returns a vector of `result_len` counter values populated through the
    /// batch's bindings. If any pipeline fails the whole dispatch fails with
    /// the first error; the tasks are dropped (and thereby aborted) when the
    /// caller's future is cancelled.
    pub async fn dispatch(
        &self,
        batch: SlotBatch,
        result_len: usize,
    ) -> StoreResult<Vec<Option<i64>>> {
        let mut results = vec![None; result_len];
        if batch.is_empty() {
            return Ok(results);
        }

        let mut tasks = JoinSet::new();
        for (_, group) in batch.groups {
            let store = Arc::clone(&self.store);
            tasks.spawn(async move {
                let replies = store.execute_pipeline(&group.pipeline).await?;
                Ok::<_, StoreError>((group.bindings, replies))
            });
        }

        let mut first_error: Option<StoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((bindings, replies))) => {
                    for (binding, reply) in bindings.iter().zip(replies) {
                        if let Some(index) = binding {
                            results[*index] = reply.value();
                        }
                    }
                }
                Ok(Err(error)) => {
                    tracing::warn!(%error, "slot pipeline failed");
                    first_error.get_or_insert(error);
                }
                Err(join_error) => {
                    first_error
                        .get_or_insert(StoreError::Pipeline(format!("task failed: {join_error}")));
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, OpReply};
    use async_trait::async_trait;

    fn incr(key: &str, delta: u64) -> CounterOp {
        CounterOp::IncrBy {
            key: key.to_string(),
            delta,
        }
    }

    #[test]
    fn test_grouping_keeps_slots_apart() {
        let store = MemoryStore::clustered();
        let mut batch = SlotBatch::new();
        // "foo" and "bar" live on different slots
        batch.push(store.slot_of("foo"), incr("foo", 1), Some(0));
        batch.push(store.slot_of("bar"), incr("bar", 1), Some(1));
        batch.push(store.slot_of("foo"), incr("foo", 1), Some(2));
        assert_eq!(batch.pipeline_count(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_routes_results_by_binding() {
        let store = Arc::new(MemoryStore::clustered());
        let dispatcher = PipelineDispatcher::new(store.clone());

        let mut batch = SlotBatch::new();
        batch.push(dispatcher.slot_of("foo"), incr("foo", 3), Some(0));
        batch.push(
            dispatcher.slot_of("foo"),
            CounterOp::Expire {
                key: "foo".to_string(),
                seconds: 60,
            },
            None,
        );
        batch.push(dispatcher.slot_of("bar"), incr("bar", 5), Some(1));

        let results = dispatcher.dispatch(batch, 2).await.unwrap();
        assert_eq!(results, vec![Some(3), Some(5)]);
        // Two slots, two pipelines
        assert_eq!(store.stats().pipelines, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = PipelineDispatcher::new(store.clone());
        let results = dispatcher.dispatch(SlotBatch::new(), 3).await.unwrap();
        assert_eq!(results, vec![None, None, None]);
        assert_eq!(store.stats().pipelines, 0);
    }

    /// A store whose pipelines always fail
    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        fn is_clustered(&self) -> bool {
            true
        }

        fn slot_of(&self, key: &str) -> u16 {
            crate::store::key_slot(key)
        }

        async fn execute_pipeline(&self, _pipeline: &Pipeline) -> StoreResult<Vec<OpReply>> {
            Err(StoreError::Connection("node down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_any_pipeline_failure_fails_the_dispatch() {
        let dispatcher = PipelineDispatcher::new(Arc::new(FailingStore));
        let mut batch = SlotBatch::new();
        batch.push(dispatcher.slot_of("foo"), incr("foo", 1), Some(0));
        batch.push(dispatcher.slot_of("bar"), incr("bar", 1), Some(1));

        let error = dispatcher.dispatch(batch, 2).await.unwrap_err();
        assert!(matches!(error, StoreError::Connection(_)));
    }
}
