//! Task generations
//!
//! Every message dispatched between two checkpoint cycles belongs to one
//! generation. Sealing a generation freezes its membership; draining it waits
//! for every task in it, which is the barrier a checkpoint commit sits behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::{Id, JoinError, JoinSet};
use viewsync_types::Message;

use super::apply::{apply_message, Applied, ApplyPolicy, TaskOutput};
use crate::error::{ProcessorError, Result};
use crate::materializer::Materializer;

/// Completion counts of a drained generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DrainSummary {
    /// Highest offset dispatched into the generation
    pub highest: Option<i64>,
    /// Messages the materializer applied
    pub applied: u64,
    /// Malformed messages dropped by the decode policy
    pub skipped: u64,
}

/// Apply tasks dispatched since the last seal
pub(crate) struct TaskGeneration {
    id: u64,
    tasks: JoinSet<TaskOutput>,
    task_offsets: HashMap<Id, i64>,
    offsets: BTreeMap<i64, usize>,
    in_flight: usize,
    dispatched: usize,
    summary: DrainSummary,
}

impl TaskGeneration {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            tasks: JoinSet::new(),
            task_offsets: HashMap::new(),
            offsets: BTreeMap::new(),
            in_flight: 0,
            dispatched: 0,
            summary: DrainSummary::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Spawn an apply task for `message`
    pub fn dispatch(
        &mut self,
        message: Message,
        materializer: Arc<dyn Materializer>,
        policy: Arc<ApplyPolicy>,
    ) {
        let offset = message.offset;
        *self.offsets.entry(offset).or_insert(0) += 1;
        self.in_flight += 1;
        self.dispatched += 1;
        self.summary.highest = Some(self.summary.highest.map_or(offset, |h| h.max(offset)));
        let task = self.tasks.spawn(apply_message(message, materializer, policy));
        self.task_offsets.insert(task.id(), offset);
    }

    /// Messages dispatched into this generation
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Messages dispatched and not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched == 0
    }

    /// Highest offset dispatched so far
    pub fn highest_offset(&self) -> Option<i64> {
        self.summary.highest
    }

    /// Lowest offset still being applied
    pub fn oldest_in_flight(&self) -> Option<i64> {
        self.offsets.keys().next().copied()
    }

    /// Wait for the next task to finish
    ///
    /// Returns `None` when no task is outstanding. Cancel safe.
    pub async fn join_next(&mut self) -> Option<Result<i64>> {
        let joined = self.tasks.join_next_with_id().await?;
        Some(self.complete(joined))
    }

    fn complete(
        &mut self,
        joined: std::result::Result<(Id, TaskOutput), JoinError>,
    ) -> Result<i64> {
        let (offset, outcome) = match joined {
            Ok((id, (offset, outcome))) => {
                self.release(id);
                (offset, outcome)
            }
            Err(e) => {
                return Err(ProcessorError::TaskAborted {
                    offset: self.release(e.id()),
                    reason: e.to_string(),
                });
            }
        };

        match outcome? {
            Applied::Applied => self.summary.applied += 1,
            Applied::Skipped => self.summary.skipped += 1,
        }
        Ok(offset)
    }

    /// Forget a finished task, returning the offset it was applying
    fn release(&mut self, id: Id) -> Option<i64> {
        let offset = self.task_offsets.remove(&id)?;
        self.in_flight -= 1;
        if let Some(count) = self.offsets.get_mut(&offset) {
            *count -= 1;
            if *count == 0 {
                self.offsets.remove(&offset);
            }
        }
        Some(offset)
    }

    /// Freeze membership; no task can be added afterwards
    pub fn seal(self) -> SealedGeneration {
        SealedGeneration { inner: self }
    }
}

/// A generation whose membership is fixed
pub(crate) struct SealedGeneration {
    inner: TaskGeneration,
}

impl SealedGeneration {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn dispatched(&self) -> usize {
        self.inner.dispatched
    }

    /// Offset a checkpoint may take once the generation has drained
    pub fn highest_offset(&self) -> Option<i64> {
        self.inner.highest_offset()
    }

    /// Wait for every task of the generation
    ///
    /// Stops at the first failed task; the remaining tasks are aborted when
    /// the generation is dropped.
    pub async fn drain(mut self) -> Result<DrainSummary> {
        while let Some(done) = self.inner.join_next().await {
            done?;
        }
        debug_assert_eq!(self.inner.in_flight(), 0);
        Ok(self.inner.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplyFailurePolicy, DecodeFailurePolicy};
    use crate::error::{ApplyError, ApplyResult};
    use crate::materializer::materializer_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn policy() -> Arc<ApplyPolicy> {
        Arc::new(ApplyPolicy {
            failure: ApplyFailurePolicy::Fatal,
            decode: DecodeFailurePolicy::Fatal,
            timeout: None,
        })
    }

    fn slow_counter(done: Arc<AtomicUsize>) -> Arc<dyn Materializer> {
        Arc::new(materializer_fn(move |msg: Message| {
            let done = done.clone();
            async move {
                // earlier offsets take longer so completions arrive reversed
                tokio::time::sleep(Duration::from_millis(50 - msg.offset as u64)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn test_drain_waits_for_every_task() {
        let done = Arc::new(AtomicUsize::new(0));
        let materializer = slow_counter(done.clone());

        let mut generation = TaskGeneration::new(1);
        for offset in 1..=20 {
            generation.dispatch(Message::upsert("k", "v", offset), materializer.clone(), policy());
        }
        assert_eq!(generation.dispatched(), 20);
        assert_eq!(generation.in_flight(), 20);
        assert_eq!(generation.oldest_in_flight(), Some(1));
        assert_eq!(generation.highest_offset(), Some(20));

        let summary = generation.seal().drain().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(summary.highest, Some(20));
        assert_eq!(summary.applied, 20);
    }

    #[tokio::test]
    async fn test_reaped_completions_count_towards_summary() {
        let done = Arc::new(AtomicUsize::new(0));
        let materializer = slow_counter(done);

        let mut generation = TaskGeneration::new(1);
        generation.dispatch(Message::upsert("a", "v", 40), materializer.clone(), policy());
        generation.dispatch(Message::upsert("b", "v", 10), materializer, policy());

        assert_eq!(generation.join_next().await.unwrap().unwrap(), 40);
        assert_eq!(generation.in_flight(), 1);
        assert_eq!(generation.oldest_in_flight(), Some(10));

        let summary = generation.seal().drain().await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.highest, Some(40));
    }

    #[tokio::test]
    async fn test_drain_surfaces_failure() {
        let materializer: Arc<dyn Materializer> =
            Arc::new(materializer_fn(|msg: Message| async move {
                if msg.offset == 3 {
                    Err(ApplyError::Other("boom".into()))
                } else {
                    Ok(())
                }
            }));

        let mut generation = TaskGeneration::new(2);
        for offset in 1..=5 {
            generation.dispatch(Message::upsert("k", "v", offset), materializer.clone(), policy());
        }

        let err = generation.seal().drain().await.unwrap_err();
        assert_eq!(err.offset(), Some(3));
    }

    #[tokio::test]
    async fn test_panicking_task_is_aborted_error() {
        let materializer: Arc<dyn Materializer> =
            Arc::new(materializer_fn(|msg: Message| async move {
                if msg.offset > 0 {
                    panic!("materializer bug");
                }
                Ok(())
            }));

        let mut generation = TaskGeneration::new(3);
        generation.dispatch(Message::upsert("k", "v", 7), materializer, policy());

        let err = generation.join_next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProcessorError::TaskAborted { offset: Some(7), .. }));
        assert_eq!(err.offset(), Some(7));
        assert_eq!(generation.in_flight(), 0);
        assert_eq!(generation.oldest_in_flight(), None);
    }

    #[tokio::test]
    async fn test_in_flight_tracks_large_generation() {
        let materializer: Arc<dyn Materializer> =
            Arc::new(materializer_fn(|_msg: Message| std::future::pending::<ApplyResult<()>>()));

        let mut generation = TaskGeneration::new(4);
        for offset in 1..=65_536 {
            generation.dispatch(Message::upsert("k", "v", offset), materializer.clone(), policy());
            assert_eq!(generation.in_flight(), offset as usize);
        }
        assert_eq!(generation.oldest_in_flight(), Some(1));
    }

    #[tokio::test]
    async fn test_empty_generation() {
        let mut generation = TaskGeneration::new(0);
        assert!(generation.is_empty());
        assert!(generation.join_next().await.is_none());

        let summary = generation.seal().drain().await.unwrap();
        assert_eq!(summary, DrainSummary::default());
    }
}
