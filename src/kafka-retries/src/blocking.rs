// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-place retries that hold the consuming partition.
//!
//! The loop sleeps through the configured backoffs and re-invokes the
//! handler, publishing the held record in the state store as
//! [`BlockingState::Blocked`]. The sleep races against the store's watch
//! channel, so an operator override installed mid-backoff releases the
//! partition without waiting for the timer. After the timer fires the store
//! is read once more before the handler runs, so an override that raced the
//! timer is still honored.

use tracing::debug;

use crate::config::BlockingSchedule;
use crate::error::HandlerError;
use crate::handler::RecordHandler;
use crate::metrics::{MetricsSink, RetryEvent, RETRIABLE_ERROR_REASON};
use crate::record::{ConsumerRecord, TopicPartition};
use crate::state::{BlockingState, BlockingStateStore, BlockingTarget};

/// How a blocking retry run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockingOutcome {
    /// The record may be acknowledged: the handler succeeded, an operator
    /// skipped the retry, or the failure was permanent.
    Resolved,
    /// The finite schedule ran dry and the record still fails.
    Exhausted,
}

/// An operator override matched against a record, in precedence order:
/// ignore-all under either target shape outranks ignore-once.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Override {
    All,
    Once(BlockingTarget),
}

/// Runs the blocking retry schedule for `record` after an initial
/// retriable failure.
pub(crate) async fn run<H>(
    handler: &H,
    store: &BlockingStateStore,
    metrics: &dyn MetricsSink,
    record: &ConsumerRecord,
    schedule: BlockingSchedule<'_>,
) -> BlockingOutcome
where
    H: RecordHandler + ?Sized,
{
    let tp = record.topic_partition();
    let partition_target = BlockingTarget::Partition(tp.clone());
    let topic_target = BlockingTarget::Topic(record.topic.clone());
    // Clears the `Blocked` marker on every exit path, including
    // cancellation of the enclosing task.
    let _blocked = BlockedGuard {
        store,
        target: &partition_target,
    };

    let mut attempt = 0;
    loop {
        let backoff = match schedule.backoff(attempt) {
            Some(backoff) => backoff,
            None => return BlockingOutcome::Exhausted,
        };

        if let Some(matched) = observe_override(store, &partition_target, &topic_target) {
            apply_override(store, metrics, matched, &tp, record.offset);
            return BlockingOutcome::Resolved;
        }

        store.mark_blocked(record);
        debug!(
            topic_partition = %tp,
            offset = record.offset,
            attempt,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "scheduling blocking retry"
        );

        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        let released = loop {
            let mut changes = store.watch();
            if let Some(matched) = observe_override(store, &partition_target, &topic_target) {
                break Some(matched);
            }
            tokio::select! {
                _ = &mut sleep => {
                    // A write can race the timer; read once more so the
                    // wake is linearizable with the store.
                    break observe_override(store, &partition_target, &topic_target);
                }
                _ = changes.changed() => {}
            }
        };
        if let Some(matched) = released {
            store.clear_blocked(&partition_target);
            apply_override(store, metrics, matched, &tp, record.offset);
            return BlockingOutcome::Resolved;
        }

        match handler.apply(record).await {
            Ok(()) => return BlockingOutcome::Resolved,
            Err(HandlerError::Retriable(reason)) => {
                metrics.report(RetryEvent::BlockingRetryHandlerInvocationFailed {
                    topic_partition: tp.clone(),
                    offset: record.offset,
                    reason: RETRIABLE_ERROR_REASON,
                });
                debug!(
                    topic_partition = %tp,
                    offset = record.offset,
                    attempt,
                    %reason,
                    "blocking retry failed"
                );
            }
            Err(HandlerError::NonRetriable(cause)) => {
                metrics.report(RetryEvent::NoRetryOnNonRetryableFailure {
                    topic_partition: tp.clone(),
                    offset: record.offset,
                    cause: cause.to_string(),
                });
                return BlockingOutcome::Resolved;
            }
        }
        attempt += 1;
    }
}

/// Reads both target shapes and returns the matching override, if any.
///
/// Precedence is first match in order: ignore-all under the partition
/// target, ignore-all under the topic target, then ignore-once under the
/// partition and topic targets.
fn observe_override(
    store: &BlockingStateStore,
    partition_target: &BlockingTarget,
    topic_target: &BlockingTarget,
) -> Option<Override> {
    let partition_state = store.get(partition_target);
    let topic_state = store.get(topic_target);
    if partition_state == BlockingState::IgnoringAll || topic_state == BlockingState::IgnoringAll {
        return Some(Override::All);
    }
    if partition_state == BlockingState::IgnoringOnce {
        return Some(Override::Once(partition_target.clone()));
    }
    if topic_state == BlockingState::IgnoringOnce {
        return Some(Override::Once(topic_target.clone()));
    }
    None
}

/// Emits the skip metric and, for ignore-once, consumes the override.
fn apply_override(
    store: &BlockingStateStore,
    metrics: &dyn MetricsSink,
    matched: Override,
    tp: &TopicPartition,
    offset: i64,
) {
    match matched {
        Override::All => {
            metrics.report(RetryEvent::BlockingIgnoredForAllFor {
                topic_partition: tp.clone(),
                offset,
            });
        }
        Override::Once(target) => {
            // Compare-and-set against IgnoringOnce specifically: an
            // operator may have swapped in IgnoringAll since we observed
            // the state, and that must survive.
            store.update_and_get(&target, |state| match state {
                BlockingState::IgnoringOnce => BlockingState::Blocking,
                other => other.clone(),
            });
            metrics.report(RetryEvent::BlockingIgnoredOnceFor {
                topic_partition: tp.clone(),
                offset,
            });
        }
    }
}

struct BlockedGuard<'a> {
    store: &'a BlockingStateStore,
    target: &'a BlockingTarget,
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.store.clear_blocked(self.target);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::metrics::VecMetricsSink;

    #[derive(Debug)]
    struct FailingHandler {
        invocations: AtomicUsize,
        failures_before_success: usize,
    }

    impl FailingHandler {
        fn failing_forever() -> FailingHandler {
            FailingHandler {
                invocations: AtomicUsize::new(0),
                failures_before_success: usize::MAX,
            }
        }

        fn failing(failures_before_success: usize) -> FailingHandler {
            FailingHandler {
                invocations: AtomicUsize::new(0),
                failures_before_success,
            }
        }

        fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecordHandler for FailingHandler {
        async fn apply(&self, _record: &ConsumerRecord) -> Result<(), HandlerError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(HandlerError::retriable("transient"))
            } else {
                Ok(())
            }
        }
    }

    fn record() -> ConsumerRecord {
        ConsumerRecord {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            key: Some(b"k".to_vec()),
            value: b"v".to_vec(),
            headers: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_mid_schedule_resolves() {
        let store = BlockingStateStore::new();
        let metrics = VecMetricsSink::default();
        let handler = FailingHandler::failing(1);
        let backoffs = [Duration::from_millis(10), Duration::from_millis(500)];

        let outcome = run(
            &handler,
            &store,
            &metrics,
            &record(),
            BlockingSchedule::Finite(&backoffs),
        )
        .await;

        assert_eq!(outcome, BlockingOutcome::Resolved);
        // One failed re-invocation, then one successful one.
        assert_eq!(handler.invocations(), 2);
        assert_eq!(
            store.get(&BlockingTarget::partition("t", 0)),
            BlockingState::Blocking
        );
        assert_eq!(metrics.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_restores_blocking() {
        let store = BlockingStateStore::new();
        let metrics = VecMetricsSink::default();
        let handler = FailingHandler::failing_forever();
        let backoffs = [Duration::from_millis(10), Duration::from_millis(500)];

        let outcome = run(
            &handler,
            &store,
            &metrics,
            &record(),
            BlockingSchedule::Finite(&backoffs),
        )
        .await;

        assert_eq!(outcome, BlockingOutcome::Exhausted);
        assert_eq!(handler.invocations(), 2);
        assert_eq!(
            store.get(&BlockingTarget::partition("t", 0)),
            BlockingState::Blocking
        );
        let failures = metrics
            .events()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    RetryEvent::BlockingRetryHandlerInvocationFailed { .. }
                )
            })
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_marker_visible_during_sleep() {
        let store = BlockingStateStore::new();
        let metrics = Arc::new(VecMetricsSink::default());
        let handler = Arc::new(FailingHandler::failing_forever());
        let backoffs = [Duration::from_secs(60)];

        let task = tokio::spawn({
            let store = store.clone();
            let metrics = Arc::clone(&metrics);
            let handler = Arc::clone(&handler);
            async move {
                run(
                    &*handler,
                    &store,
                    &*metrics,
                    &record(),
                    BlockingSchedule::Finite(&backoffs),
                )
                .await
            }
        });

        // Let the loop reach its sleep.
        tokio::task::yield_now().await;
        assert_eq!(
            store.blocked(),
            vec![(TopicPartition::new("t", 0), 0)]
        );

        // Release it ahead of time.
        store.ignore_once(&BlockingTarget::partition("t", 0));
        let outcome = task.await.unwrap();
        assert_eq!(outcome, BlockingOutcome::Resolved);
        assert_eq!(store.blocked(), vec![]);
        assert_eq!(handler.invocations(), 0);
        assert_eq!(
            metrics.events(),
            vec![RetryEvent::BlockingIgnoredOnceFor {
                topic_partition: TopicPartition::new("t", 0),
                offset: 0,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_all_outranks_ignore_once() {
        let store = BlockingStateStore::new();
        let metrics = VecMetricsSink::default();
        let handler = FailingHandler::failing_forever();
        let backoffs = [Duration::from_millis(10)];

        store.ignore_once(&BlockingTarget::partition("t", 0));
        store.ignore_all(&BlockingTarget::topic("t"));

        let outcome = run(
            &handler,
            &store,
            &metrics,
            &record(),
            BlockingSchedule::Finite(&backoffs),
        )
        .await;

        assert_eq!(outcome, BlockingOutcome::Resolved);
        assert_eq!(handler.invocations(), 0);
        assert_eq!(
            metrics.events(),
            vec![RetryEvent::BlockingIgnoredForAllFor {
                topic_partition: TopicPartition::new("t", 0),
                offset: 0,
            }]
        );
        // The ignore-once override was not consumed.
        assert_eq!(
            store.get(&BlockingTarget::partition("t", 0)),
            BlockingState::IgnoringOnce
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_schedule_runs_until_release() {
        let store = BlockingStateStore::new();
        let metrics = Arc::new(VecMetricsSink::default());
        let handler = Arc::new(FailingHandler::failing_forever());

        let task = tokio::spawn({
            let store = store.clone();
            let metrics = Arc::clone(&metrics);
            let handler = Arc::clone(&handler);
            async move {
                run(
                    &*handler,
                    &store,
                    &*metrics,
                    &record(),
                    BlockingSchedule::Infinite(Duration::from_millis(100)),
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(handler.invocations() >= 4);

        store.ignore_all(&BlockingTarget::topic("t"));
        let outcome = task.await.unwrap();
        assert_eq!(outcome, BlockingOutcome::Resolved);
    }
}
