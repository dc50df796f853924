// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The shared control state for blocking retries.
//!
//! Operators steer in-flight blocking retries through a
//! [`BlockingStateStore`]: installing [`BlockingState::IgnoringOnce`] under
//! a target skips the next matching retry, [`BlockingState::IgnoringAll`]
//! skips every matching retry until the entry is reset. The blocking retry
//! loop publishes the record it is holding as [`BlockingState::Blocked`] so
//! operators can inspect what a stuck partition is chewing on.
//!
//! Every write signals a watch channel, which is how sleeping retry loops
//! learn about overrides ahead of their timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::record::{ConsumerRecord, HeaderList, TopicPartition};

/// The scope of an operator override.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockingTarget {
    /// Every partition of a topic.
    Topic(String),
    /// A single partition.
    Partition(TopicPartition),
}

impl BlockingTarget {
    /// A target covering every partition of `topic`.
    pub fn topic(topic: impl Into<String>) -> BlockingTarget {
        BlockingTarget::Topic(topic.into())
    }

    /// A target covering a single partition.
    pub fn partition(topic: impl Into<String>, partition: i32) -> BlockingTarget {
        BlockingTarget::Partition(TopicPartition::new(topic, partition))
    }
}

/// The control state of a blocking target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockingState {
    /// Normal operation: blocking retries sleep and re-invoke the handler.
    Blocking,
    /// A blocking retry loop is holding this record while it awaits the
    /// next attempt. Written only by the retry loop, only under a
    /// partition-shaped target.
    Blocked {
        /// The held record's key.
        key: Option<Vec<u8>>,
        /// The held record's value.
        value: Vec<u8>,
        /// The held record's headers.
        headers: HeaderList,
        /// The partition the loop is holding.
        topic_partition: TopicPartition,
        /// The held record's offset.
        offset: i64,
    },
    /// Skip the next matching blocking retry, then return to `Blocking`.
    IgnoringOnce,
    /// Skip every matching blocking retry until the entry is changed.
    IgnoringAll,
}

impl BlockingState {
    fn blocked_record(
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: HeaderList,
        tp: TopicPartition,
        offset: i64,
    ) -> BlockingState {
        BlockingState::Blocked {
            key,
            value,
            headers,
            topic_partition: tp,
            offset,
        }
    }
}

/// A concurrent map from [`BlockingTarget`] to [`BlockingState`], shared
/// between the dispatcher and the operator control path.
///
/// Handles are cheap to clone; all clones observe the same state. Reads and
/// writes are atomic per key, and [`BlockingStateStore::update_and_get`]
/// gives read-modify-write atomicity against concurrent writers.
#[derive(Clone, Debug)]
pub struct BlockingStateStore {
    states: Arc<Mutex<HashMap<BlockingTarget, BlockingState>>>,
    changed: Arc<watch::Sender<()>>,
}

impl Default for BlockingStateStore {
    fn default() -> BlockingStateStore {
        BlockingStateStore::new()
    }
}

impl BlockingStateStore {
    /// Creates an empty store; every target starts out `Blocking`.
    pub fn new() -> BlockingStateStore {
        let (changed, _) = watch::channel(());
        BlockingStateStore {
            states: Arc::new(Mutex::new(HashMap::new())),
            changed: Arc::new(changed),
        }
    }

    /// Returns the state of `target`. Absent entries read as
    /// [`BlockingState::Blocking`].
    pub fn get(&self, target: &BlockingTarget) -> BlockingState {
        let states = self.states.lock().expect("poisoned");
        states.get(target).cloned().unwrap_or(BlockingState::Blocking)
    }

    /// Unconditionally replaces the state of `target`.
    ///
    /// Storing [`BlockingState::Blocking`] removes the entry, since absence
    /// and `Blocking` are equivalent.
    pub fn set(&self, target: &BlockingTarget, state: BlockingState) {
        {
            let mut states = self.states.lock().expect("poisoned");
            if state == BlockingState::Blocking {
                states.remove(target);
            } else {
                states.insert(target.clone(), state);
            }
        }
        self.changed.send_replace(());
    }

    /// Atomically replaces the state of `target` with `f(current)` and
    /// returns the new state.
    pub fn update_and_get(
        &self,
        target: &BlockingTarget,
        f: impl FnOnce(&BlockingState) -> BlockingState,
    ) -> BlockingState {
        let new = {
            let mut states = self.states.lock().expect("poisoned");
            let current = states.get(target).cloned().unwrap_or(BlockingState::Blocking);
            let new = f(&current);
            if new == BlockingState::Blocking {
                states.remove(target);
            } else {
                states.insert(target.clone(), new.clone());
            }
            new
        };
        self.changed.send_replace(());
        new
    }

    /// Skip the next blocking retry matched by `target`.
    pub fn ignore_once(&self, target: &BlockingTarget) {
        self.set(target, BlockingState::IgnoringOnce);
    }

    /// Skip every blocking retry matched by `target` until the entry is
    /// reset.
    pub fn ignore_all(&self, target: &BlockingTarget) {
        self.set(target, BlockingState::IgnoringAll);
    }

    /// Clears any override or in-flight marker on `target`, restoring
    /// normal retries.
    pub fn resume(&self, target: &BlockingTarget) {
        self.set(target, BlockingState::Blocking);
    }

    /// The records currently held by blocking retry loops, keyed by
    /// partition.
    pub fn blocked(&self) -> Vec<(TopicPartition, i64)> {
        let states = self.states.lock().expect("poisoned");
        let mut held: Vec<_> = states
            .values()
            .filter_map(|state| match state {
                BlockingState::Blocked {
                    topic_partition,
                    offset,
                    ..
                } => Some((topic_partition.clone(), *offset)),
                _ => None,
            })
            .collect();
        held.sort();
        held
    }

    /// Subscribes to store writes.
    ///
    /// The returned receiver resolves `changed()` after any write that
    /// happens after this call, which lets sleepers re-check the store
    /// without missed wakeups.
    pub fn watch(&self) -> watch::Receiver<()> {
        self.changed.subscribe()
    }

    /// Marks `record` as held by a blocking retry loop.
    pub(crate) fn mark_blocked(&self, record: &ConsumerRecord) {
        let tp = record.topic_partition();
        self.set(
            &BlockingTarget::Partition(tp.clone()),
            BlockingState::blocked_record(
                record.key.clone(),
                record.value.clone(),
                record.headers.clone(),
                tp,
                record.offset,
            ),
        );
    }

    /// Clears a `Blocked` marker on `target`, leaving any operator
    /// override in place.
    pub(crate) fn clear_blocked(&self, target: &BlockingTarget) {
        self.update_and_get(target, |state| match state {
            BlockingState::Blocked { .. } => BlockingState::Blocking,
            other => other.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_reads_as_blocking() {
        let store = BlockingStateStore::new();
        let target = BlockingTarget::topic("events");
        assert_eq!(store.get(&target), BlockingState::Blocking);
    }

    #[test]
    fn test_set_blocking_removes_entry() {
        let store = BlockingStateStore::new();
        let target = BlockingTarget::partition("events", 3);
        store.ignore_all(&target);
        assert_eq!(store.get(&target), BlockingState::IgnoringAll);
        store.resume(&target);
        assert_eq!(store.get(&target), BlockingState::Blocking);
        assert!(store.states.lock().unwrap().is_empty());
    }

    #[test]
    fn test_consume_once_does_not_clobber_ignore_all() {
        let store = BlockingStateStore::new();
        let target = BlockingTarget::partition("events", 0);

        // Consuming IgnoringOnce transitions to Blocking.
        store.ignore_once(&target);
        let new = store.update_and_get(&target, |state| match state {
            BlockingState::IgnoringOnce => BlockingState::Blocking,
            other => other.clone(),
        });
        assert_eq!(new, BlockingState::Blocking);

        // The same compare-and-set leaves a concurrently installed
        // IgnoringAll alone.
        store.ignore_all(&target);
        let new = store.update_and_get(&target, |state| match state {
            BlockingState::IgnoringOnce => BlockingState::Blocking,
            other => other.clone(),
        });
        assert_eq!(new, BlockingState::IgnoringAll);
    }

    #[test]
    fn test_clear_blocked_preserves_overrides() {
        let store = BlockingStateStore::new();
        let record = ConsumerRecord {
            topic: "events".into(),
            partition: 1,
            offset: 42,
            key: Some(b"k".to_vec()),
            value: b"v".to_vec(),
            headers: vec![],
        };
        let target = BlockingTarget::partition("events", 1);

        store.mark_blocked(&record);
        assert_eq!(store.blocked(), vec![(TopicPartition::new("events", 1), 42)]);
        store.clear_blocked(&target);
        assert_eq!(store.get(&target), BlockingState::Blocking);

        store.ignore_all(&target);
        store.clear_blocked(&target);
        assert_eq!(store.get(&target), BlockingState::IgnoringAll);
    }

    #[tokio::test]
    async fn test_watch_signals_writes() {
        let store = BlockingStateStore::new();
        let mut changes = store.watch();
        store.ignore_once(&BlockingTarget::topic("events"));
        changes.changed().await.expect("sender alive");
    }
}
