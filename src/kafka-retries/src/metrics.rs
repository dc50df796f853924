// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Metric events emitted by the retry dispatcher.

use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::record::TopicPartition;

/// Reason tag attached to [`RetryEvent::BlockingRetryHandlerInvocationFailed`].
pub const RETRIABLE_ERROR_REASON: &str = "RetriableError";

/// An observable event in the life of a retried record.
///
/// Events are fire-and-forget and carry no ordering guarantee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryEvent {
    /// A blocking retry re-invoked the handler and the handler failed
    /// with a retriable error.
    BlockingRetryHandlerInvocationFailed {
        /// The partition being retried.
        topic_partition: TopicPartition,
        /// The offset of the failing record.
        offset: i64,
        /// The failure classification, always [`RETRIABLE_ERROR_REASON`].
        reason: &'static str,
    },
    /// A blocking retry was skipped by a consume-once operator override.
    BlockingIgnoredOnceFor {
        /// The partition whose retry was skipped.
        topic_partition: TopicPartition,
        /// The offset of the skipped record.
        offset: i64,
    },
    /// A blocking retry was skipped by a durable operator override.
    BlockingIgnoredForAllFor {
        /// The partition whose retry was skipped.
        topic_partition: TopicPartition,
        /// The offset of the skipped record.
        offset: i64,
    },
    /// The handler failed permanently; the record was consumed without
    /// retry.
    NoRetryOnNonRetryableFailure {
        /// The partition of the failed record.
        topic_partition: TopicPartition,
        /// The offset of the failed record.
        offset: i64,
        /// The rendered permanent-failure cause.
        cause: String,
    },
}

/// A sink for [`RetryEvent`]s.
pub trait MetricsSink: fmt::Debug + Send + Sync {
    /// Reports one event. Must not block.
    fn report(&self, event: RetryEvent);
}

/// A [`MetricsSink`] that logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn report(&self, event: RetryEvent) {
        match event {
            RetryEvent::BlockingRetryHandlerInvocationFailed {
                topic_partition,
                offset,
                reason,
            } => warn!(
                %topic_partition,
                offset, reason, "blocking retry handler invocation failed"
            ),
            RetryEvent::BlockingIgnoredOnceFor {
                topic_partition,
                offset,
            } => info!(%topic_partition, offset, "blocking retry ignored once"),
            RetryEvent::BlockingIgnoredForAllFor {
                topic_partition,
                offset,
            } => info!(%topic_partition, offset, "blocking retry ignored (ignore-all)"),
            RetryEvent::NoRetryOnNonRetryableFailure {
                topic_partition,
                offset,
                cause,
            } => warn!(
                %topic_partition,
                offset, %cause, "non-retriable failure consumed without retry"
            ),
        }
    }
}

/// A [`MetricsSink`] that records events in memory, for tests.
#[derive(Debug, Default)]
pub struct VecMetricsSink {
    events: Mutex<Vec<RetryEvent>>,
}

impl VecMetricsSink {
    /// The events reported so far, in report order.
    pub fn events(&self) -> Vec<RetryEvent> {
        self.events.lock().expect("poisoned").clone()
    }
}

impl MetricsSink for VecMetricsSink {
    fn report(&self, event: RetryEvent) {
        self.events.lock().expect("poisoned").push(event);
    }
}
