// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The top-level retry dispatcher.
//!
//! [`with_retries`] wraps a user-supplied [`RecordHandler`] with the retry
//! policy. The wrapped handler's [`handle`](RetryingHandler::handle)
//! returns success exactly when the record may be acknowledged; offset
//! management stays with the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::blocking::{self, BlockingOutcome};
use crate::config::RetryConfig;
use crate::error::HandlerError;
use crate::headers::{self, RetrySchedule};
use crate::metrics::{MetricsSink, RetryEvent};
use crate::now::{self, NowFn};
use crate::policy::{RetryAction, RetryPolicy, RetryTopics};
use crate::producer::{self, Producer};
use crate::record::ConsumerRecord;
use crate::state::{BlockingState, BlockingStateStore, BlockingTarget};

/// The user-supplied record handler wrapped by the dispatcher.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Processes one record.
    async fn apply(&self, record: &ConsumerRecord) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> RecordHandler for Arc<H>
where
    H: RecordHandler + ?Sized,
{
    async fn apply(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
        (**self).apply(record).await
    }
}

/// Wraps `handler` with retry dispatch under `config`.
///
/// `topics` names the consumer group whose retry topics this dispatcher
/// recognizes and publishes to; `store` is shared with the operator
/// control path.
pub fn with_retries<H, P>(
    handler: H,
    config: RetryConfig,
    topics: RetryTopics,
    producer: P,
    store: BlockingStateStore,
    metrics: Arc<dyn MetricsSink>,
    now: NowFn,
) -> RetryingHandler<H, P>
where
    H: RecordHandler,
    P: Producer,
{
    RetryingHandler {
        handler,
        policy: RetryPolicy::new(config, topics),
        producer,
        store,
        metrics,
        now,
    }
}

/// A record handler that retries failures per the configured policy.
pub struct RetryingHandler<H, P> {
    handler: H,
    policy: RetryPolicy,
    producer: P,
    store: BlockingStateStore,
    metrics: Arc<dyn MetricsSink>,
    now: NowFn,
}

impl<H, P> RetryingHandler<H, P>
where
    H: RecordHandler,
    P: Producer,
{
    /// The blocking state store this dispatcher consults.
    pub fn store(&self) -> &BlockingStateStore {
        &self.store
    }

    /// The active retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatches one record.
    ///
    /// Returns `Ok` exactly when the record may be acknowledged: the
    /// handler succeeded, the failure was permanent (consumed with a
    /// metric), an operator skipped the retry, or the record was handed
    /// off to a retry topic. Returns a retriable error when the schedule
    /// is exhausted or the retry publish fails; the caller decides whether
    /// to re-poll.
    pub async fn handle(&self, record: &ConsumerRecord) -> Result<(), HandlerError> {
        let tp = record.topic_partition();

        // Records replayed from a retry topic carry their schedule in
        // headers. A record that claims to be a retry but cannot be
        // decoded is a permanent fault.
        let schedule = if self.policy.topics().parse(&record.topic).is_some() {
            match headers::decode(record) {
                Ok(schedule) => schedule,
                Err(err) => {
                    warn!(
                        topic_partition = %tp,
                        offset = record.offset,
                        %err,
                        "undecodable retry headers; consuming record without retry"
                    );
                    self.metrics.report(RetryEvent::NoRetryOnNonRetryableFailure {
                        topic_partition: tp,
                        offset: record.offset,
                        cause: err.to_string(),
                    });
                    return Ok(());
                }
            }
        } else {
            None
        };

        // A durable ignore-all override short-circuits the record before
        // the handler sees it, so a drained partition makes progress even
        // while the handler keeps failing.
        if self.policy.config().blocking_schedule().is_some() && self.is_ignoring_all(record) {
            self.metrics.report(RetryEvent::BlockingIgnoredForAllFor {
                topic_partition: tp,
                offset: record.offset,
            });
            return Ok(());
        }

        // Honor the embedded delivery time. This is a durable schedule,
        // not a blocking retry: it is not released by the control store.
        if let Some(schedule) = &schedule {
            let now = self.now.now();
            let deliver_at = schedule.deliver_at();
            if deliver_at > now {
                let delay = deliver_at - now;
                debug!(
                    topic_partition = %tp,
                    offset = record.offset,
                    delay_ms = delay,
                    deliver_at = %render_instant(deliver_at),
                    "delaying replayed retry record until its delivery time"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        match self.handler.apply(record).await {
            Ok(()) => Ok(()),
            Err(HandlerError::NonRetriable(cause)) => {
                self.metrics.report(RetryEvent::NoRetryOnNonRetryableFailure {
                    topic_partition: tp,
                    offset: record.offset,
                    cause: cause.to_string(),
                });
                Ok(())
            }
            Err(err @ HandlerError::Retriable(_)) => {
                self.recover(record, schedule.as_ref(), err).await
            }
        }
    }

    /// Applies the policy's action for a retriable failure.
    async fn recover(
        &self,
        record: &ConsumerRecord,
        schedule: Option<&RetrySchedule>,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        match self.policy.on_retriable_failure(record, schedule) {
            RetryAction::BlockingRetry => {
                let blocking_schedule = self
                    .policy
                    .config()
                    .blocking_schedule()
                    .expect("BlockingRetry implies a blocking schedule");
                let outcome = blocking::run(
                    &self.handler,
                    &self.store,
                    &*self.metrics,
                    record,
                    blocking_schedule,
                )
                .await;
                match outcome {
                    BlockingOutcome::Resolved => Ok(()),
                    BlockingOutcome::Exhausted => match self.policy.on_blocking_exhausted(record) {
                        RetryAction::NonBlockingRepublish {
                            topic,
                            attempt,
                            backoff,
                        } => self.republish(record, topic, attempt, backoff).await,
                        _ => {
                            warn!(
                                topic_partition = %record.topic_partition(),
                                offset = record.offset,
                                "blocking retries exhausted; surfacing failure"
                            );
                            Err(err)
                        }
                    },
                }
            }
            RetryAction::NonBlockingRepublish {
                topic,
                attempt,
                backoff,
            } => self.republish(record, topic, attempt, backoff).await,
            RetryAction::TerminalGiveUp => {
                warn!(
                    topic_partition = %record.topic_partition(),
                    offset = record.offset,
                    "retry schedule exhausted; surfacing failure"
                );
                Err(err)
            }
        }
    }

    /// Publishes `record` to the retry topic for `attempt`.
    async fn republish(
        &self,
        record: &ConsumerRecord,
        topic: String,
        attempt: i32,
        backoff: Duration,
    ) -> Result<(), HandlerError> {
        let produced = producer::retry_record(record, topic, attempt, self.now.now(), backoff);
        debug!(
            from = %record.topic_partition(),
            offset = record.offset,
            to = %produced.topic,
            attempt,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "republishing failed record to retry topic"
        );
        self.producer.produce(produced).await.map_err(|err| {
            warn!(%err, "retry republish failed");
            HandlerError::Retriable(err.to_string())
        })
    }

    fn is_ignoring_all(&self, record: &ConsumerRecord) -> bool {
        let partition_target = BlockingTarget::partition(record.topic.clone(), record.partition);
        let topic_target = BlockingTarget::topic(record.topic.clone());
        self.store.get(&partition_target) == BlockingState::IgnoringAll
            || self.store.get(&topic_target) == BlockingState::IgnoringAll
    }
}

fn render_instant(millis: u64) -> String {
    match now::to_datetime(millis) {
        Some(dt) => dt.to_rfc3339(),
        None => millis.to_string(),
    }
}
