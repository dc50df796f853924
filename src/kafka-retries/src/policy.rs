// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Classification of failed records into retry actions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::headers::RetrySchedule;
use crate::record::ConsumerRecord;

/// The retry-topic naming scheme of one consumer group.
///
/// Retry topics are named `<original-topic>-<group>-retry-<n>`, with `n`
/// starting at 0 and increasing by one per non-blocking hop. The name is
/// contractual: other consumers of the retry topics must agree on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTopics {
    group: String,
}

impl RetryTopics {
    /// The naming scheme for `group`.
    pub fn new(group: impl Into<String>) -> RetryTopics {
        RetryTopics {
            group: group.into(),
        }
    }

    /// The consumer group this scheme belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The retry topic for hop `attempt` of `original_topic`.
    pub fn retry_topic(&self, original_topic: &str, attempt: i32) -> String {
        format!("{}-{}-retry-{}", original_topic, self.group, attempt)
    }

    /// Parses `topic` as one of this group's retry topics, returning the
    /// original topic name and the hop index.
    pub fn parse<'a>(&self, topic: &'a str) -> Option<(&'a str, i32)> {
        let (rest, attempt) = topic.rsplit_once("-retry-")?;
        let attempt: i32 = attempt.parse().ok()?;
        if attempt < 0 {
            return None;
        }
        let original = rest.strip_suffix(&self.group)?.strip_suffix('-')?;
        if original.is_empty() {
            return None;
        }
        Some((original, attempt))
    }
}

/// What to do with a record, as decided by [`RetryPolicy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry in place on the consuming partition.
    BlockingRetry,
    /// Republish to a retry topic with a scheduled delivery time.
    NonBlockingRepublish {
        /// The retry topic to publish to.
        topic: String,
        /// The hop index to stamp on the republished record.
        attempt: i32,
        /// The redelivery delay to stamp on the republished record.
        backoff: Duration,
    },
    /// The schedule is exhausted; surface the failure to the caller.
    TerminalGiveUp,
}

/// Decides, from the active configuration, what happens to a record whose
/// handler invocation failed with a retriable error.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    topics: RetryTopics,
}

impl RetryPolicy {
    /// A policy applying `config` under `topics`' naming scheme.
    pub fn new(config: RetryConfig, topics: RetryTopics) -> RetryPolicy {
        RetryPolicy { config, topics }
    }

    /// The active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The retry-topic naming scheme.
    pub fn topics(&self) -> &RetryTopics {
        &self.topics
    }

    /// The action for a retriable failure of `record`.
    ///
    /// `schedule` is the decoded retry schedule of the record, if it
    /// carried one. For records on a retry topic the next hop is
    /// `attempt + 1`; for records on a primary topic the configured
    /// blocking schedule runs first if there is one, otherwise the first
    /// non-blocking hop is taken.
    pub fn on_retriable_failure(
        &self,
        record: &ConsumerRecord,
        schedule: Option<&RetrySchedule>,
    ) -> RetryAction {
        match self.topics.parse(&record.topic) {
            Some((original_topic, hop)) => {
                // The header is authoritative for the hop index; the topic
                // name is the fallback for records published without one.
                let attempt = schedule.map_or(hop, |s| s.attempt);
                self.next_hop(original_topic, attempt.saturating_add(1))
            }
            None => {
                if self.config.blocking_schedule().is_some() {
                    RetryAction::BlockingRetry
                } else {
                    self.next_hop(&record.topic, 0)
                }
            }
        }
    }

    /// The action once a blocking schedule is exhausted: hand off to the
    /// first non-blocking hop if the configuration has one, else give up.
    pub fn on_blocking_exhausted(&self, record: &ConsumerRecord) -> RetryAction {
        match self.config.non_blocking_backoffs() {
            // The attempt counter is scoped to non-blocking hops, so the
            // handoff starts at 0 regardless of how many blocking attempts
            // preceded it.
            Some(_) => self.next_hop(&record.topic, 0),
            None => RetryAction::TerminalGiveUp,
        }
    }

    fn next_hop(&self, original_topic: &str, attempt: i32) -> RetryAction {
        let backoffs = match self.config.non_blocking_backoffs() {
            Some(backoffs) => backoffs,
            None => return RetryAction::TerminalGiveUp,
        };
        let index = usize::try_from(attempt).unwrap_or(usize::MAX);
        match backoffs.get(index) {
            Some(backoff) => RetryAction::NonBlockingRepublish {
                topic: self.topics.retry_topic(original_topic, attempt),
                attempt,
                backoff: *backoff,
            },
            None => RetryAction::TerminalGiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_on(topic: &str) -> ConsumerRecord {
        ConsumerRecord {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: None,
            value: vec![],
            headers: vec![],
        }
    }

    #[test]
    fn test_retry_topic_names() {
        let topics = RetryTopics::new("payments");
        assert_eq!(topics.retry_topic("orders", 0), "orders-payments-retry-0");
        assert_eq!(topics.retry_topic("orders", 3), "orders-payments-retry-3");
    }

    #[test]
    fn test_retry_topic_parsing() {
        let topics = RetryTopics::new("payments");
        assert_eq!(
            topics.parse("orders-payments-retry-0"),
            Some(("orders", 0))
        );
        assert_eq!(
            topics.parse("orders-payments-retry-12"),
            Some(("orders", 12))
        );
        // Wrong group.
        assert_eq!(topics.parse("orders-shipping-retry-0"), None);
        // Not a retry topic.
        assert_eq!(topics.parse("orders"), None);
        // Garbage attempt index.
        assert_eq!(topics.parse("orders-payments-retry-x"), None);
        assert_eq!(topics.parse("orders-payments-retry--1"), None);
        // No original topic.
        assert_eq!(topics.parse("-payments-retry-0"), None);
    }

    #[test]
    fn test_primary_topic_actions() {
        let topics = RetryTopics::new("g");
        let one_sec = Duration::from_secs(1);

        let non_blocking = RetryPolicy::new(
            RetryConfig::non_blocking(vec![one_sec]).unwrap(),
            topics.clone(),
        );
        assert_eq!(
            non_blocking.on_retriable_failure(&record_on("t"), None),
            RetryAction::NonBlockingRepublish {
                topic: "t-g-retry-0".into(),
                attempt: 0,
                backoff: one_sec,
            }
        );

        let blocking = RetryPolicy::new(
            RetryConfig::finite_blocking(vec![one_sec]).unwrap(),
            topics.clone(),
        );
        assert_eq!(
            blocking.on_retriable_failure(&record_on("t"), None),
            RetryAction::BlockingRetry
        );

        let combined = RetryPolicy::new(
            RetryConfig::blocking_followed_by_non_blocking(vec![one_sec], vec![one_sec]).unwrap(),
            topics,
        );
        assert_eq!(
            combined.on_retriable_failure(&record_on("t"), None),
            RetryAction::BlockingRetry
        );
        assert_eq!(
            combined.on_blocking_exhausted(&record_on("t")),
            RetryAction::NonBlockingRepublish {
                topic: "t-g-retry-0".into(),
                attempt: 0,
                backoff: one_sec,
            }
        );
    }

    #[test]
    fn test_retry_topic_hops_advance_and_give_up() {
        let topics = RetryTopics::new("g");
        let backoffs = vec![Duration::from_secs(1), Duration::from_secs(5)];
        let policy = RetryPolicy::new(RetryConfig::non_blocking(backoffs).unwrap(), topics);

        let schedule = RetrySchedule {
            attempt: 0,
            submitted_at: 0,
            backoff: Duration::from_secs(1),
        };
        assert_eq!(
            policy.on_retriable_failure(&record_on("t-g-retry-0"), Some(&schedule)),
            RetryAction::NonBlockingRepublish {
                topic: "t-g-retry-1".into(),
                attempt: 1,
                backoff: Duration::from_secs(5),
            }
        );

        let schedule = RetrySchedule {
            attempt: 1,
            ..schedule
        };
        assert_eq!(
            policy.on_retriable_failure(&record_on("t-g-retry-1"), Some(&schedule)),
            RetryAction::TerminalGiveUp
        );
    }

    #[test]
    fn test_retry_topic_without_headers_falls_back_to_topic_name() {
        let topics = RetryTopics::new("g");
        let backoffs = vec![Duration::from_secs(1), Duration::from_secs(5)];
        let policy = RetryPolicy::new(RetryConfig::non_blocking(backoffs).unwrap(), topics);

        assert_eq!(
            policy.on_retriable_failure(&record_on("t-g-retry-0"), None),
            RetryAction::NonBlockingRepublish {
                topic: "t-g-retry-1".into(),
                attempt: 1,
                backoff: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn test_blocking_only_config_gives_up_on_retry_topic_records() {
        let topics = RetryTopics::new("g");
        let policy = RetryPolicy::new(
            RetryConfig::finite_blocking(vec![Duration::from_secs(1)]).unwrap(),
            topics,
        );
        let schedule = RetrySchedule {
            attempt: 0,
            submitted_at: 0,
            backoff: Duration::from_secs(1),
        };
        assert_eq!(
            policy.on_retriable_failure(&record_on("t-g-retry-0"), Some(&schedule)),
            RetryAction::TerminalGiveUp
        );
    }
}
