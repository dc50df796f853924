// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An invalid retry configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidRetryConfig {
    /// A retry schedule must contain at least one backoff.
    #[error("{0} schedule must contain at least one backoff")]
    EmptySchedule(&'static str),
}

/// How failed records are retried.
///
/// Blocking schedules retry the record in place, holding the consuming
/// partition; non-blocking schedules republish the record to a dedicated
/// retry topic with an embedded delivery time, freeing the partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryConfig {
    /// Republish each failure to the retry topic for the next attempt.
    /// After the last configured backoff, give up.
    NonBlocking {
        /// One backoff per non-blocking hop.
        backoffs: Vec<Duration>,
    },
    /// Retry in place, one attempt per backoff, then surface the failure.
    FiniteBlocking {
        /// One backoff per in-place attempt.
        backoffs: Vec<Duration>,
    },
    /// Retry in place forever at a fixed cadence, until success or an
    /// operator override.
    InfiniteBlocking {
        /// The fixed delay between attempts.
        backoff: Duration,
    },
    /// Exhaust the blocking schedule first; if the record still fails,
    /// switch to republishing, starting at attempt 0.
    BlockingFollowedByNonBlocking {
        /// In-place attempts, performed first.
        blocking: Vec<Duration>,
        /// Non-blocking hops, performed after blocking exhaustion.
        non_blocking: Vec<Duration>,
    },
}

impl RetryConfig {
    /// A non-blocking configuration. Errors if `backoffs` is empty.
    pub fn non_blocking(backoffs: Vec<Duration>) -> Result<RetryConfig, InvalidRetryConfig> {
        if backoffs.is_empty() {
            return Err(InvalidRetryConfig::EmptySchedule("non-blocking"));
        }
        Ok(RetryConfig::NonBlocking { backoffs })
    }

    /// A finite blocking configuration. Errors if `backoffs` is empty.
    pub fn finite_blocking(backoffs: Vec<Duration>) -> Result<RetryConfig, InvalidRetryConfig> {
        if backoffs.is_empty() {
            return Err(InvalidRetryConfig::EmptySchedule("blocking"));
        }
        Ok(RetryConfig::FiniteBlocking { backoffs })
    }

    /// An infinite blocking configuration with a fixed cadence.
    pub fn infinite_blocking(backoff: Duration) -> RetryConfig {
        RetryConfig::InfiniteBlocking { backoff }
    }

    /// A blocking-then-non-blocking configuration. Errors if either
    /// schedule is empty.
    pub fn blocking_followed_by_non_blocking(
        blocking: Vec<Duration>,
        non_blocking: Vec<Duration>,
    ) -> Result<RetryConfig, InvalidRetryConfig> {
        if blocking.is_empty() {
            return Err(InvalidRetryConfig::EmptySchedule("blocking"));
        }
        if non_blocking.is_empty() {
            return Err(InvalidRetryConfig::EmptySchedule("non-blocking"));
        }
        Ok(RetryConfig::BlockingFollowedByNonBlocking {
            blocking,
            non_blocking,
        })
    }

    /// The in-place schedule, if this configuration has one.
    pub(crate) fn blocking_schedule(&self) -> Option<BlockingSchedule<'_>> {
        match self {
            RetryConfig::NonBlocking { .. } => None,
            RetryConfig::FiniteBlocking { backoffs } => Some(BlockingSchedule::Finite(backoffs)),
            RetryConfig::InfiniteBlocking { backoff } => Some(BlockingSchedule::Infinite(*backoff)),
            RetryConfig::BlockingFollowedByNonBlocking { blocking, .. } => {
                Some(BlockingSchedule::Finite(blocking))
            }
        }
    }

    /// The non-blocking backoff sequence, if this configuration has one.
    pub(crate) fn non_blocking_backoffs(&self) -> Option<&[Duration]> {
        match self {
            RetryConfig::NonBlocking { backoffs } => Some(backoffs),
            RetryConfig::FiniteBlocking { .. } | RetryConfig::InfiniteBlocking { .. } => None,
            RetryConfig::BlockingFollowedByNonBlocking { non_blocking, .. } => Some(non_blocking),
        }
    }
}

/// The shape of an in-place retry schedule.
#[derive(Clone, Copy, Debug)]
pub(crate) enum BlockingSchedule<'a> {
    /// One attempt per backoff.
    Finite(&'a [Duration]),
    /// Attempts forever at a fixed cadence.
    Infinite(Duration),
}

impl BlockingSchedule<'_> {
    /// The backoff for the given zero-based attempt, or `None` once a
    /// finite schedule is exhausted.
    pub fn backoff(&self, attempt: usize) -> Option<Duration> {
        match self {
            BlockingSchedule::Finite(backoffs) => backoffs.get(attempt).copied(),
            BlockingSchedule::Infinite(backoff) => Some(*backoff),
        }
    }
}
