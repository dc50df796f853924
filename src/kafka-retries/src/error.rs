// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The failure taxonomy of the retry dispatcher.

use std::sync::Arc;

use thiserror::Error;

/// A failure reported by a record handler.
///
/// There are exactly two semantic cases. `Retriable` failures are transient
/// and subject to the configured retry policy. `NonRetriable` failures are
/// permanent: the record is consumed, the cause is reported to the metrics
/// sink, and no retry is attempted.
#[derive(Clone, Debug, Error)]
pub enum HandlerError {
    /// A transient fault. The retry policy decides what happens next.
    #[error("retriable failure: {0}")]
    Retriable(String),
    /// A permanent fault carrying its cause. Never retried.
    #[error("non-retriable failure: {0}")]
    NonRetriable(Arc<anyhow::Error>),
}

impl HandlerError {
    /// Constructs a retriable failure from a message.
    pub fn retriable(message: impl Into<String>) -> HandlerError {
        HandlerError::Retriable(message.into())
    }

    /// Constructs a non-retriable failure from a cause.
    pub fn non_retriable(cause: impl Into<anyhow::Error>) -> HandlerError {
        HandlerError::NonRetriable(Arc::new(cause.into()))
    }

    /// Reports whether this failure is subject to retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, HandlerError::Retriable(_))
    }
}

/// An error produced when publishing a record to a retry topic fails.
///
/// Publication failures are transient from the dispatcher's perspective;
/// callers see them as [`HandlerError::Retriable`] and the external event
/// loop decides whether to re-poll the record.
#[derive(Debug, Error)]
#[error("failed to produce record to {topic}: {source}")]
pub struct ProduceError {
    /// The topic the publish was addressed to.
    pub topic: String,
    /// The underlying producer failure.
    #[source]
    pub source: anyhow::Error,
}
