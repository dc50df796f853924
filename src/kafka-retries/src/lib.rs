// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry dispatch for Kafka consumers.
//!
//! This crate wraps a user-supplied record handler with a retry policy.
//! When the handler fails with a transient error, the record is either
//! retried in place, holding the consuming partition ("blocking" retries),
//! or republished to a dedicated retry topic with an embedded delivery
//! time ("non-blocking" retries). Retry topics are named
//! `<topic>-<group>-retry-<n>`, and records on them carry their schedule
//! in the `retry-attempt`, `retry-submitted-at`, and `retry-backoff`
//! headers.
//!
//! Blocking retries are steerable at runtime: an operator can skip a
//! single poisoned record or drain a stuck partition through the shared
//! [`BlockingStateStore`], and a sleeping retry releases the partition as
//! soon as the override lands rather than waiting out its backoff.
//!
//! The dispatcher never commits offsets. [`RetryingHandler::handle`]
//! returns success exactly when the record may be acknowledged; the
//! surrounding consumer event loop owns offset management and guarantees
//! per-partition serialization.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use kafka_retries::{
//!     with_retries, BlockingStateStore, ConsumerRecord, HandlerError, RecordHandler,
//!     RetryConfig, RetryTopics, TracingMetricsSink,
//! };
//!
//! #[derive(Debug)]
//! struct Indexer;
//!
//! #[async_trait::async_trait]
//! impl RecordHandler for Indexer {
//!     async fn apply(&self, _record: &ConsumerRecord) -> Result<(), HandlerError> {
//!         // ... index the record, classifying failures ...
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let producer = kafka_retries::kafka::KafkaRetryProducer::new(
//!     kafka_retries::kafka::new_client_config(tracing::Level::INFO)
//!         .set("bootstrap.servers", "localhost:9092"),
//! )?;
//! let store = BlockingStateStore::new();
//! let wrapped = with_retries(
//!     Indexer,
//!     RetryConfig::finite_blocking(vec![Duration::from_secs(1), Duration::from_secs(5)])?,
//!     RetryTopics::new("indexer"),
//!     producer,
//!     store.clone(),
//!     Arc::new(TracingMetricsSink),
//!     kafka_retries::now::system_time(),
//! );
//! // for each polled record, in per-partition order:
//! // wrapped.handle(&record).await?;
//! # Ok(())
//! # }
//! ```

mod blocking;

pub mod config;
pub mod error;
pub mod handler;
pub mod headers;
pub mod kafka;
pub mod metrics;
pub mod now;
pub mod policy;
pub mod producer;
pub mod record;
pub mod state;

pub use crate::config::{InvalidRetryConfig, RetryConfig};
pub use crate::error::{HandlerError, ProduceError};
pub use crate::handler::{with_retries, RecordHandler, RetryingHandler};
pub use crate::metrics::{MetricsSink, RetryEvent, TracingMetricsSink};
pub use crate::policy::{RetryAction, RetryPolicy, RetryTopics};
pub use crate::producer::{ProducedRecord, Producer};
pub use crate::record::{ConsumerRecord, TopicPartition};
pub use crate::state::{BlockingState, BlockingStateStore, BlockingTarget};
