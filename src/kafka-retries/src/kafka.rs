// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Adapters between the retry dispatcher and [`rdkafka`].

use anyhow::anyhow;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::{debug, error, info, warn, Level};

use async_trait::async_trait;

use crate::error::ProduceError;
use crate::producer::{ProducedRecord, Producer};
use crate::record::ConsumerRecord;

/// A `ClientContext` that routes librdkafka logs through `tracing` instead
/// of `log` macros.
#[derive(Clone, Debug, Default)]
pub struct RetryClientContext;

impl ClientContext for RetryClientContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        use rdkafka::config::RDKafkaLogLevel::*;
        match level {
            Emerg | Alert | Critical | Error => {
                error!(target: "librdkafka", "{} {}", fac, log_message);
            }
            Warning => warn!(target: "librdkafka", "{} {}", fac, log_message),
            Notice | Info => info!(target: "librdkafka", "{} {}", fac, log_message),
            Debug => debug!(target: "librdkafka", "{} {}", fac, log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "librdkafka", "{}: {}", error, reason);
    }
}

/// Builds an [`rdkafka`] [`ClientConfig`] with its `log_level` derived from
/// the given [`tracing::Level`] for the `librdkafka` target.
pub fn new_client_config(tracing_level: Level) -> ClientConfig {
    let mut config = ClientConfig::new();
    let level = if tracing_level >= Level::DEBUG {
        RDKafkaLogLevel::Debug
    } else if tracing_level >= Level::INFO {
        RDKafkaLogLevel::Info
    } else if tracing_level >= Level::WARN {
        RDKafkaLogLevel::Warning
    } else {
        RDKafkaLogLevel::Error
    };
    config.set_log_level(level);
    config
}

/// A [`Producer`] backed by an rdkafka [`FutureProducer`].
pub struct KafkaRetryProducer {
    producer: FutureProducer<RetryClientContext>,
}

impl KafkaRetryProducer {
    /// Creates a producer from `config`.
    pub fn new(config: &ClientConfig) -> KafkaResult<KafkaRetryProducer> {
        let producer = config.create_with_context(RetryClientContext)?;
        Ok(KafkaRetryProducer { producer })
    }
}

#[async_trait]
impl Producer for KafkaRetryProducer {
    async fn produce(&self, record: ProducedRecord) -> Result<(), ProduceError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }

        let mut future_record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(&record.topic)
                .payload(&record.value)
                .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        match self.producer.send(future_record, Timeout::Never).await {
            Ok(_) => Ok(()),
            Err((err, _message)) => Err(ProduceError {
                topic: record.topic,
                source: anyhow!(err),
            }),
        }
    }
}

impl ConsumerRecord {
    /// Converts a message read by an rdkafka consumer into the
    /// dispatcher's record type.
    pub fn from_borrowed_message(message: &BorrowedMessage<'_>) -> ConsumerRecord {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.unwrap_or(&[]).to_vec(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        ConsumerRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|key| key.to_vec()),
            value: message.payload().map(|value| value.to_vec()).unwrap_or_default(),
            headers,
        }
    }
}
