// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Publication of failed records to retry topics.

use async_trait::async_trait;

use crate::error::ProduceError;
use crate::headers::{self, RetrySchedule};
use crate::now::EpochMillis;
use crate::record::{ConsumerRecord, HeaderList};

/// A record to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducedRecord {
    /// The destination topic.
    pub topic: String,
    /// The record key, if any.
    pub key: Option<Vec<u8>>,
    /// The record value.
    pub value: Vec<u8>,
    /// The destination partition; `None` lets the publisher choose.
    pub partition: Option<i32>,
    /// The record headers, in wire order.
    pub headers: HeaderList,
}

/// The producer collaborator the dispatcher publishes through.
///
/// Delivery semantics beyond the returned result (batching, acks,
/// idempotence) are the implementation's concern.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes one record, resolving when the publish is acknowledged or
    /// has failed.
    async fn produce(&self, record: ProducedRecord) -> Result<(), ProduceError>;
}

#[async_trait]
impl<P> Producer for std::sync::Arc<P>
where
    P: Producer + ?Sized,
{
    async fn produce(&self, record: ProducedRecord) -> Result<(), ProduceError> {
        (**self).produce(record).await
    }
}

/// Builds the retry-topic record for a failed `record`.
///
/// The key and value are carried over unchanged, the partition is left to
/// the publisher, and the retry headers are stamped over any same-named
/// headers from a previous hop.
pub(crate) fn retry_record(
    record: &ConsumerRecord,
    topic: String,
    attempt: i32,
    submitted_at: EpochMillis,
    backoff: std::time::Duration,
) -> ProducedRecord {
    let schedule = RetrySchedule {
        attempt,
        submitted_at,
        backoff,
    };
    ProducedRecord {
        topic,
        key: record.key.clone(),
        value: record.value.clone(),
        partition: None,
        headers: headers::overwrite(&record.headers, &schedule),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::headers::decode;

    #[test]
    fn test_retry_record_carries_key_value_and_schedule() {
        let record = ConsumerRecord {
            topic: "t".into(),
            partition: 3,
            offset: 17,
            key: Some(b"k".to_vec()),
            value: b"v".to_vec(),
            headers: vec![("trace-id".into(), b"abc".to_vec())],
        };
        let produced = retry_record(
            &record,
            "t-g-retry-0".into(),
            0,
            1_000,
            Duration::from_secs(1),
        );

        assert_eq!(produced.topic, "t-g-retry-0");
        assert_eq!(produced.key, Some(b"k".to_vec()));
        assert_eq!(produced.value, b"v".to_vec());
        assert_eq!(produced.partition, None);
        assert_eq!(produced.headers[0], ("trace-id".into(), b"abc".to_vec()));

        let replayed = ConsumerRecord {
            topic: produced.topic.clone(),
            partition: 0,
            offset: 0,
            key: produced.key.clone(),
            value: produced.value.clone(),
            headers: produced.headers.clone(),
        };
        let schedule = decode(&replayed).unwrap().unwrap();
        assert_eq!(schedule.attempt, 0);
        assert_eq!(schedule.submitted_at, 1_000);
        assert_eq!(schedule.backoff, Duration::from_secs(1));
    }
}
