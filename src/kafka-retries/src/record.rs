// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The record vocabulary shared by the retry dispatcher and its
//! collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A topic name paired with a partition index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// The topic name.
    pub topic: String,
    /// The partition index within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Constructs a new `TopicPartition`.
    pub fn new(topic: impl Into<String>, partition: i32) -> TopicPartition {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// An ordered list of record headers.
///
/// Kafka permits repeated header names, so this is a list rather than a map.
pub type HeaderList = Vec<(String, Vec<u8>)>;

/// A record as delivered by the consumer.
///
/// The dispatcher treats the key and value as opaque byte sequences; only
/// the retry headers are interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerRecord {
    /// The topic the record was read from.
    pub topic: String,
    /// The partition the record was read from.
    pub partition: i32,
    /// The record's offset within its partition.
    pub offset: i64,
    /// The record key, if any.
    pub key: Option<Vec<u8>>,
    /// The record value.
    pub value: Vec<u8>,
    /// The record headers, in wire order.
    pub headers: HeaderList,
}

impl ConsumerRecord {
    /// Returns the record's topic-partition.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Returns the value of the last header named `name`, if any.
    ///
    /// Kafka semantics give the last occurrence of a repeated header
    /// precedence.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_header_wins() {
        let record = ConsumerRecord {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            key: None,
            value: vec![],
            headers: vec![
                ("h".into(), b"first".to_vec()),
                ("other".into(), b"x".to_vec()),
                ("h".into(), b"second".to_vec()),
            ],
        };
        assert_eq!(record.header("h"), Some(&b"second"[..]));
        assert_eq!(record.header("missing"), None);
    }
}
