// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The wire codec for retry scheduling headers.
//!
//! Records republished to a retry topic carry three headers:
//!
//! * `retry-attempt`: the non-blocking hop index, as a big-endian `i32`.
//! * `retry-submitted-at`: the instant of publication, as big-endian
//!   milliseconds since the Unix epoch (`i64`). Epoch millis round-trip
//!   bit-identically, which an ISO-8601 string does not guarantee.
//! * `retry-backoff`: the delay before redelivery, as big-endian
//!   milliseconds (`i64`).
//!
//! Absence of all three headers means the record is not a retry record. A
//! partially present or malformed set is a decode failure, which callers
//! treat as a permanent fault.

use std::time::Duration;

use thiserror::Error;

use crate::now::EpochMillis;
use crate::record::{ConsumerRecord, HeaderList};

/// Header carrying the non-blocking hop index.
pub const RETRY_ATTEMPT_HEADER: &str = "retry-attempt";
/// Header carrying the publication instant.
pub const RETRY_SUBMITTED_AT_HEADER: &str = "retry-submitted-at";
/// Header carrying the redelivery delay.
pub const RETRY_BACKOFF_HEADER: &str = "retry-backoff";

const RETRY_HEADER_NAMES: [&str; 3] = [
    RETRY_ATTEMPT_HEADER,
    RETRY_SUBMITTED_AT_HEADER,
    RETRY_BACKOFF_HEADER,
];

/// The scheduling information embedded in a retry-topic record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    /// The non-blocking hop index of this record.
    pub attempt: i32,
    /// When the record was published to its retry topic.
    pub submitted_at: EpochMillis,
    /// How long after `submitted_at` the record becomes deliverable.
    pub backoff: Duration,
}

impl RetrySchedule {
    /// The instant at which the record becomes deliverable.
    pub fn deliver_at(&self) -> EpochMillis {
        self.submitted_at
            .saturating_add(u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX))
    }
}

/// An error decoding retry headers from a record.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HeaderDecodeError {
    /// One or two of the three retry headers were present.
    #[error("incomplete retry headers: missing {0}")]
    Incomplete(&'static str),
    /// A header value had the wrong width or an out-of-range value.
    #[error("malformed {header} header: {detail}")]
    Malformed {
        /// The offending header name.
        header: &'static str,
        /// What was wrong with it.
        detail: String,
    },
}

/// Encodes a retry schedule as record headers, in wire order.
pub fn encode(schedule: &RetrySchedule) -> HeaderList {
    let backoff_millis = i64::try_from(schedule.backoff.as_millis()).unwrap_or(i64::MAX);
    vec![
        (
            RETRY_ATTEMPT_HEADER.into(),
            schedule.attempt.to_be_bytes().to_vec(),
        ),
        (
            RETRY_SUBMITTED_AT_HEADER.into(),
            i64::try_from(schedule.submitted_at)
                .unwrap_or(i64::MAX)
                .to_be_bytes()
                .to_vec(),
        ),
        (
            RETRY_BACKOFF_HEADER.into(),
            backoff_millis.to_be_bytes().to_vec(),
        ),
    ]
}

/// Decodes the retry schedule carried by `record`, if any.
///
/// Returns `Ok(None)` when none of the retry headers are present.
pub fn decode(record: &ConsumerRecord) -> Result<Option<RetrySchedule>, HeaderDecodeError> {
    let attempt = record.header(RETRY_ATTEMPT_HEADER);
    let submitted_at = record.header(RETRY_SUBMITTED_AT_HEADER);
    let backoff = record.header(RETRY_BACKOFF_HEADER);

    if attempt.is_none() && submitted_at.is_none() && backoff.is_none() {
        return Ok(None);
    }

    let attempt = attempt.ok_or(HeaderDecodeError::Incomplete(RETRY_ATTEMPT_HEADER))?;
    let submitted_at =
        submitted_at.ok_or(HeaderDecodeError::Incomplete(RETRY_SUBMITTED_AT_HEADER))?;
    let backoff = backoff.ok_or(HeaderDecodeError::Incomplete(RETRY_BACKOFF_HEADER))?;

    let attempt = i32::from_be_bytes(fixed_width(RETRY_ATTEMPT_HEADER, attempt)?);
    if attempt < 0 {
        return Err(HeaderDecodeError::Malformed {
            header: RETRY_ATTEMPT_HEADER,
            detail: format!("negative attempt {attempt}"),
        });
    }

    let submitted_at = i64::from_be_bytes(fixed_width(RETRY_SUBMITTED_AT_HEADER, submitted_at)?);
    let submitted_at =
        EpochMillis::try_from(submitted_at).map_err(|_| HeaderDecodeError::Malformed {
            header: RETRY_SUBMITTED_AT_HEADER,
            detail: format!("negative timestamp {submitted_at}"),
        })?;

    let backoff_millis = i64::from_be_bytes(fixed_width(RETRY_BACKOFF_HEADER, backoff)?);
    let backoff_millis =
        u64::try_from(backoff_millis).map_err(|_| HeaderDecodeError::Malformed {
            header: RETRY_BACKOFF_HEADER,
            detail: format!("negative backoff {backoff_millis}ms"),
        })?;

    Ok(Some(RetrySchedule {
        attempt,
        submitted_at,
        backoff: Duration::from_millis(backoff_millis),
    }))
}

/// Replaces any retry headers in `headers` with a freshly encoded
/// `schedule`, preserving all user headers.
pub fn overwrite(headers: &HeaderList, schedule: &RetrySchedule) -> HeaderList {
    let mut out: HeaderList = headers
        .iter()
        .filter(|(name, _)| !RETRY_HEADER_NAMES.contains(&name.as_str()))
        .cloned()
        .collect();
    out.extend(encode(schedule));
    out
}

fn fixed_width<const N: usize>(
    header: &'static str,
    value: &[u8],
) -> Result<[u8; N], HeaderDecodeError> {
    <[u8; N]>::try_from(value).map_err(|_| HeaderDecodeError::Malformed {
        header,
        detail: format!("expected {N} bytes, got {}", value.len()),
    })
}
