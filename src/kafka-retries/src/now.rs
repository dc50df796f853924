// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A swappable source of wall-clock time.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// A timestamp in milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// A function that returns the current time, in milliseconds since the Unix
/// epoch.
///
/// All components that need the current time hold one of these rather than
/// calling [`SystemTime::now`] directly, so that tests can substitute a
/// deterministic clock.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time.
    pub fn now(&self) -> EpochMillis {
        (self.0)()
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NowFn")
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

/// Returns a [`NowFn`] backed by the system clock.
pub fn system_time() -> NowFn {
    NowFn::from(|| {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("failed to get millis since epoch");
        u64::try_from(duration.as_millis()).expect("current time did not fit into u64")
    })
}

/// Renders an [`EpochMillis`] as a UTC datetime, for logging.
pub fn to_datetime(millis: EpochMillis) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_is_sane() {
        // 2020-01-01T00:00:00Z, in millis.
        assert!(system_time().now() > 1_577_836_800_000);
    }

    #[test]
    fn test_to_datetime() {
        let dt = to_datetime(1_577_836_800_000).unwrap();
        assert_eq!(dt.to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }
}
