// Copyright (c) 2023 Franco Solleza, Intel Corporation, Brown University
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the unix epoch. Block starts, datapoint timestamps and
/// last-read times are all expressed in this unit.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct UnixNanos(pub i64);

impl Deref for UnixNanos {
    type Target = i64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl UnixNanos {
    pub const ZERO: UnixNanos = UnixNanos(0);

    pub fn inner(&self) -> i64 {
        self.0
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => UnixNanos(duration_nanos(d)),
            Err(e) => UnixNanos(-duration_nanos(e.duration())),
        }
    }

    pub fn from_secs(secs: i64) -> Self {
        UnixNanos(secs.saturating_mul(1_000_000_000))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn add(&self, d: Duration) -> Self {
        UnixNanos(self.0.saturating_add(duration_nanos(d)))
    }

    pub fn sub(&self, d: Duration) -> Self {
        UnixNanos(self.0.saturating_sub(duration_nanos(d)))
    }

    /// Elapsed time from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(&self, earlier: UnixNanos) -> Duration {
        if self.0 <= earlier.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.0 - earlier.0) as u64)
        }
    }

    /// Rounds down to a multiple of `d`. Times before the epoch round toward
    /// negative infinity so that block starts stay aligned.
    pub fn truncate(&self, d: Duration) -> Self {
        let d = duration_nanos(d);
        if d <= 0 {
            return *self;
        }
        UnixNanos(self.0 - self.0.rem_euclid(d))
    }

    pub fn before(&self, other: UnixNanos) -> bool {
        self.0 < other.0
    }

    pub fn after(&self, other: UnixNanos) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for UnixNanos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Resolution a datapoint was written with.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
    Minute,
    Hour,
    Day,
    Year,
}

impl TimeUnit {
    pub fn value(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Microsecond => Duration::from_micros(1),
            TimeUnit::Nanosecond => Duration::from_nanos(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(60 * 60),
            TimeUnit::Day => Duration::from_secs(24 * 60 * 60),
            TimeUnit::Year => Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}
