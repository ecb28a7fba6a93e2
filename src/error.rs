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

use crate::id::SeriesId;
use crate::segment;
use crate::series::TickResult;
use crate::time::UnixNanos;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub enum Error {
    AlreadyBootstrapped,
    NotBootstrapped,
    /// The series was closed or never reset with an identity.
    Closed,

    /// Not a failure. Returned by tick when the series no longer holds any
    /// active block; the counters of that tick are carried along.
    AllDatapointsExpired(TickResult),

    TooFarInPast {
        id: Option<SeriesId>,
        timestamp: UnixNanos,
        past_limit: UnixNanos,
    },
    TooFarInFuture {
        id: Option<SeriesId>,
        timestamp: UnixNanos,
        future_limit: UnixNanos,
    },
    OutOfRetention {
        id: Option<SeriesId>,
        timestamp: UnixNanos,
        retention_start: UnixNanos,
    },
    InvalidColdFlushVersion(i32),

    InvalidOptions(String),
    UnknownCachePolicy(String),
    Config(serde_json::Error),

    Segment(segment::Error),
    Io(std::io::Error),
    Cancelled,
    Persist(BoxError),
    Retrieve(BoxError),
}

impl Error {
    pub fn is_all_datapoints_expired(&self) -> bool {
        matches!(self, Error::AllDatapointsExpired(_))
    }

    /// Write rejected because of the caller's input rather than node state.
    pub fn is_invalid_params(&self) -> bool {
        matches!(
            self,
            Error::TooFarInPast { .. }
                | Error::TooFarInFuture { .. }
                | Error::OutOfRetention { .. }
                | Error::InvalidColdFlushVersion(_)
        )
    }
}

impl From<segment::Error> for Error {
    fn from(item: segment::Error) -> Self {
        Error::Segment(item)
    }
}

impl From<std::io::Error> for Error {
    fn from(item: std::io::Error) -> Self {
        Error::Io(item)
    }
}

impl From<serde_json::Error> for Error {
    fn from(item: serde_json::Error) -> Self {
        Error::Config(item)
    }
}

fn fmt_id(id: &Option<SeriesId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => String::from("<none>"),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyBootstrapped => write!(f, "series is already bootstrapped"),
            Error::NotBootstrapped => write!(f, "series is not yet bootstrapped"),
            Error::Closed => write!(f, "series is closed"),
            Error::AllDatapointsExpired(_) => write!(f, "series datapoints are all expired"),
            Error::TooFarInPast {
                id,
                timestamp,
                past_limit,
            } => write!(
                f,
                "datapoint too far in past: id={}, timestamp={}, past_limit={}",
                fmt_id(id),
                timestamp,
                past_limit
            ),
            Error::TooFarInFuture {
                id,
                timestamp,
                future_limit,
            } => write!(
                f,
                "datapoint too far in future: id={}, timestamp={}, future_limit={}",
                fmt_id(id),
                timestamp,
                future_limit
            ),
            Error::OutOfRetention {
                id,
                timestamp,
                retention_start,
            } => write!(
                f,
                "datapoint out of retention: id={}, timestamp={}, retention_start={}",
                fmt_id(id),
                timestamp,
                retention_start
            ),
            Error::InvalidColdFlushVersion(v) => write!(f, "invalid cold flush version: {}", v),
            Error::InvalidOptions(msg) => write!(f, "invalid options: {}", msg),
            Error::UnknownCachePolicy(p) => write!(f, "unknown series cache policy: {}", p),
            Error::Config(e) => write!(f, "invalid configuration: {}", e),
            Error::Segment(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Cancelled => write!(f, "context cancelled"),
            Error::Persist(e) => write!(f, "persist failed: {}", e),
            Error::Retrieve(e) => write!(f, "block retrieval failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Segment(e) => Some(e),
            Error::Config(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Persist(e) | Error::Retrieve(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
