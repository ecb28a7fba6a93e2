#![deny(unused_must_use)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod block;
pub mod clock;
pub mod config;
pub mod constants;
pub mod context;
pub mod counters;
pub mod error;
pub mod id;
pub mod instrument;
pub mod sample;
pub mod segment;
pub mod series;
pub mod time;

#[cfg(test)]
mod test_utils;

pub use block::{DatabaseBlock, DatabaseBlockPool, WiredList, WiredListOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SeriesCacheConfiguration;
pub use context::Context;
pub use error::{Error, Result};
pub use id::{NamespaceContext, SeriesId, Tags};
pub use sample::Datapoint;
pub use segment::Segment;
pub use series::{CachePolicy, DatabaseSeries, DatabaseSeriesOptions, Options};
pub use time::UnixNanos;
