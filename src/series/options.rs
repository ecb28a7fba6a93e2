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

use crate::block::{BlockPool, DatabaseBlockPool, WiredList};
use crate::clock::{Clock, SystemClock};
use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Decides which blocks tick unwires once they are safely persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CachePolicy {
    /// Keep every block wired until it expires.
    All,
    /// Unwire as soon as the block is persisted.
    None,
    /// Unwire once the block was not read for the not-accessed period.
    RecentlyRead,
    /// Blocks retrieved from disk are owned by the wired list.
    Lru,
}

impl CachePolicy {
    pub const ALL: [CachePolicy; 4] = [
        CachePolicy::All,
        CachePolicy::None,
        CachePolicy::RecentlyRead,
        CachePolicy::Lru,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::All => "all",
            CachePolicy::None => "none",
            CachePolicy::RecentlyRead => "recently_read",
            CachePolicy::Lru => "lru",
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::RecentlyRead
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CachePolicy::ALL
            .iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| Error::UnknownCachePolicy(s.to_string()))
    }
}

impl TryFrom<String> for CachePolicy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CachePolicy> for String {
    fn from(p: CachePolicy) -> String {
        p.as_str().to_string()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionOptions {
    pub retention_period: Duration,
    pub block_size: Duration,
    pub buffer_past: Duration,
    pub buffer_future: Duration,
    pub block_data_expiry_after_not_accessed_period: Duration,
}

impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            retention_period: DEFAULT_RETENTION_PERIOD,
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_past: DEFAULT_BUFFER_PAST,
            buffer_future: DEFAULT_BUFFER_FUTURE,
            block_data_expiry_after_not_accessed_period: DEFAULT_BLOCK_DATA_EXPIRY_AFTER_NOT_ACCESSED,
        }
    }
}

impl RetentionOptions {
    pub fn with_retention_period(mut self, d: Duration) -> Self {
        self.retention_period = d;
        self
    }

    pub fn with_block_size(mut self, d: Duration) -> Self {
        self.block_size = d;
        self
    }

    pub fn with_buffer_past(mut self, d: Duration) -> Self {
        self.buffer_past = d;
        self
    }

    pub fn with_buffer_future(mut self, d: Duration) -> Self {
        self.buffer_future = d;
        self
    }

    pub fn with_block_data_expiry_after_not_accessed_period(mut self, d: Duration) -> Self {
        self.block_data_expiry_after_not_accessed_period = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size.is_zero() {
            return Err(Error::InvalidOptions("block size must be positive".into()));
        }
        if self.retention_period < self.block_size {
            return Err(Error::InvalidOptions(
                "retention period must be at least one block".into(),
            ));
        }
        if self.buffer_past >= self.block_size {
            return Err(Error::InvalidOptions(
                "buffer past must be less than the block size".into(),
            ));
        }
        if self.buffer_future >= self.block_size {
            return Err(Error::InvalidOptions(
                "buffer future must be less than the block size".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Options {
    pub clock: Arc<dyn Clock>,
    pub retention: RetentionOptions,
    pub cache_policy: CachePolicy,
    pub block_pool: Arc<dyn BlockPool>,
    pub wired_list: Option<Arc<WiredList>>,
    pub cold_writes_enabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            clock: Arc::new(SystemClock),
            retention: RetentionOptions::default(),
            cache_policy: CachePolicy::default(),
            block_pool: DatabaseBlockPool::new(DEFAULT_BLOCK_POOL_SIZE),
            wired_list: None,
            cold_writes_enabled: false,
        }
    }
}

impl Options {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: RetentionOptions) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_block_pool(mut self, pool: Arc<dyn BlockPool>) -> Self {
        self.block_pool = pool;
        self
    }

    pub fn with_wired_list(mut self, wired_list: Option<Arc<WiredList>>) -> Self {
        self.wired_list = wired_list;
        self
    }

    pub fn with_cold_writes_enabled(mut self, enabled: bool) -> Self {
        self.cold_writes_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.retention.validate()?;
        if self.wired_list.is_some() && self.cache_policy != CachePolicy::Lru {
            return Err(Error::InvalidOptions(format!(
                "wired list configured with cache policy {}",
                self.cache_policy
            )));
        }
        Ok(())
    }
}
