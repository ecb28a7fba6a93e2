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

//! Series cache configuration as read from the node's configuration file.

use crate::block::{WiredList, WiredListOptions};
use crate::clock::Clock;
use crate::error::Result;
use crate::series::{CachePolicy, Options};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LruCacheConfiguration {
    /// Zero keeps the default.
    pub max_blocks: usize,
    /// Zero keeps the default.
    pub events_channel_size: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesCacheConfiguration {
    pub policy: CachePolicy,
    pub lru: Option<LruCacheConfiguration>,
}

impl SeriesCacheConfiguration {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_reader<R: Read>(r: R) -> Result<Self> {
        Ok(serde_json::from_reader(r)?)
    }

    /// Every policy except `all` may drop blocks that later reads have to
    /// fetch from disk again.
    pub fn requires_block_retriever(&self) -> bool {
        self.policy != CachePolicy::All
    }

    /// The wired list for the `lru` policy, `None` for every other policy.
    /// The list is not started.
    pub fn new_wired_list(&self, clock: Arc<dyn Clock>) -> Option<Arc<WiredList>> {
        if self.policy != CachePolicy::Lru {
            return None;
        }
        let mut opts = WiredListOptions::default().with_clock(clock);
        if let Some(lru) = self.lru {
            if lru.max_blocks > 0 {
                opts = opts.with_max_wired_blocks(lru.max_blocks);
            }
            if lru.events_channel_size > 0 {
                opts = opts.with_events_channel_size(lru.events_channel_size);
            }
        }
        Some(WiredList::new(opts))
    }

    /// Applies the policy to `opts`, attaching a new wired list for `lru`.
    pub fn apply(&self, opts: Options) -> Options {
        let wired_list = self.new_wired_list(opts.clock.clone());
        opts.with_cache_policy(self.policy).with_wired_list(wired_list)
    }
}
