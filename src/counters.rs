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

//! Process-wide counters. The tick counters are bumped once per series tick,
//! the others from the hot path that observed the event.

use crate::series::TickResult;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

pub static INVARIANT_VIOLATIONS: Counter = Counter::new();
pub static WIRED_LIST_EVICTIONS: Counter = Counter::new();
pub static WIRED_LIST_DROPPED_UPDATES: Counter = Counter::new();
pub static WIRED_LIST_SKIPPED_UPDATES: Counter = Counter::new();
pub static WIRED_LIST_WORKER_PANICS: Counter = Counter::new();
pub static BLOCK_POOL_ALLOCATIONS: Counter = Counter::new();
pub static BUFFER_MERGE_ERRORS: Counter = Counter::new();

pub static TICK_EXPIRED_BLOCKS: Counter = Counter::new();
pub static TICK_UNWIRED_BLOCKS: Counter = Counter::new();
pub static TICK_EVICTED_BUCKETS: Counter = Counter::new();
pub static TICK_MERGED_OUT_OF_ORDER_BLOCKS: Counter = Counter::new();

pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn increment(&self, v: u64) -> u64 {
        self.0.fetch_add(v, SeqCst)
    }

    pub fn add(&self, n: usize) {
        self.increment(n as u64);
    }

    pub fn load(&self) -> u64 {
        self.0.load(SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, SeqCst)
    }
}

pub fn record_tick(result: &TickResult) {
    TICK_EXPIRED_BLOCKS.add(result.made_expired_blocks);
    TICK_UNWIRED_BLOCKS.add(result.made_unwired_blocks);
    TICK_EVICTED_BUCKETS.add(result.evicted_buckets);
    TICK_MERGED_OUT_OF_ORDER_BLOCKS.add(result.merged_out_of_order_blocks);
}

/// Point in time copy of the tick counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TickCounters {
    pub expired_blocks: u64,
    pub unwired_blocks: u64,
    pub evicted_buckets: u64,
    pub merged_out_of_order_blocks: u64,
}

impl TickCounters {
    pub fn snapshot() -> Self {
        TickCounters {
            expired_blocks: TICK_EXPIRED_BLOCKS.load(),
            unwired_blocks: TICK_UNWIRED_BLOCKS.load(),
            evicted_buckets: TICK_EVICTED_BUCKETS.load(),
            merged_out_of_order_blocks: TICK_MERGED_OUT_OF_ORDER_BLOCKS.load(),
        }
    }

    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &TickCounters) -> TickCounters {
        TickCounters {
            expired_blocks: self.expired_blocks.saturating_sub(earlier.expired_blocks),
            unwired_blocks: self.unwired_blocks.saturating_sub(earlier.unwired_blocks),
            evicted_buckets: self.evicted_buckets.saturating_sub(earlier.evicted_buckets),
            merged_out_of_order_blocks: self
                .merged_out_of_order_blocks
                .saturating_sub(earlier.merged_out_of_order_blocks),
        }
    }
}
