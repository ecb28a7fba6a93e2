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

use crate::time::UnixNanos;
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TickStatus {
    pub active_blocks: usize,
    pub wired_blocks: usize,
    pub unwired_blocks: usize,
    pub pending_merge_blocks: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TickResult {
    pub tick_status: TickStatus,
    pub made_expired_blocks: usize,
    pub made_unwired_blocks: usize,
    pub merged_out_of_order_blocks: usize,
    pub evicted_buckets: usize,
}

/// Flush state of one block start, as seen by the shard.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockState {
    pub warm_retrievable: bool,
    pub cold_version: i32,
}

impl BlockState {
    pub fn warm_retrievable() -> Self {
        BlockState {
            warm_retrievable: true,
            cold_version: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BootstrappedBlockStateSnapshot {
    pub snapshot: HashMap<UnixNanos, BlockState>,
}

impl BootstrappedBlockStateSnapshot {
    pub fn get(&self, start: UnixNanos) -> Option<BlockState> {
        self.snapshot.get(&start).copied()
    }
}

impl FromIterator<(UnixNanos, BlockState)> for BootstrappedBlockStateSnapshot {
    fn from_iter<I: IntoIterator<Item = (UnixNanos, BlockState)>>(iter: I) -> Self {
        Self {
            snapshot: iter.into_iter().collect(),
        }
    }
}

/// Per block start flush state. Until the shard bootstrapped, nothing may be
/// unwired or treated as persisted.
#[derive(Clone, Debug)]
pub enum ShardBlockStateSnapshot {
    NotBootstrapped,
    Bootstrapped(BootstrappedBlockStateSnapshot),
}

impl Default for ShardBlockStateSnapshot {
    fn default() -> Self {
        ShardBlockStateSnapshot::NotBootstrapped
    }
}

impl ShardBlockStateSnapshot {
    pub fn bootstrapped(&self) -> Option<&BootstrappedBlockStateSnapshot> {
        match self {
            ShardBlockStateSnapshot::Bootstrapped(s) => Some(s),
            ShardBlockStateSnapshot::NotBootstrapped => None,
        }
    }

    pub fn warm_retrievable(&self, start: UnixNanos) -> bool {
        self.bootstrapped()
            .and_then(|s| s.get(start))
            .map(|s| s.warm_retrievable)
            .unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct LoadOptions {
    pub bootstrap: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapResult {
    pub num_blocks_moved_to_buffer: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub bootstrap: BootstrapResult,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WriteType {
    Warm,
    Cold,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TruncateType {
    None,
    /// Timestamps are truncated to their block start.
    Block,
}

impl Default for TruncateType {
    fn default() -> Self {
        TruncateType::None
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct WriteOptions {
    pub truncate_type: TruncateType,
    /// Replaces the written value when set.
    pub force_value: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    BlockDoesNotExist,
    FlushedToDisk,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct FetchBlocksMetadataOptions {
    pub include_sizes: bool,
    pub include_checksums: bool,
    pub include_last_read: bool,
    /// Include blocks retrieved from disk and only held as cache.
    pub include_cached_blocks: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    Bootstrapped,
}

impl Default for BootstrapState {
    fn default() -> Self {
        BootstrapState::NotStarted
    }
}
