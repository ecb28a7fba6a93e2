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

//! Immutable encoded blocks and the structures that hold them.

pub mod blocks;
pub mod pool;
pub mod wired_list;

pub use blocks::DatabaseSeriesBlocks;
pub use pool::{BlockPool, DatabaseBlockPool};
pub use wired_list::{WiredList, WiredListOptions};

use crate::error::{Error, Result};
use crate::id::{NamespaceContext, SeriesId, Tags};
use crate::instrument::emit_and_log_invariant_violation;
use crate::sample::Datapoint;
use crate::segment::{self, Segment};
use crate::time::UnixNanos;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicI64, Ordering::SeqCst},
    Arc, Weak,
};
use std::time::Duration;

/// Called by the block retrieval subsystem once a disk read completes.
pub trait OnRetrieveBlock: Send + Sync {
    fn on_retrieve_block(
        &self,
        id: &SeriesId,
        tags: &Tags,
        start: UnixNanos,
        segment: Segment,
        ns: &NamespaceContext,
    );
}

/// Called by the read path for every cached block it serves.
pub trait OnReadBlock {
    fn on_read_block(&self, block: &Arc<DatabaseBlock>);
}

/// Called by the wired list right before it closes a block it evicted.
pub trait OnEvictedFromWiredList: Send + Sync {
    fn on_evicted_from_wired_list(&self, id: &SeriesId, start: UnixNanos);
}

impl<T: OnRetrieveBlock> OnRetrieveBlock for Weak<T> {
    fn on_retrieve_block(
        &self,
        id: &SeriesId,
        tags: &Tags,
        start: UnixNanos,
        segment: Segment,
        ns: &NamespaceContext,
    ) {
        if let Some(target) = self.upgrade() {
            target.on_retrieve_block(id, tags, start, segment, ns);
        }
    }
}

impl<T: OnEvictedFromWiredList> OnEvictedFromWiredList for Weak<T> {
    fn on_evicted_from_wired_list(&self, id: &SeriesId, start: UnixNanos) {
        if let Some(target) = self.upgrade() {
            target.on_evicted_from_wired_list(id, start);
        }
    }
}

/// A readable view of one block start's data.
#[derive(Clone, Debug)]
pub struct BlockReader {
    pub start: UnixNanos,
    pub block_size: Duration,
    pub segment: Segment,
}

impl BlockReader {
    pub fn new(start: UnixNanos, block_size: Duration, segment: Segment) -> Self {
        Self {
            start,
            block_size,
            segment,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }

    pub fn datapoints(&self) -> Result<Vec<Datapoint>> {
        Ok(segment::decode(&self.segment)?)
    }
}

#[derive(Debug)]
pub struct FetchBlockResult {
    pub start: UnixNanos,
    pub first_write: Option<UnixNanos>,
    pub blocks: Vec<BlockReader>,
    pub err: Option<Error>,
}

impl FetchBlockResult {
    pub fn new(start: UnixNanos) -> Self {
        Self {
            start,
            first_write: None,
            blocks: Vec::new(),
            err: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchBlockMetadataResult {
    pub start: UnixNanos,
    pub size: i64,
    pub checksum: Option<u32>,
    pub last_read: Option<UnixNanos>,
}

#[derive(Clone, Debug)]
pub struct FetchBlocksMetadataResult {
    pub id: SeriesId,
    pub tags: Tags,
    pub blocks: Vec<FetchBlockMetadataResult>,
}

struct BlockInner {
    start: UnixNanos,
    block_size: Duration,
    segment: Segment,
    id: Option<SeriesId>,
    ns: NamespaceContext,
    merge_target: Option<Arc<DatabaseBlock>>,
    on_evicted: Option<Arc<dyn OnEvictedFromWiredList>>,
    retrieved_from_disk: bool,
    closed: bool,
}

impl BlockInner {
    fn empty() -> Self {
        BlockInner {
            start: UnixNanos::ZERO,
            block_size: Duration::ZERO,
            segment: Segment::empty(),
            id: None,
            ns: NamespaceContext::default(),
            merge_target: None,
            on_evicted: None,
            retrieved_from_disk: false,
            closed: false,
        }
    }
}

/// An immutable, time bounded run of encoded datapoints for one series.
///
/// Blocks are shared as `Arc<DatabaseBlock>` between a series' block cache and
/// the wired list, and return to their pool on `close`. Exactly one owner may
/// close a block: the series, or the wired list for disk retrieved blocks under
/// the LRU policy.
pub struct DatabaseBlock {
    state: Mutex<BlockInner>,
    last_read: AtomicI64,
    pool: Option<Weak<dyn BlockPool>>,
}

impl DatabaseBlock {
    pub fn new(pool: Option<Weak<dyn BlockPool>>) -> Self {
        Self {
            state: Mutex::new(BlockInner::empty()),
            last_read: AtomicI64::new(0),
            pool,
        }
    }

    /// An unpooled block holding `segment`.
    pub fn new_with(
        start: UnixNanos,
        block_size: Duration,
        segment: Segment,
        ns: NamespaceContext,
    ) -> Arc<Self> {
        let block = Arc::new(Self::new(None));
        block.reset(start, block_size, segment, ns);
        block
    }

    pub fn reset(&self, start: UnixNanos, block_size: Duration, segment: Segment, ns: NamespaceContext) {
        self.reset_with(start, block_size, segment, None, ns);
    }

    pub fn reset_from_disk(
        &self,
        start: UnixNanos,
        block_size: Duration,
        segment: Segment,
        id: SeriesId,
        ns: NamespaceContext,
    ) {
        self.reset_with(start, block_size, segment, Some(id), ns);
    }

    fn reset_with(
        &self,
        start: UnixNanos,
        block_size: Duration,
        segment: Segment,
        id: Option<SeriesId>,
        ns: NamespaceContext,
    ) {
        let mut state = self.state.lock();
        state.start = start;
        state.block_size = block_size;
        state.segment = segment;
        state.retrieved_from_disk = id.is_some();
        state.id = id;
        state.ns = ns;
        state.merge_target = None;
        state.on_evicted = None;
        state.closed = false;
        self.last_read.store(0, SeqCst);
    }

    pub fn start(&self) -> UnixNanos {
        self.state.lock().start
    }

    pub fn block_size(&self) -> Duration {
        self.state.lock().block_size
    }

    /// Series id, only known for blocks retrieved from disk.
    pub fn id(&self) -> Option<SeriesId> {
        self.state.lock().id.clone()
    }

    pub fn namespace(&self) -> NamespaceContext {
        self.state.lock().ns.clone()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        let target = state.merge_target.as_ref().map(|t| t.len()).unwrap_or(0);
        state.segment.len() + target
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn was_retrieved_from_disk(&self) -> bool {
        self.state.lock().retrieved_from_disk
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn last_read_time(&self) -> UnixNanos {
        UnixNanos(self.last_read.load(SeqCst))
    }

    pub fn set_last_read_time(&self, t: UnixNanos) {
        self.last_read.store(t.inner(), SeqCst);
    }

    pub fn has_merge_target(&self) -> bool {
        self.state.lock().merge_target.is_some()
    }

    /// Queues `other` to be folded into this block on the next `stream`.
    /// This block takes ownership of `other`.
    pub fn merge(&self, other: Arc<DatabaseBlock>) {
        let mut state = self.state.lock();
        match &state.merge_target {
            Some(target) => target.merge(other),
            None => state.merge_target = Some(other),
        }
    }

    /// Reader over the block's data, resolving any pending merge first.
    pub fn stream(&self) -> Result<BlockReader> {
        let mut state = self.state.lock();
        if let Some(target) = state.merge_target.take() {
            let other = target.stream()?;
            let merged = segment::merge(&[state.segment.clone(), other.segment])?;
            state.segment = merged;
            target.close();
        }
        Ok(BlockReader::new(
            state.start,
            state.block_size,
            state.segment.clone(),
        ))
    }

    pub fn checksum(&self) -> Result<u32> {
        Ok(self.stream()?.segment.checksum())
    }

    pub fn set_on_evicted_from_wired_list(&self, f: Option<Arc<dyn OnEvictedFromWiredList>>) {
        self.state.lock().on_evicted = f;
    }

    pub fn on_evicted_from_wired_list(&self) -> Option<Arc<dyn OnEvictedFromWiredList>> {
        self.state.lock().on_evicted.clone()
    }

    /// Releases the block's data and returns it to its pool.
    pub fn close(self: &Arc<Self>) {
        let target = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                emit_and_log_invariant_violation("closing an already closed block");
                return;
            }
            state.closed = true;
            state.segment = Segment::empty();
            state.id = None;
            state.on_evicted = None;
            state.merge_target.take()
        };
        if let Some(target) = target {
            target.close();
        }
        if let Some(pool) = self.pool.as_ref().and_then(|p| p.upgrade()) {
            pool.put(self.clone());
        }
    }

    /// Closes the block only if it came from disk. Used by the wired list,
    /// which never owns blocks that were not retrieved.
    pub fn close_if_from_disk(self: &Arc<Self>) -> bool {
        if !self.was_retrieved_from_disk() {
            return false;
        }
        self.close();
        true
    }
}
