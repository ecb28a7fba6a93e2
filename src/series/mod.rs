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

//! Per series storage: write buffer, block cache and the retrieval bridge.
//!
//! All mutable state of a series sits behind one `RwLock`. Calls into the
//! wired list that may wait (`blocking_update`) are made only after that lock
//! is released, and the read path only ever uses `non_blocking_update`, so a
//! wired list eviction calling back into a series cannot deadlock with it.

pub mod buffer;
pub mod options;
pub mod pool;
pub mod reader;
pub mod types;

pub use buffer::DatabaseBuffer;
pub use options::{CachePolicy, Options, RetentionOptions};
pub use pool::{DatabaseSeriesPool, SeriesPool};
pub use reader::QueryableBlockRetriever;
pub use types::*;

use crate::block::{
    BlockReader, DatabaseBlock, DatabaseSeriesBlocks, FetchBlockMetadataResult, FetchBlockResult,
    FetchBlocksMetadataResult, OnEvictedFromWiredList, OnReadBlock, OnRetrieveBlock,
};
use crate::context::Context;
use crate::counters;
use crate::error::{BoxError, Error, Result};
use crate::id::{NamespaceContext, SeriesId, Tags};
use crate::instrument::emit_and_log_invariant_violation;
use crate::sample::Datapoint;
use crate::segment::Segment;
use crate::time::{TimeUnit, UnixNanos};
use log::*;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};

/// Everything a series needs to (re)start serving a new identity.
#[derive(Clone)]
pub struct DatabaseSeriesOptions {
    pub id: SeriesId,
    pub tags: Tags,
    pub block_retriever: Option<Arc<dyn QueryableBlockRetriever>>,
    /// Defaults to the series itself.
    pub on_retrieve_block: Option<Arc<dyn OnRetrieveBlock>>,
    /// Defaults to the series itself.
    pub on_evicted_from_wired_list: Option<Arc<dyn OnEvictedFromWiredList>>,
    pub options: Options,
}

impl DatabaseSeriesOptions {
    pub fn new(id: SeriesId, tags: Tags, options: Options) -> Self {
        DatabaseSeriesOptions {
            id,
            tags,
            block_retriever: None,
            on_retrieve_block: None,
            on_evicted_from_wired_list: None,
            options,
        }
    }

    pub fn with_block_retriever(mut self, r: Arc<dyn QueryableBlockRetriever>) -> Self {
        self.block_retriever = Some(r);
        self
    }

    pub fn with_on_retrieve_block(mut self, f: Arc<dyn OnRetrieveBlock>) -> Self {
        self.on_retrieve_block = Some(f);
        self
    }

    pub fn with_on_evicted_from_wired_list(mut self, f: Arc<dyn OnEvictedFromWiredList>) -> Self {
        self.on_evicted_from_wired_list = Some(f);
        self
    }
}

struct SeriesInner {
    id: Option<SeriesId>,
    tags: Tags,
    bs: BootstrapState,
    blocks: DatabaseSeriesBlocks,
    buffer: DatabaseBuffer,
    retriever: Option<Arc<dyn QueryableBlockRetriever>>,
    on_retrieve: Option<Arc<dyn OnRetrieveBlock>>,
    on_evicted: Option<Arc<dyn OnEvictedFromWiredList>>,
    opts: Options,
}

impl OnReadBlock for SeriesInner {
    fn on_read_block(&self, block: &Arc<DatabaseBlock>) {
        // Recency touch only. The wired list already owns the block since it
        // was retrieved, so a dropped update is harmless.
        if !block.was_retrieved_from_disk() {
            return;
        }
        if let Some(wired_list) = &self.opts.wired_list {
            wired_list.non_blocking_update(block.clone());
        }
    }
}

#[derive(Default)]
struct UpdateBlocksResult {
    status: TickStatus,
    made_expired_blocks: usize,
    made_unwired_blocks: usize,
}

impl SeriesInner {
    fn update_blocks_with_lock(
        &mut self,
        block_states: &ShardBlockStateSnapshot,
        evicted_bucket_times: &BTreeSet<UnixNanos>,
    ) -> UpdateBlocksResult {
        let mut result = UpdateBlocksResult::default();
        let now = self.opts.clock.now();
        let retention = self.opts.retention;
        let cache_policy = self.opts.cache_policy;
        let expire_cutoff = now
            .sub(retention.retention_period)
            .truncate(retention.block_size);
        let wired_timeout = retention.block_data_expiry_after_not_accessed_period;

        for start in self.blocks.starts() {
            let block = match self.blocks.block_at(start) {
                Some(block) => block.clone(),
                None => continue,
            };

            if start.before(expire_cutoff) || evicted_bucket_times.contains(&start) {
                self.blocks.remove_block_at(start);
                // Disk blocks under LRU are closed by the wired list.
                if !(cache_policy == CachePolicy::Lru && block.was_retrieved_from_disk()) {
                    block.close();
                }
                result.made_expired_blocks += 1;
                continue;
            }

            result.status.active_blocks += 1;

            if cache_policy == CachePolicy::All {
                result.status.wired_blocks += 1;
                continue;
            }

            // Never unwire before the data is retrievable from disk.
            let should_unwire = block_states.warm_retrievable(start)
                && match cache_policy {
                    CachePolicy::None => true,
                    CachePolicy::RecentlyRead => {
                        now.since(block.last_read_time()) >= wired_timeout
                    }
                    CachePolicy::Lru => !block.was_retrieved_from_disk(),
                    CachePolicy::All => false,
                };

            if should_unwire {
                self.blocks.remove_block_at(start);
                block.close();
                result.status.unwired_blocks += 1;
                result.made_unwired_blocks += 1;
            } else {
                result.status.wired_blocks += 1;
                if block.has_merge_target() {
                    result.status.pending_merge_blocks += 1;
                }
            }
        }

        let buffer_stats = self.buffer.stats();
        result.status.active_blocks += buffer_stats.wired_blocks;
        result.status.wired_blocks += buffer_stats.wired_blocks;
        result
    }

    fn load_with_lock(
        &mut self,
        blocks: Vec<Arc<DatabaseBlock>>,
        block_states: &BootstrappedBlockStateSnapshot,
    ) -> LoadResult {
        let mut result = LoadResult::default();
        for block in blocks {
            let start = block.start();
            // Data never warm flushed has to go out through the warm path,
            // anything already on disk gets re-persisted by a cold flush.
            let write_type = match block_states.get(start) {
                Some(state) if state.warm_retrievable => WriteType::Cold,
                _ => WriteType::Warm,
            };
            self.buffer.load(block, write_type);
            result.bootstrap.num_blocks_moved_to_buffer += 1;
        }
        result
    }

    fn require_id(&self) -> Result<SeriesId> {
        self.id.clone().ok_or(Error::Closed)
    }
}

/// Storage for a single time series.
pub struct DatabaseSeries {
    inner: RwLock<SeriesInner>,
    pool: Option<Weak<dyn SeriesPool>>,
    this: Weak<DatabaseSeries>,
}

impl DatabaseSeries {
    pub fn new(opts: DatabaseSeriesOptions) -> Result<Arc<Self>> {
        let series = Self::new_pooled(None, opts.options.clone());
        series.reset(opts)?;
        Ok(series)
    }

    /// An empty series that returns to `pool` on close. Needs a `reset`
    /// before use.
    pub fn new_pooled(pool: Option<Weak<dyn SeriesPool>>, opts: Options) -> Arc<Self> {
        Arc::new_cyclic(|this| DatabaseSeries {
            inner: RwLock::new(SeriesInner {
                id: None,
                tags: Tags::empty(),
                bs: BootstrapState::NotStarted,
                blocks: DatabaseSeriesBlocks::new(),
                buffer: DatabaseBuffer::new(opts.clone()),
                retriever: None,
                on_retrieve: None,
                on_evicted: None,
                opts,
            }),
            pool,
            this: this.clone(),
        })
    }

    /// Re-initializes the series for a new identity. The series must have
    /// been closed or never used.
    pub fn reset(&self, opts: DatabaseSeriesOptions) -> Result<()> {
        opts.options.validate()?;
        let mut inner = self.inner.write();
        inner.id = Some(opts.id);
        inner.tags = opts.tags;
        inner.bs = BootstrapState::NotStarted;
        inner.blocks.reset();
        inner.buffer.reset(opts.options.clone());
        inner.retriever = opts.block_retriever;
        inner.on_retrieve = opts.on_retrieve_block;
        inner.on_evicted = opts.on_evicted_from_wired_list;
        inner.opts = opts.options;
        Ok(())
    }

    /// `None` once closed.
    pub fn id(&self) -> Option<SeriesId> {
        self.inner.read().id.clone()
    }

    pub fn tags(&self) -> Tags {
        self.inner.read().tags.clone()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.inner.read().bs == BootstrapState::Bootstrapped
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.blocks.is_empty() && inner.buffer.is_empty()
    }

    pub fn num_active_blocks(&self) -> usize {
        let inner = self.inner.read();
        inner.blocks.len() + inner.buffer.stats().wired_blocks
    }

    /// Expires and unwires blocks. Returns `Error::AllDatapointsExpired`,
    /// carrying the counters, once the series holds nothing active.
    pub fn tick(&self, block_states: &ShardBlockStateSnapshot) -> Result<TickResult> {
        let mut result = TickResult::default();
        let update = {
            let mut inner = self.inner.write();
            let buffer_result = inner.buffer.tick(block_states);
            result.merged_out_of_order_blocks = buffer_result.merged_out_of_order_blocks;
            result.evicted_buckets = buffer_result.evicted_bucket_times.len();
            inner.update_blocks_with_lock(block_states, &buffer_result.evicted_bucket_times)
        };

        result.tick_status = update.status;
        result.made_expired_blocks = update.made_expired_blocks;
        result.made_unwired_blocks = update.made_unwired_blocks;
        counters::record_tick(&result);
        if result.tick_status.active_blocks > 0 {
            return Ok(result);
        }
        Err(Error::AllDatapointsExpired(result))
    }

    pub fn write(
        &self,
        ctx: &Context,
        timestamp: UnixNanos,
        value: f64,
        unit: TimeUnit,
        annotation: Option<Vec<u8>>,
        wopts: WriteOptions,
    ) -> Result<(bool, WriteType)> {
        let mut inner = self.inner.write();
        let id = inner.require_id()?;
        let dp = Datapoint {
            timestamp,
            value,
            unit,
            annotation,
        };
        inner.buffer.write(ctx, &id, dp, wopts)
    }

    fn on_retrieve_hook(&self, inner: &SeriesInner) -> Arc<dyn OnRetrieveBlock> {
        match &inner.on_retrieve {
            Some(f) => f.clone(),
            None => Arc::new(self.this.clone()),
        }
    }

    fn on_evicted_hook(&self, inner: &SeriesInner) -> Arc<dyn OnEvictedFromWiredList> {
        match &inner.on_evicted {
            Some(f) => f.clone(),
            None => Arc::new(self.this.clone()),
        }
    }

    /// Readers grouped per block start in `[start, end)`, ascending. Blocks
    /// missing from the cache are streamed from the retriever, which caches
    /// them through `on_retrieve_block`.
    pub fn read_encoded(
        &self,
        ctx: &Context,
        start: UnixNanos,
        end: UnixNanos,
        ns: &NamespaceContext,
    ) -> Result<Vec<Vec<BlockReader>>> {
        let (mut pending, retrieval) = {
            let inner = self.inner.read();
            let id = inner.require_id()?;
            let pending = reader::plan_read(
                ctx,
                &inner.opts,
                &inner.blocks,
                &inner.buffer,
                inner.retriever.as_deref(),
                &*inner,
                start,
                end,
            )?;
            let retrieval = match (&inner.retriever, pending.misses().is_empty()) {
                (Some(r), false) => Some((r.clone(), id, self.on_retrieve_hook(&inner))),
                _ => None,
            };
            (pending, retrieval)
        };

        if let Some((retriever, id, on_retrieve)) = retrieval {
            reader::retrieve(ctx, &*retriever, &id, Some(on_retrieve), ns, &mut pending)?;
        }
        Ok(pending.into_groups())
    }

    pub fn fetch_blocks(
        &self,
        ctx: &Context,
        starts: &[UnixNanos],
        ns: &NamespaceContext,
    ) -> Result<Vec<FetchBlockResult>> {
        let (mut pending, retrieval) = {
            let inner = self.inner.read();
            let id = inner.require_id()?;
            let pending = reader::plan_fetch(
                ctx,
                &inner.opts,
                &inner.blocks,
                &inner.buffer,
                inner.retriever.as_deref(),
                &*inner,
                starts,
            );
            let retrieval = match (&inner.retriever, pending.misses().is_empty()) {
                (Some(r), false) => Some((r.clone(), id, self.on_retrieve_hook(&inner))),
                _ => None,
            };
            (pending, retrieval)
        };

        if let Some((retriever, id, on_retrieve)) = retrieval {
            reader::retrieve_fetch(ctx, &*retriever, &id, Some(on_retrieve), ns, &mut pending);
        }
        Ok(pending.into_results())
    }

    pub fn fetch_blocks_metadata(
        &self,
        ctx: &Context,
        start: UnixNanos,
        end: UnixNanos,
        opts: FetchBlocksMetadataOptions,
    ) -> Result<FetchBlocksMetadataResult> {
        let inner = self.inner.read();
        let id = inner.require_id()?;
        let block_size = inner.opts.retention.block_size;

        let mut results = Vec::new();
        if !inner.buffer.is_empty() {
            results.extend(inner.buffer.fetch_blocks_metadata(ctx, start, end, opts)?);
        }

        for (t, block) in inner.blocks.all_blocks().iter() {
            if !t.before(end) || !start.before(t.add(block_size)) {
                continue;
            }
            if !opts.include_cached_blocks && block.was_retrieved_from_disk() {
                continue;
            }
            let mut result = FetchBlockMetadataResult {
                start: *t,
                ..Default::default()
            };
            if opts.include_sizes {
                result.size = block.len() as i64;
            }
            if opts.include_checksums {
                result.checksum = Some(block.checksum()?);
            }
            if opts.include_last_read {
                result.last_read = Some(block.last_read_time());
            }
            results.push(result);
        }
        results.sort_by_key(|r| r.start);

        Ok(FetchBlocksMetadataResult {
            id,
            tags: inner.tags.clone(),
            blocks: results,
        })
    }

    /// Seals the cold writes of `start` at `version` and returns them.
    pub fn fetch_blocks_for_cold_flush(
        &self,
        ctx: &Context,
        start: UnixNanos,
        version: i32,
    ) -> Result<Segment> {
        let mut inner = self.inner.write();
        inner.buffer.fetch_blocks_for_cold_flush(ctx, start, version)
    }

    /// Hands `blocks` to the buffer. With `opts.bootstrap` this is the one
    /// time bootstrap of the series.
    pub fn load(
        &self,
        opts: LoadOptions,
        blocks: Vec<Arc<DatabaseBlock>>,
        block_states: &BootstrappedBlockStateSnapshot,
    ) -> Result<LoadResult> {
        if opts.bootstrap {
            return self.bootstrap(blocks, block_states);
        }
        let mut inner = self.inner.write();
        Ok(inner.load_with_lock(blocks, block_states))
    }

    fn bootstrap(
        &self,
        blocks: Vec<Arc<DatabaseBlock>>,
        block_states: &BootstrappedBlockStateSnapshot,
    ) -> Result<LoadResult> {
        let mut inner = self.inner.write();
        if inner.bs == BootstrapState::Bootstrapped {
            return Err(Error::AlreadyBootstrapped);
        }
        let result = inner.load_with_lock(blocks, block_states);
        inner.bs = BootstrapState::Bootstrapped;
        if let Some(id) = &inner.id {
            debug!(
                "bootstrapped series {}, {} blocks moved to buffer",
                id, result.bootstrap.num_blocks_moved_to_buffer
            );
        }
        Ok(result)
    }

    pub fn warm_flush<F>(&self, ctx: &Context, start: UnixNanos, persist_fn: &mut F) -> Result<FlushOutcome>
    where
        F: FnMut(&SeriesId, &Tags, Segment, u32) -> std::result::Result<(), BoxError>,
    {
        let mut inner = self.inner.write();
        if inner.bs != BootstrapState::Bootstrapped {
            return Err(Error::NotBootstrapped);
        }
        let id = inner.require_id()?;
        let tags = inner.tags.clone();
        inner.buffer.warm_flush(ctx, start, &id, &tags, persist_fn)
    }

    pub fn snapshot<F>(&self, ctx: &Context, start: UnixNanos, persist_fn: &mut F) -> Result<()>
    where
        F: FnMut(&SeriesId, &Tags, Segment, u32) -> std::result::Result<(), BoxError>,
    {
        let inner = self.inner.write();
        if inner.bs != BootstrapState::Bootstrapped {
            return Err(Error::NotBootstrapped);
        }
        let id = inner.require_id()?;
        inner.buffer.snapshot(ctx, start, &id, &inner.tags, persist_fn)
    }

    pub fn cold_flush_block_starts(&self, block_states: &BootstrappedBlockStateSnapshot) -> BTreeSet<UnixNanos> {
        self.inner.read().buffer.cold_flush_block_starts(block_states)
    }

    /// Drops identity and data and returns the series to its pool. Under the
    /// LRU policy, blocks retrieved from disk are left for the wired list to
    /// close.
    pub fn close(&self) {
        {
            let mut inner = self.inner.write();
            inner.id = None;
            inner.tags = Tags::empty();
            inner.bs = BootstrapState::NotStarted;
            let policy = inner.opts.cache_policy;
            match policy {
                CachePolicy::Lru => {
                    for block in inner.blocks.all_blocks().values() {
                        if !block.was_retrieved_from_disk() {
                            block.close();
                        }
                    }
                    inner.blocks.reset();
                }
                _ => inner.blocks.remove_all(),
            }
            let opts = inner.opts.clone();
            inner.buffer.reset(opts);
            inner.retriever = None;
            inner.on_retrieve = None;
            inner.on_evicted = None;
        }

        if let (Some(pool), Some(this)) = (
            self.pool.as_ref().and_then(|p| p.upgrade()),
            self.this.upgrade(),
        ) {
            pool.put(this);
        }
    }

    /// Recency touch for a block served by a read. Never waits: if the
    /// series is being written to, the touch is dropped.
    pub fn on_read_block(&self, block: &Arc<DatabaseBlock>) {
        if let Some(inner) = self.inner.try_read_recursive() {
            inner.on_read_block(block);
        }
    }

    /// Block starts currently in the block cache.
    pub fn cached_block_starts(&self) -> HashSet<UnixNanos> {
        self.inner.read().blocks.starts().into_iter().collect()
    }
}

impl OnRetrieveBlock for DatabaseSeries {
    fn on_retrieve_block(
        &self,
        id: &SeriesId,
        _tags: &Tags,
        start: UnixNanos,
        segment: Segment,
        ns: &NamespaceContext,
    ) {
        let (block, wired_list) = {
            let mut inner = self.inner.write();
            // Series was reset for another identity while the read was in
            // flight.
            if inner.id.as_ref() != Some(id) {
                debug!("dropping retrieved block {} for stale series {}", start, id);
                return;
            }

            let block = inner.opts.block_pool.get();
            block.reset_from_disk(
                start,
                inner.opts.retention.block_size,
                segment,
                id.clone(),
                ns.clone(),
            );
            block.set_last_read_time(inner.opts.clock.now());
            block.set_on_evicted_from_wired_list(Some(self.on_evicted_hook(&inner)));

            let lru = inner.opts.cache_policy == CachePolicy::Lru;
            if let Some(replaced) = inner.blocks.add_block(block.clone()) {
                if !(lru && replaced.was_retrieved_from_disk()) {
                    replaced.close();
                }
            }
            (block, inner.opts.wired_list.clone())
        };

        // The list takes over closing the block, so this update must not be
        // dropped. Done unlocked since an eviction may call back into us.
        if let Some(wired_list) = wired_list {
            wired_list.blocking_update(block);
        }
    }
}

impl OnEvictedFromWiredList for DatabaseSeries {
    fn on_evicted_from_wired_list(&self, id: &SeriesId, start: UnixNanos) {
        let mut inner = self.inner.write();
        if inner.id.as_ref() != Some(id) {
            return;
        }

        let block = match inner.blocks.block_at(start) {
            Some(block) => block.clone(),
            None => return,
        };
        if !block.was_retrieved_from_disk() {
            emit_and_log_invariant_violation(&format!(
                "wired list evicted a block not retrieved from disk: id={}, start={}",
                id, start
            ));
            return;
        }
        // Already closed by the wired list.
        inner.blocks.remove_block_at(start);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::{WiredList, WiredListOptions};
    use crate::clock::ManualClock;
    use crate::constants::WARM_FLUSHED_BUCKET_VERSION;
    use crate::segment;
    use crate::test_utils::*;
    use rand::{thread_rng, Rng};
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    struct Harness {
        clock: ManualClock,
        pool: Arc<SpyBlockPool>,
        series: Arc<DatabaseSeries>,
    }

    fn options(clock: &ManualClock, pool: &Arc<SpyBlockPool>, policy: CachePolicy) -> Options {
        Options::default()
            .with_clock(Arc::new(clock.clone()))
            .with_block_pool(pool.clone())
            .with_cache_policy(policy)
            .with_retention(
                RetentionOptions::default()
                    .with_block_size(2 * HOUR)
                    .with_retention_period(48 * HOUR)
                    .with_buffer_past(Duration::from_secs(600))
                    .with_buffer_future(Duration::from_secs(120))
                    .with_block_data_expiry_after_not_accessed_period(HOUR),
            )
    }

    fn harness_with(policy: CachePolicy, f: impl FnOnce(Options) -> DatabaseSeriesOptions) -> Harness {
        init_logging();
        let clock = ManualClock::new(UnixNanos::from_secs(1000 * 3600));
        let pool = SpyBlockPool::new();
        let series = DatabaseSeries::new(f(options(&clock, &pool, policy))).unwrap();
        Harness { clock, pool, series }
    }

    fn harness(policy: CachePolicy) -> Harness {
        harness_with(policy, |o| {
            DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::from(vec![("k", "v")]), o)
        })
    }

    impl Harness {
        fn now(&self) -> UnixNanos {
            self.clock.now()
        }

        fn block_start(&self, ago: Duration) -> UnixNanos {
            self.now().sub(ago).truncate(2 * HOUR)
        }

        /// Puts a block into the cache as if it came from buffer rotation.
        fn cache_memory_block(&self, start: UnixNanos) -> Arc<DatabaseBlock> {
            let block = self.pool.get();
            block.reset(start, 2 * HOUR, segment_of(&[(start.inner(), 1.0)]), NamespaceContext::default());
            self.series.inner.write().blocks.add_block(block.clone());
            block
        }

        fn retrieve(&self, start: UnixNanos) -> Arc<DatabaseBlock> {
            self.series.on_retrieve_block(
                &SeriesId::from("foo"),
                &Tags::empty(),
                start,
                segment_of(&[(start.inner(), 2.0)]),
                &NamespaceContext::default(),
            );
            self.series.inner.read().blocks.block_at(start).unwrap().clone()
        }

        fn write(&self, t: UnixNanos, v: f64) -> Result<(bool, WriteType)> {
            self.series.write(&Context::background(), t, v, TimeUnit::Second, None, WriteOptions::default())
        }
    }

    fn all_retrievable(starts: &[UnixNanos]) -> ShardBlockStateSnapshot {
        ShardBlockStateSnapshot::Bootstrapped(
            starts.iter().map(|s| (*s, BlockState::warm_retrievable())).collect(),
        )
    }

    #[test]
    fn test_recently_read_unwires_after_timeout() {
        let h = harness(CachePolicy::RecentlyRead);
        let start = h.now().sub(3 * HOUR);
        let block = h.cache_memory_block(start);
        block.set_last_read_time(h.now().sub(2 * HOUR));

        let result = h.series.tick(&all_retrievable(&[start])).unwrap();
        assert_eq!(result.made_unwired_blocks, 1);
        assert_eq!(result.tick_status.active_blocks, 1);
        assert_eq!(result.tick_status.unwired_blocks, 1);
        assert_eq!(result.tick_status.wired_blocks, 0);
        assert!(block.is_closed());
        assert!(h.series.cached_block_starts().is_empty());
    }

    #[test]
    fn test_recently_read_keeps_fresh_blocks() {
        let h = harness(CachePolicy::RecentlyRead);
        let start = h.block_start(4 * HOUR);
        let block = h.cache_memory_block(start);
        block.set_last_read_time(h.now().sub(Duration::from_secs(60)));
        let result = h.series.tick(&all_retrievable(&[start])).unwrap();
        assert_eq!(result.made_unwired_blocks, 0);
        assert_eq!(result.tick_status.wired_blocks, 1);
        assert!(!block.is_closed());
    }

    #[test]
    fn test_never_unwires_before_warm_retrievable() {
        let mut rng = thread_rng();
        for policy in CachePolicy::ALL.iter() {
            let h = harness(*policy);
            let mut blocks = Vec::new();
            for i in 1..10u32 {
                let start = h.block_start(2 * HOUR * i);
                let block = if rng.gen_bool(0.5) {
                    h.retrieve(start)
                } else {
                    h.cache_memory_block(start)
                };
                block.set_last_read_time(UnixNanos::ZERO);
                blocks.push(block);
            }
            let not_retrievable = ShardBlockStateSnapshot::Bootstrapped(
                blocks.iter().map(|b| (b.start(), BlockState::default())).collect(),
            );
            for states in [ShardBlockStateSnapshot::NotBootstrapped, not_retrievable] {
                let result = h.series.tick(&states).unwrap();
                assert_eq!(result.made_unwired_blocks, 0, "policy {}", policy);
                assert_eq!(result.tick_status.unwired_blocks, 0);
                assert_eq!(result.tick_status.active_blocks, blocks.len());
            }
            assert!(blocks.iter().all(|b| !b.is_closed()));
            assert_eq!(h.pool.puts(), 0);
        }
    }

    #[test]
    fn test_cache_none_and_all() {
        let h = harness(CachePolicy::None);
        let start = h.block_start(4 * HOUR);
        let block = h.cache_memory_block(start);
        let result = h.series.tick(&all_retrievable(&[start])).unwrap();
        assert_eq!(result.made_unwired_blocks, 1);
        assert!(block.is_closed());

        let h = harness(CachePolicy::All);
        let block = h.cache_memory_block(start);
        let result = h.series.tick(&all_retrievable(&[start])).unwrap();
        assert_eq!(result.made_unwired_blocks, 0);
        assert_eq!(result.tick_status.wired_blocks, 1);
        assert!(!block.is_closed());
    }

    #[test]
    fn test_lru_tick_only_unwires_memory_blocks() {
        let h = harness(CachePolicy::Lru);
        let disk_start = h.block_start(4 * HOUR);
        let mem_start = h.block_start(6 * HOUR);
        let disk = h.retrieve(disk_start);
        let mem = h.cache_memory_block(mem_start);

        let result = h.series.tick(&all_retrievable(&[disk_start, mem_start])).unwrap();
        assert_eq!(result.made_unwired_blocks, 1);
        assert!(mem.is_closed());
        assert!(!disk.is_closed());
        assert_eq!(h.series.cached_block_starts(), vec![disk_start].into_iter().collect());
    }

    #[test]
    fn test_lru_disk_blocks_never_closed_by_series() {
        let clock = ManualClock::new(UnixNanos::from_secs(1000 * 3600));
        let wired_list = WiredList::new(
            WiredListOptions::default()
                .with_max_wired_blocks(1)
                .with_clock(Arc::new(clock.clone())),
        );
        let h = harness_with(CachePolicy::Lru, |o| {
            DatabaseSeriesOptions::new(
                SeriesId::from("foo"),
                Tags::empty(),
                o.with_wired_list(Some(wired_list.clone())),
            )
        });

        // Expired by retention while still owned by the wired list.
        let old = h.retrieve(h.block_start(60 * HOUR));
        let kept = h.retrieve(h.block_start(4 * HOUR));
        let result = h.series.tick(&ShardBlockStateSnapshot::NotBootstrapped).unwrap();
        assert_eq!(result.made_expired_blocks, 1);
        assert!(h.series.cached_block_starts().len() == 1);

        // Queue order: old, kept. Max of one evicts old exactly once.
        wired_list.process_pending();
        assert!(old.is_closed());
        assert!(!kept.is_closed());
        assert_eq!(h.pool.puts(), 1);

        h.series.close();
        assert!(!kept.is_closed());
        assert_eq!(h.pool.puts(), 1);

        wired_list.set_max_wired_blocks(0);
        wired_list.blocking_update(kept.clone());
        wired_list.process_pending();
        assert!(kept.is_closed());
        assert_eq!(h.pool.puts(), 2);
    }

    #[test]
    fn test_wired_list_eviction_removes_cache_entry() {
        let wired_list = WiredList::new(WiredListOptions::default().with_max_wired_blocks(1));
        let h = harness_with(CachePolicy::Lru, |o| {
            DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::empty(), o.with_wired_list(Some(wired_list.clone())))
        });
        let first = h.block_start(4 * HOUR);
        let second = h.block_start(6 * HOUR);
        h.retrieve(first);
        h.retrieve(second);
        wired_list.process_pending();
        assert_eq!(h.series.cached_block_starts(), vec![second].into_iter().collect());
    }

    #[test]
    fn test_eviction_of_memory_block_is_ignored() {
        let h = harness(CachePolicy::Lru);
        let start = h.block_start(4 * HOUR);
        let block = h.cache_memory_block(start);
        h.series.on_evicted_from_wired_list(&SeriesId::from("foo"), start);
        assert!(h.series.cached_block_starts().contains(&start));
        assert!(!block.is_closed());

        // Unknown identity.
        let start = h.block_start(6 * HOUR);
        h.retrieve(start);
        h.series.on_evicted_from_wired_list(&SeriesId::from("bar"), start);
        assert!(h.series.cached_block_starts().contains(&start));
    }

    #[test]
    fn test_retrieve_ignores_other_identity() {
        let h = harness(CachePolicy::RecentlyRead);
        let start = h.block_start(4 * HOUR);
        h.series.on_retrieve_block(
            &SeriesId::from("bar"),
            &Tags::empty(),
            start,
            segment_of(&[(start.inner(), 1.0)]),
            &NamespaceContext::default(),
        );
        assert!(h.series.cached_block_starts().is_empty());
        assert_eq!(h.pool.puts(), 0);
    }

    #[test]
    fn test_retrieve_replaces_and_closes() {
        let h = harness(CachePolicy::RecentlyRead);
        let start = h.block_start(4 * HOUR);
        let first = h.retrieve(start);
        assert_eq!(first.last_read_time(), h.now());
        let second = h.retrieve(start);
        assert!(first.is_closed());
        assert!(!second.is_closed());

        let h = harness(CachePolicy::Lru);
        let first = h.retrieve(start);
        h.retrieve(start);
        assert!(!first.is_closed());
    }

    #[test]
    fn test_all_datapoints_expired() {
        let h = harness(CachePolicy::RecentlyRead);
        let block = h.cache_memory_block(h.block_start(50 * HOUR));
        match h.series.tick(&ShardBlockStateSnapshot::NotBootstrapped) {
            Err(Error::AllDatapointsExpired(result)) => {
                assert_eq!(result.tick_status.active_blocks, 0);
                assert_eq!(result.made_expired_blocks, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(block.is_closed());
        assert!(h.series.is_empty());
    }

    #[test]
    fn test_buffer_keeps_series_active() {
        let h = harness(CachePolicy::RecentlyRead);
        let (written, write_type) = h.write(h.now(), 1.0).unwrap();
        assert!(written);
        assert_eq!(write_type, WriteType::Warm);
        let result = h.series.tick(&ShardBlockStateSnapshot::NotBootstrapped).unwrap();
        assert_eq!(result.tick_status.active_blocks, 1);
        assert_eq!(result.tick_status.wired_blocks, 1);
        assert_eq!(h.series.num_active_blocks(), 1);
    }

    #[test]
    fn test_pending_merge_counted() {
        let h = harness(CachePolicy::RecentlyRead);
        let start = h.block_start(4 * HOUR);
        let block = h.cache_memory_block(start);
        block.set_last_read_time(h.now());
        block.merge(DatabaseBlock::new_with(start, 2 * HOUR, segment_of(&[(start.inner() + 1, 3.0)]), NamespaceContext::default()));
        let result = h.series.tick(&all_retrievable(&[start])).unwrap();
        assert_eq!(result.tick_status.pending_merge_blocks, 1);
    }

    #[test]
    fn test_bootstrap_once() {
        let h = harness(CachePolicy::RecentlyRead);
        let start = h.block_start(4 * HOUR);
        let block = DatabaseBlock::new_with(start, 2 * HOUR, segment_of(&[(start.inner(), 1.0)]), NamespaceContext::default());
        let opts = LoadOptions { bootstrap: true };
        let states = BootstrappedBlockStateSnapshot::default();

        let result = h.series.load(opts, vec![block], &states).unwrap();
        assert_eq!(result.bootstrap.num_blocks_moved_to_buffer, 1);
        assert!(h.series.is_bootstrapped());

        let again = DatabaseBlock::new_with(start, 2 * HOUR, segment_of(&[(start.inner(), 1.0)]), NamespaceContext::default());
        assert!(matches!(h.series.load(opts, vec![again], &states), Err(Error::AlreadyBootstrapped)));
        assert_eq!(h.series.inner.read().buffer.bucket_write_types(start), vec![WriteType::Warm]);

        // Plain loads after bootstrap are fine.
        let later = DatabaseBlock::new_with(start, 2 * HOUR, Segment::empty(), NamespaceContext::default());
        let result = h.series.load(LoadOptions::default(), vec![later], &states).unwrap();
        assert_eq!(result.bootstrap.num_blocks_moved_to_buffer, 1);
    }

    #[test]
    fn test_load_routes_by_warm_retrievable() {
        let h = harness(CachePolicy::RecentlyRead);
        let warm = h.block_start(4 * HOUR);
        let cold = h.block_start(6 * HOUR);
        let states: BootstrappedBlockStateSnapshot = vec![
            (warm, BlockState::default()),
            (cold, BlockState::warm_retrievable()),
        ]
        .into_iter()
        .collect();
        let blocks = vec![
            DatabaseBlock::new_with(warm, 2 * HOUR, segment_of(&[(warm.inner(), 1.0)]), NamespaceContext::default()),
            DatabaseBlock::new_with(cold, 2 * HOUR, segment_of(&[(cold.inner(), 1.0)]), NamespaceContext::default()),
        ];
        h.series.load(LoadOptions { bootstrap: true }, blocks, &states).unwrap();
        let inner = h.series.inner.read();
        assert_eq!(inner.buffer.bucket_write_types(warm), vec![WriteType::Warm]);
        assert_eq!(inner.buffer.bucket_write_types(cold), vec![WriteType::Cold]);
    }

    #[test]
    fn test_flush_requires_bootstrap() {
        let h = harness(CachePolicy::RecentlyRead);
        let now = h.now();
        h.write(now, 1.0).unwrap();
        let mut persisted = RecordingPersist::default();
        let start = now.truncate(2 * HOUR);
        let ctx = Context::background();
        assert!(matches!(h.series.warm_flush(&ctx, start, &mut persisted.func()), Err(Error::NotBootstrapped)));
        assert!(matches!(h.series.snapshot(&ctx, start, &mut persisted.func()), Err(Error::NotBootstrapped)));

        h.series
            .load(LoadOptions { bootstrap: true }, Vec::new(), &BootstrappedBlockStateSnapshot::default())
            .unwrap();
        h.series.snapshot(&ctx, start, &mut persisted.func()).unwrap();
        let outcome = h.series.warm_flush(&ctx, start, &mut persisted.func()).unwrap();
        assert_eq!(outcome, FlushOutcome::FlushedToDisk);
        let entries = persisted.take();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(id, _, _)| *id == SeriesId::from("foo")));
        assert_eq!(
            h.series.inner.read().buffer.bucket_versions(start),
            vec![WARM_FLUSHED_BUCKET_VERSION]
        );
    }

    #[test]
    fn test_cold_flush_through_series() {
        let h = harness_with(CachePolicy::RecentlyRead, |o| {
            DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::empty(), o.with_cold_writes_enabled(true))
        });
        let t = h.now().sub(5 * HOUR);
        let start = t.truncate(2 * HOUR);
        assert_eq!(h.write(t, 1.0).unwrap(), (true, WriteType::Cold));
        let snapshot = BootstrappedBlockStateSnapshot::default();
        assert!(h.series.cold_flush_block_starts(&snapshot).contains(&start));
        let segment = h.series.fetch_blocks_for_cold_flush(&Context::background(), start, 1).unwrap();
        assert_eq!(segment::decode(&segment).unwrap().len(), 1);
    }

    #[test]
    fn test_fetch_blocks_metadata_filters_and_sorts() {
        let h = harness(CachePolicy::RecentlyRead);
        let a = h.block_start(8 * HOUR);
        let b = h.block_start(6 * HOUR);
        let c = h.block_start(4 * HOUR);
        h.cache_memory_block(c);
        h.retrieve(b);
        h.cache_memory_block(a);
        h.write(h.now(), 1.0).unwrap();

        let ctx = Context::background();
        let range_end = h.now().add(2 * HOUR);
        let opts = FetchBlocksMetadataOptions {
            include_sizes: true,
            include_checksums: true,
            include_last_read: true,
            include_cached_blocks: false,
        };
        let res = h.series.fetch_blocks_metadata(&ctx, a, range_end, opts).unwrap();
        assert_eq!(res.id, SeriesId::from("foo"));
        assert_eq!(res.tags.get(b"k"), Some(&b"v"[..]));
        let starts: Vec<UnixNanos> = res.blocks.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![a, c, h.now().truncate(2 * HOUR)]);
        assert!(res.blocks[0].checksum.is_some());
        assert!(res.blocks[0].size > 0);

        let opts = FetchBlocksMetadataOptions {
            include_cached_blocks: true,
            ..opts
        };
        let res = h.series.fetch_blocks_metadata(&ctx, a, range_end, opts).unwrap();
        let starts: Vec<UnixNanos> = res.blocks.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![a, b, c, h.now().truncate(2 * HOUR)]);
    }

    #[test]
    fn test_read_retrieves_and_caches() {
        let retriever = Arc::new(FakeRetriever::new());
        let r = retriever.clone();
        let h = harness_with(CachePolicy::RecentlyRead, move |o| {
            DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::empty(), o).with_block_retriever(r)
        });
        let start = h.block_start(4 * HOUR);
        retriever.insert(&SeriesId::from("foo"), start, segment_of(&[(start.inner(), 9.0)]));
        h.write(h.now(), 1.0).unwrap();

        let ctx = Context::background();
        let ns = NamespaceContext::new("ns");
        let end = h.now().add(2 * HOUR);
        let groups = h.series.read_encoded(&ctx, start, end, &ns).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].datapoints().unwrap()[0].value, 9.0);
        assert_eq!(retriever.streams(), 1);
        assert!(h.series.cached_block_starts().contains(&start));

        // Served from the cache this time.
        let groups = h.series.read_encoded(&ctx, start, end, &ns).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(retriever.streams(), 1);

        let results = h.series.fetch_blocks(&ctx, &[start], &ns).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].blocks.len(), 1);
    }

    #[test]
    fn test_read_touches_wired_list() {
        let retriever = Arc::new(FakeRetriever::new());
        let wired_list = WiredList::new(WiredListOptions::default());
        let r = retriever.clone();
        let wl = wired_list.clone();
        let h = harness_with(CachePolicy::Lru, move |o| {
            DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::empty(), o.with_wired_list(Some(wl)))
                .with_block_retriever(r)
        });
        let start = h.block_start(4 * HOUR);
        retriever.insert(&SeriesId::from("foo"), start, segment_of(&[(start.inner(), 9.0)]));

        let ctx = Context::background();
        let ns = NamespaceContext::default();
        h.series.read_encoded(&ctx, start, start.add(2 * HOUR), &ns).unwrap();
        // The blocking update from the retrieval.
        assert_eq!(wired_list.process_pending(), 1);
        h.series.read_encoded(&ctx, start, start.add(2 * HOUR), &ns).unwrap();
        // The recency touch from the cache hit.
        assert_eq!(wired_list.process_pending(), 1);
        assert_eq!(wired_list.len(), 1);
    }

    #[test]
    fn test_close_and_reuse_from_pool() {
        init_logging();
        let clock = ManualClock::new(UnixNanos::from_secs(1000 * 3600));
        let block_pool = SpyBlockPool::new();
        let opts = options(&clock, &block_pool, CachePolicy::RecentlyRead);
        let pool = DatabaseSeriesPool::with_options(opts.clone());

        let series = pool.get();
        assert!(matches!(series.write(&Context::background(), clock.now(), 1.0, TimeUnit::Second, None, WriteOptions::default()), Err(Error::Closed)));
        series.reset(DatabaseSeriesOptions::new(SeriesId::from("a"), Tags::empty(), opts.clone())).unwrap();
        series.write(&Context::background(), clock.now(), 1.0, TimeUnit::Second, None, WriteOptions::default()).unwrap();
        let ptr = Arc::as_ptr(&series);
        series.close();
        assert_eq!(series.id(), None);
        assert!(series.is_empty());
        assert_eq!(pool.available(), 1);
        drop(series);

        let reused = pool.get();
        assert_eq!(Arc::as_ptr(&reused), ptr);
        reused.reset(DatabaseSeriesOptions::new(SeriesId::from("b"), Tags::empty(), opts)).unwrap();
        assert_eq!(reused.id(), Some(SeriesId::from("b")));
        assert!(!reused.is_bootstrapped());
    }

    #[test]
    fn test_reset_rejects_invalid_options() {
        let h = harness(CachePolicy::RecentlyRead);
        let bad = Options::default().with_retention(RetentionOptions::default().with_block_size(Duration::ZERO));
        let res = h.series.reset(DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::empty(), bad));
        assert!(matches!(res, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_shard_routes_evictions() {
        let clock = ManualClock::new(UnixNanos::from_secs(1000 * 3600));
        let block_pool = SpyBlockPool::new();
        let wired_list = WiredList::new(WiredListOptions::default().with_max_wired_blocks(2));
        let shard = TestShard::new();
        let opts = options(&clock, &block_pool, CachePolicy::Lru).with_wired_list(Some(wired_list.clone()));

        let names = ["a", "b", "c"];
        for name in names.iter() {
            let series = DatabaseSeries::new(
                DatabaseSeriesOptions::new(SeriesId::from(*name), Tags::empty(), opts.clone())
                    .with_on_evicted_from_wired_list(shard.clone()),
            )
            .unwrap();
            shard.add(series);
        }
        let start = clock.now().sub(4 * HOUR).truncate(2 * HOUR);
        for name in names.iter() {
            let id = SeriesId::from(*name);
            shard.get(&id).unwrap().on_retrieve_block(&id, &Tags::empty(), start, segment_of(&[(start.inner(), 1.0)]), &NamespaceContext::default());
        }
        wired_list.process_pending();
        assert!(shard.get(&SeriesId::from("a")).unwrap().cached_block_starts().is_empty());
        assert_eq!(shard.get(&SeriesId::from("c")).unwrap().cached_block_starts().len(), 1);
        assert_eq!(block_pool.puts(), 1);
    }

    #[test]
    fn test_concurrent_writes_reads_ticks_and_evictions() {
        let retriever = Arc::new(FakeRetriever::new());
        let wired_list = WiredList::new(WiredListOptions::default().with_max_wired_blocks(2).with_events_channel_size(4));
        wired_list.start().unwrap();
        let r = retriever.clone();
        let wl = wired_list.clone();
        let h = harness_with(CachePolicy::Lru, move |o| {
            DatabaseSeriesOptions::new(SeriesId::from("foo"), Tags::empty(), o.with_wired_list(Some(wl)))
                .with_block_retriever(r)
        });
        for i in 1..10u32 {
            let start = h.block_start(2 * HOUR * i);
            retriever.insert(&SeriesId::from("foo"), start, segment_of(&[(start.inner(), 1.0)]));
        }

        let series = h.series.clone();
        let now = h.now();
        let mut handles = Vec::new();
        for t in 0..4 {
            let series = series.clone();
            handles.push(std::thread::spawn(move || {
                let ctx = Context::background();
                for i in 0..200i64 {
                    match (t + i) % 3 {
                        0 => {
                            let _ = series.write(&ctx, UnixNanos(now.inner() - i), 1.0, TimeUnit::Second, None, WriteOptions::default());
                        }
                        1 => {
                            let start = now.sub(20 * HOUR);
                            series.read_encoded(&ctx, start, now, &NamespaceContext::default()).unwrap();
                        }
                        _ => {
                            let _ = series.tick(&ShardBlockStateSnapshot::NotBootstrapped);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        wired_list.wait_for_pending_updates();
        assert!(wired_list.len() <= 2);
        wired_list.stop();
    }

    #[test]
    fn test_evicted_bucket_expires_cached_block() {
        for (policy, closed) in [(CachePolicy::Lru, false), (CachePolicy::RecentlyRead, true)] {
            let h = harness(policy);
            let start = h.block_start(Duration::ZERO);
            let block = h.retrieve(start);
            h.write(h.now(), 1.0).unwrap();
            h.series
                .load(LoadOptions { bootstrap: true }, Vec::new(), &BootstrappedBlockStateSnapshot::default())
                .unwrap();
            let mut persisted = RecordingPersist::default();
            let outcome = h.series.warm_flush(&Context::background(), start, &mut persisted.func()).unwrap();
            assert_eq!(outcome, FlushOutcome::FlushedToDisk);

            match h.series.tick(&all_retrievable(&[start])) {
                Err(Error::AllDatapointsExpired(result)) => {
                    assert_eq!(result.evicted_buckets, 1, "policy {}", policy);
                    assert_eq!(result.made_expired_blocks, 1);
                    assert_eq!(result.made_unwired_blocks, 0);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(h.series.cached_block_starts().is_empty());
            assert_eq!(block.is_closed(), closed, "policy {}", policy);
        }
    }

    #[test]
    fn test_tick_expires_buffer_past_retention() {
        let h = harness(CachePolicy::RecentlyRead);
        h.write(h.now(), 1.0).unwrap();
        assert!(h.series.tick(&ShardBlockStateSnapshot::NotBootstrapped).is_ok());

        h.clock.advance(100 * HOUR);
        match h.series.tick(&ShardBlockStateSnapshot::NotBootstrapped) {
            Err(Error::AllDatapointsExpired(result)) => {
                assert_eq!(result.evicted_buckets, 1);
                assert_eq!(result.tick_status.active_blocks, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.series.is_empty());
    }
}
