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

//! In-memory buffer of recent writes for one series.
//!
//! Writes land in buckets keyed by block start. Every start holds at most one
//! writable bucket per write type; warm flush and cold flush seal buckets by
//! moving them to a non-writable version, and tick drops sealed buckets once
//! the shard reports the data as retrievable from disk.

use crate::block::{BlockReader, DatabaseBlock, FetchBlockMetadataResult, FetchBlockResult};
use crate::constants::*;
use crate::context::Context;
use crate::counters::BUFFER_MERGE_ERRORS;
use crate::error::{BoxError, Error, Result};
use crate::id::{SeriesId, Tags};
use crate::sample::Datapoint;
use crate::segment::{self, Segment};
use crate::series::options::Options;
use crate::series::types::*;
use crate::time::UnixNanos;
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{
    atomic::{AtomicI64, Ordering::SeqCst},
    Arc,
};
use std::time::Duration;

const SECOND: Duration = Duration::from_secs(1);

struct BufferBucket {
    version: i32,
    write_type: WriteType,
    datapoints: BTreeMap<UnixNanos, Datapoint>,
    loaded: Vec<Arc<DatabaseBlock>>,
    first_write: Option<UnixNanos>,
}

impl BufferBucket {
    fn new(write_type: WriteType) -> Self {
        BufferBucket {
            version: WRITABLE_BUCKET_VERSION,
            write_type,
            datapoints: BTreeMap::new(),
            loaded: Vec::new(),
            first_write: None,
        }
    }

    fn is_writable(&self) -> bool {
        self.version == WRITABLE_BUCKET_VERSION
    }

    fn is_empty(&self) -> bool {
        self.datapoints.is_empty() && self.loaded.is_empty()
    }

    fn write(&mut self, dp: Datapoint, now: UnixNanos) -> bool {
        if let Some(existing) = self.datapoints.get(&dp.timestamp) {
            if existing.same_as(&dp) {
                return false;
            }
        }
        self.datapoints.insert(dp.timestamp, dp);
        if self.first_write.is_none() {
            self.first_write = Some(now);
        }
        true
    }

    /// Folds loaded blocks into the in-memory datapoints. Written datapoints
    /// win over loaded ones, later loaded blocks over earlier ones.
    fn merge_loaded(&mut self) -> Result<usize> {
        if self.loaded.is_empty() {
            return Ok(0);
        }
        let mut runs = Vec::with_capacity(self.loaded.len());
        for block in self.loaded.iter() {
            runs.push(block.stream()?.datapoints()?);
        }
        for run in runs.into_iter().rev() {
            for dp in run {
                self.datapoints.entry(dp.timestamp).or_insert(dp);
            }
        }
        let n = self.loaded.len();
        for block in self.loaded.drain(..) {
            block.close();
        }
        Ok(n)
    }

    fn written_segment(&self) -> Result<Segment> {
        let points: Vec<Datapoint> = self.datapoints.values().cloned().collect();
        Ok(segment::encode(&points)?)
    }

    fn segments(&self) -> Result<Vec<Segment>> {
        let mut segments = Vec::with_capacity(self.loaded.len() + 1);
        for block in self.loaded.iter() {
            segments.push(block.stream()?.segment);
        }
        segments.push(self.written_segment()?);
        segments.retain(|s| !s.is_empty());
        Ok(segments)
    }

    fn close(self) {
        for block in self.loaded {
            block.close();
        }
    }
}

struct BufferBucketVersions {
    buckets: Vec<BufferBucket>,
    last_read: AtomicI64,
}

impl BufferBucketVersions {
    fn new() -> Self {
        BufferBucketVersions {
            buckets: Vec::new(),
            last_read: AtomicI64::new(0),
        }
    }

    fn writable_bucket(&mut self, write_type: WriteType) -> &mut BufferBucket {
        let idx = match self
            .buckets
            .iter()
            .position(|b| b.is_writable() && b.write_type == write_type)
        {
            Some(idx) => idx,
            None => {
                self.buckets.push(BufferBucket::new(write_type));
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[idx]
    }

    fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Drops and closes every bucket matching `pred`.
    fn remove_buckets<F: Fn(&BufferBucket) -> bool>(&mut self, pred: F) {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.buckets).into_iter().partition(|b| pred(b));
        self.buckets = kept;
        for bucket in removed {
            bucket.close();
        }
    }

    fn first_write(&self) -> Option<UnixNanos> {
        self.buckets.iter().filter_map(|b| b.first_write).min()
    }

    fn merged_segment<F: Fn(&BufferBucket) -> bool>(&self, pred: F) -> Result<Segment> {
        let mut segments = Vec::new();
        for bucket in self.buckets.iter().filter(|b| pred(*b)) {
            segments.extend(bucket.segments()?);
        }
        Ok(segment::merge(&segments)?)
    }

    fn readers(&self, start: UnixNanos, block_size: Duration) -> Result<Vec<BlockReader>> {
        let mut readers = Vec::new();
        for bucket in self.buckets.iter() {
            for segment in bucket.segments()? {
                readers.push(BlockReader::new(start, block_size, segment));
            }
        }
        Ok(readers)
    }

    fn touch(&self, now: UnixNanos) {
        self.last_read.store(now.inner(), SeqCst);
    }

    fn last_read(&self) -> UnixNanos {
        UnixNanos(self.last_read.load(SeqCst))
    }

    fn close(self) {
        for bucket in self.buckets {
            bucket.close();
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BufferTickResult {
    pub evicted_bucket_times: BTreeSet<UnixNanos>,
    pub merged_out_of_order_blocks: usize,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BufferStats {
    /// Block starts the buffer still holds data for.
    pub wired_blocks: usize,
}

pub struct DatabaseBuffer {
    opts: Options,
    buckets: BTreeMap<UnixNanos, BufferBucketVersions>,
}

impl DatabaseBuffer {
    pub fn new(opts: Options) -> Self {
        DatabaseBuffer {
            opts,
            buckets: BTreeMap::new(),
        }
    }

    /// Closes everything held and takes on `opts`.
    pub fn reset(&mut self, opts: Options) {
        for (_, versions) in std::mem::take(&mut self.buckets) {
            versions.close();
        }
        self.opts = opts;
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|v| v.is_empty())
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            wired_blocks: self.buckets.len(),
        }
    }

    fn block_size(&self) -> Duration {
        self.opts.retention.block_size
    }

    pub fn write(
        &mut self,
        ctx: &Context,
        id: &SeriesId,
        mut dp: Datapoint,
        wopts: WriteOptions,
    ) -> Result<(bool, WriteType)> {
        ctx.check()?;
        let retention = self.opts.retention;
        let now = self.opts.clock.now();
        let past_limit = now.sub(retention.buffer_past).truncate(SECOND);
        let future_limit = now.add(retention.buffer_future).truncate(SECOND);
        let cold_writes_enabled = self.opts.cold_writes_enabled;

        let write_type = if !past_limit.before(dp.timestamp) {
            if !cold_writes_enabled {
                return Err(Error::TooFarInPast {
                    id: Some(id.clone()),
                    timestamp: dp.timestamp,
                    past_limit,
                });
            }
            WriteType::Cold
        } else if !future_limit.after(dp.timestamp) {
            if !cold_writes_enabled {
                return Err(Error::TooFarInFuture {
                    id: Some(id.clone()),
                    timestamp: dp.timestamp,
                    future_limit,
                });
            }
            WriteType::Cold
        } else {
            WriteType::Warm
        };

        let block_start = dp.timestamp.truncate(retention.block_size);
        if write_type == WriteType::Cold {
            let retention_start = now
                .sub(retention.retention_period)
                .truncate(retention.block_size);
            if block_start.before(retention_start) {
                return Err(Error::OutOfRetention {
                    id: Some(id.clone()),
                    timestamp: dp.timestamp,
                    retention_start,
                });
            }
        }

        if wopts.truncate_type == TruncateType::Block {
            dp.timestamp = block_start;
        }
        if let Some(v) = wopts.force_value {
            dp.value = v;
        }

        let written = self
            .buckets
            .entry(block_start)
            .or_insert_with(BufferBucketVersions::new)
            .writable_bucket(write_type)
            .write(dp, now);
        Ok((written, write_type))
    }

    /// Places a bootstrapped block into the writable bucket of `write_type`.
    pub fn load(&mut self, block: Arc<DatabaseBlock>, write_type: WriteType) {
        let start = block.start();
        self.buckets
            .entry(start)
            .or_insert_with(BufferBucketVersions::new)
            .writable_bucket(write_type)
            .loaded
            .push(block);
    }

    /// Drops buckets past retention and buckets whose data is persisted, and
    /// folds loaded blocks into the writable buckets. A loaded block that fails
    /// to decode stays loaded and is retried on the next tick.
    pub fn tick(&mut self, block_states: &ShardBlockStateSnapshot) -> BufferTickResult {
        let mut result = BufferTickResult::default();
        let mut evicted = Vec::new();
        let retention = self.opts.retention;
        let retention_start = self
            .opts
            .clock
            .now()
            .sub(retention.retention_period)
            .truncate(retention.block_size);

        for (start, versions) in self.buckets.iter_mut() {
            if start.before(retention_start) {
                evicted.push(*start);
                continue;
            }

            if let Some(state) = block_states.bootstrapped().and_then(|s| s.get(*start)) {
                // Persisted data is readable from disk, the memory copy can go.
                if state.warm_retrievable {
                    versions.remove_buckets(|b| {
                        b.write_type == WriteType::Warm && b.version == WARM_FLUSHED_BUCKET_VERSION
                    });
                }
                versions.remove_buckets(|b| {
                    b.write_type == WriteType::Cold
                        && !b.is_writable()
                        && b.version <= state.cold_version
                });
            }

            versions.buckets.retain(|b| !b.is_empty());
            if versions.buckets.is_empty() {
                evicted.push(*start);
                continue;
            }

            for bucket in versions.buckets.iter_mut().filter(|b| b.is_writable()) {
                match bucket.merge_loaded() {
                    Ok(n) => result.merged_out_of_order_blocks += n,
                    Err(e) => {
                        BUFFER_MERGE_ERRORS.increment(1);
                        error!("merging loaded blocks of bucket {} failed: {}", start, e);
                    }
                }
            }
        }

        for start in evicted {
            if let Some(versions) = self.buckets.remove(&start) {
                versions.close();
            }
            result.evicted_bucket_times.insert(start);
        }
        result
    }

    pub fn warm_flush<F>(
        &mut self,
        ctx: &Context,
        start: UnixNanos,
        id: &SeriesId,
        tags: &Tags,
        persist_fn: &mut F,
    ) -> Result<FlushOutcome>
    where
        F: FnMut(&SeriesId, &Tags, Segment, u32) -> std::result::Result<(), BoxError>,
    {
        ctx.check()?;
        let versions = match self.buckets.get_mut(&start) {
            Some(versions) => versions,
            None => return Ok(FlushOutcome::BlockDoesNotExist),
        };
        let is_warm = |b: &BufferBucket| b.is_writable() && b.write_type == WriteType::Warm;
        let segment = versions.merged_segment(is_warm)?;
        if segment.is_empty() {
            return Ok(FlushOutcome::BlockDoesNotExist);
        }

        let checksum = segment.checksum();
        persist_fn(id, tags, segment, checksum).map_err(Error::Persist)?;
        for bucket in versions.buckets.iter_mut().filter(|b| is_warm(&**b)) {
            bucket.version = WARM_FLUSHED_BUCKET_VERSION;
        }
        debug!("warm flushed series {} block {}", id, start);
        Ok(FlushOutcome::FlushedToDisk)
    }

    /// Persists everything held for `start`, sealed or not.
    pub fn snapshot<F>(
        &self,
        ctx: &Context,
        start: UnixNanos,
        id: &SeriesId,
        tags: &Tags,
        persist_fn: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&SeriesId, &Tags, Segment, u32) -> std::result::Result<(), BoxError>,
    {
        ctx.check()?;
        let segment = match self.buckets.get(&start) {
            Some(versions) => versions.merged_segment(|_| true)?,
            None => return Ok(()),
        };
        if segment.is_empty() {
            return Ok(());
        }
        let checksum = segment.checksum();
        persist_fn(id, tags, segment, checksum).map_err(Error::Persist)
    }

    /// Seals the writable cold buckets of `start` at `version` and returns
    /// their merged data.
    pub fn fetch_blocks_for_cold_flush(
        &mut self,
        ctx: &Context,
        start: UnixNanos,
        version: i32,
    ) -> Result<Segment> {
        ctx.check()?;
        if version == WRITABLE_BUCKET_VERSION {
            return Err(Error::InvalidColdFlushVersion(version));
        }
        let versions = match self.buckets.get_mut(&start) {
            Some(versions) => versions,
            None => return Ok(Segment::empty()),
        };
        let is_cold = |b: &BufferBucket| b.is_writable() && b.write_type == WriteType::Cold;
        let segment = versions.merged_segment(is_cold)?;
        for bucket in versions.buckets.iter_mut().filter(|b| is_cold(&**b)) {
            bucket.version = version;
        }
        Ok(segment)
    }

    pub fn cold_flush_block_starts(&self, block_states: &BootstrappedBlockStateSnapshot) -> BTreeSet<UnixNanos> {
        let mut starts = BTreeSet::new();
        for (start, versions) in self.buckets.iter() {
            let cold_version = block_states.get(*start).map(|s| s.cold_version).unwrap_or(0);
            let needs_flush = versions.buckets.iter().any(|b| {
                b.write_type == WriteType::Cold && (b.is_writable() || b.version > cold_version)
            });
            if needs_flush {
                starts.insert(*start);
            }
        }
        starts
    }

    /// Readers grouped per block start overlapping `[start, end)`.
    pub fn read_encoded(
        &self,
        ctx: &Context,
        start: UnixNanos,
        end: UnixNanos,
    ) -> Result<Vec<Vec<BlockReader>>> {
        ctx.check()?;
        if !start.before(end) {
            return Ok(Vec::new());
        }
        let block_size = self.block_size();
        let now = self.opts.clock.now();
        let mut groups = Vec::new();
        for (block_start, versions) in self.buckets.range(start.truncate(block_size)..end) {
            let readers = versions.readers(*block_start, block_size)?;
            if readers.is_empty() {
                continue;
            }
            versions.touch(now);
            groups.push(readers);
        }
        Ok(groups)
    }

    pub fn fetch_blocks(&self, ctx: &Context, starts: &[UnixNanos]) -> Vec<FetchBlockResult> {
        let block_size = self.block_size();
        let mut results = Vec::new();
        for start in starts {
            let versions = match self.buckets.get(start) {
                Some(versions) => versions,
                None => continue,
            };
            let mut result = FetchBlockResult::new(*start);
            result.first_write = versions.first_write();
            match ctx.check().and_then(|_| versions.readers(*start, block_size)) {
                Ok(readers) => result.blocks = readers,
                Err(e) => result.err = Some(e),
            }
            results.push(result);
        }
        results
    }

    pub fn fetch_blocks_metadata(
        &self,
        ctx: &Context,
        start: UnixNanos,
        end: UnixNanos,
        opts: FetchBlocksMetadataOptions,
    ) -> Result<Vec<FetchBlockMetadataResult>> {
        ctx.check()?;
        if !start.before(end) {
            return Ok(Vec::new());
        }
        let block_size = self.block_size();
        let mut results = Vec::new();
        for (block_start, versions) in self.buckets.range(start.truncate(block_size)..end) {
            let mut size = 0;
            if opts.include_sizes {
                for bucket in versions.buckets.iter() {
                    for segment in bucket.segments()? {
                        size += segment.len() as i64;
                    }
                }
            }
            let last_read = if opts.include_last_read {
                Some(versions.last_read())
            } else {
                None
            };
            results.push(FetchBlockMetadataResult {
                start: *block_start,
                size,
                checksum: None,
                last_read,
            });
        }
        Ok(results)
    }

    #[cfg(test)]
    pub(crate) fn bucket_write_types(&self, start: UnixNanos) -> Vec<WriteType> {
        self.buckets
            .get(&start)
            .map(|v| v.buckets.iter().map(|b| b.write_type).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn bucket_versions(&self, start: UnixNanos) -> Vec<i32> {
        self.buckets
            .get(&start)
            .map(|v| v.buckets.iter().map(|b| b.version).collect())
            .unwrap_or_default()
    }
}
