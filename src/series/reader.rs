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

//! Read path merging the block cache, the block retriever and the buffer.
//!
//! Reads run in two phases. `plan_read`/`plan_fetch` run under the series read
//! lock and serve what is in memory, recording the block starts that have to
//! come from disk. `retrieve`/`retrieve_fetch` then stream those starts from
//! the retriever after the lock is released, so a retriever is free to call
//! `OnRetrieveBlock` from any thread, including the caller's.

use crate::block::{BlockReader, DatabaseSeriesBlocks, FetchBlockResult, OnReadBlock, OnRetrieveBlock};
use crate::context::Context;
use crate::error::Result;
use crate::id::{NamespaceContext, SeriesId};
use crate::series::buffer::DatabaseBuffer;
use crate::series::options::Options;
use crate::time::UnixNanos;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Disk side of block retrieval.
pub trait QueryableBlockRetriever: Send + Sync {
    fn is_block_retrievable(&self, start: UnixNanos) -> Result<bool>;

    fn retrievable_block_cold_version(&self, start: UnixNanos) -> Result<i32>;

    /// Streams the block of `id` at `start`. Once the data was read, the
    /// retriever hands it to `on_retrieve` so it can be cached. `None` when
    /// nothing is stored for the series.
    fn stream(
        &self,
        ctx: &Context,
        id: &SeriesId,
        start: UnixNanos,
        on_retrieve: Option<Arc<dyn OnRetrieveBlock>>,
        ns: &NamespaceContext,
    ) -> Result<Option<BlockReader>>;
}

#[derive(Debug, Default)]
pub struct PendingRead {
    groups: BTreeMap<UnixNanos, Vec<BlockReader>>,
    misses: Vec<UnixNanos>,
}

impl PendingRead {
    pub fn misses(&self) -> &[UnixNanos] {
        &self.misses
    }

    pub fn into_groups(self) -> Vec<Vec<BlockReader>> {
        self.groups.into_values().filter(|g| !g.is_empty()).collect()
    }
}

/// Aligned block starts covering `[start, end)`, clamped to retention.
fn block_starts(opts: &Options, start: UnixNanos, end: UnixNanos) -> Vec<UnixNanos> {
    let retention = &opts.retention;
    let earliest = opts
        .clock
        .now()
        .sub(retention.retention_period)
        .truncate(retention.block_size);
    let mut t = std::cmp::max(start, earliest).truncate(retention.block_size);
    let mut starts = Vec::new();
    while t.before(end) {
        starts.push(t);
        t = t.add(retention.block_size);
    }
    starts
}

pub fn plan_read(
    ctx: &Context,
    opts: &Options,
    blocks: &DatabaseSeriesBlocks,
    buffer: &DatabaseBuffer,
    retriever: Option<&dyn QueryableBlockRetriever>,
    on_read: &dyn OnReadBlock,
    start: UnixNanos,
    end: UnixNanos,
) -> Result<PendingRead> {
    ctx.check()?;
    let now = opts.clock.now();
    let mut pending = PendingRead::default();

    for block_start in block_starts(opts, start, end) {
        if let Some(block) = blocks.block_at(block_start) {
            block.set_last_read_time(now);
            on_read.on_read_block(block);
            pending.groups.entry(block_start).or_default().push(block.stream()?);
            continue;
        }
        if let Some(retriever) = retriever {
            if retriever.is_block_retrievable(block_start)? {
                pending.misses.push(block_start);
            }
        }
    }

    for group in buffer.read_encoded(ctx, start, end)? {
        if let Some(first) = group.first() {
            pending.groups.entry(first.start).or_default().extend(group);
        }
    }
    Ok(pending)
}

pub fn retrieve(
    ctx: &Context,
    retriever: &dyn QueryableBlockRetriever,
    id: &SeriesId,
    on_retrieve: Option<Arc<dyn OnRetrieveBlock>>,
    ns: &NamespaceContext,
    pending: &mut PendingRead,
) -> Result<()> {
    for start in std::mem::take(&mut pending.misses) {
        ctx.check()?;
        if let Some(reader) = retriever.stream(ctx, id, start, on_retrieve.clone(), ns)? {
            // Disk data goes first so buffered writes win when merged.
            pending.groups.entry(start).or_default().insert(0, reader);
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct PendingFetch {
    results: BTreeMap<UnixNanos, FetchBlockResult>,
    misses: Vec<UnixNanos>,
}

impl PendingFetch {
    pub fn misses(&self) -> &[UnixNanos] {
        &self.misses
    }

    pub fn into_results(self) -> Vec<FetchBlockResult> {
        self.results.into_values().collect()
    }
}

pub fn plan_fetch(
    ctx: &Context,
    opts: &Options,
    blocks: &DatabaseSeriesBlocks,
    buffer: &DatabaseBuffer,
    retriever: Option<&dyn QueryableBlockRetriever>,
    on_read: &dyn OnReadBlock,
    starts: &[UnixNanos],
) -> PendingFetch {
    let now = opts.clock.now();
    let mut pending = PendingFetch::default();

    for start in starts {
        if let Some(block) = blocks.block_at(*start) {
            block.set_last_read_time(now);
            on_read.on_read_block(block);
            let result = pending
                .results
                .entry(*start)
                .or_insert_with(|| FetchBlockResult::new(*start));
            match block.stream() {
                Ok(reader) => result.blocks.push(reader),
                Err(e) => result.err = Some(e),
            }
            continue;
        }
        if let Some(retriever) = retriever {
            match retriever.is_block_retrievable(*start) {
                Ok(true) => pending.misses.push(*start),
                Ok(false) => {}
                Err(e) => {
                    let mut result = FetchBlockResult::new(*start);
                    result.err = Some(e);
                    pending.results.insert(*start, result);
                }
            }
        }
    }

    for buffered in buffer.fetch_blocks(ctx, starts) {
        let result = pending
            .results
            .entry(buffered.start)
            .or_insert_with(|| FetchBlockResult::new(buffered.start));
        result.first_write = buffered.first_write;
        result.blocks.extend(buffered.blocks);
        if result.err.is_none() {
            result.err = buffered.err;
        }
    }
    pending
}

pub fn retrieve_fetch(
    ctx: &Context,
    retriever: &dyn QueryableBlockRetriever,
    id: &SeriesId,
    on_retrieve: Option<Arc<dyn OnRetrieveBlock>>,
    ns: &NamespaceContext,
    pending: &mut PendingFetch,
) {
    for start in std::mem::take(&mut pending.misses) {
        let outcome = ctx
            .check()
            .and_then(|_| retriever.stream(ctx, id, start, on_retrieve.clone(), ns));
        let result = pending
            .results
            .entry(start)
            .or_insert_with(|| FetchBlockResult::new(start));
        match outcome {
            Ok(Some(reader)) => result.blocks.insert(0, reader),
            Ok(None) => {}
            Err(e) => result.err = Some(e),
        }
    }
}
