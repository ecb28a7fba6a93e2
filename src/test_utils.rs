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

pub use crate::block::BlockPool;
pub use crate::clock::Clock;
use crate::block::{BlockReader, DatabaseBlock, OnEvictedFromWiredList, OnRetrieveBlock};
use crate::context::Context;
use crate::error::{BoxError, Error, Result};
use crate::id::{NamespaceContext, SeriesId, Tags};
use crate::sample::Datapoint;
use crate::segment::{self, Segment};
use crate::series::{DatabaseSeries, QueryableBlockRetriever};
use crate::time::UnixNanos;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
    Arc, Weak,
};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn segment_of(points: &[(i64, f64)]) -> Segment {
    let points: Vec<Datapoint> = points
        .iter()
        .map(|(t, v)| Datapoint::new(UnixNanos(*t), *v))
        .collect();
    segment::encode(&points).unwrap()
}

/// Block pool that never hands out a block twice and panics when a block is
/// returned twice. Returned blocks are kept alive so their addresses are never
/// reused by later blocks.
pub struct SpyBlockPool {
    returned: Mutex<HashSet<usize>>,
    kept: Mutex<Vec<Arc<DatabaseBlock>>>,
    puts: AtomicUsize,
    this: Weak<SpyBlockPool>,
}

impl SpyBlockPool {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| SpyBlockPool {
            returned: Mutex::new(HashSet::new()),
            kept: Mutex::new(Vec::new()),
            puts: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    pub fn puts(&self) -> usize {
        self.puts.load(SeqCst)
    }
}

impl BlockPool for SpyBlockPool {
    fn get(&self) -> Arc<DatabaseBlock> {
        let pool: Weak<dyn BlockPool> = self.this.clone();
        Arc::new(DatabaseBlock::new(Some(pool)))
    }

    fn put(&self, block: Arc<DatabaseBlock>) {
        let key = Arc::as_ptr(&block) as usize;
        if !self.returned.lock().insert(key) {
            panic!("block {:?} closed twice", block.start());
        }
        self.kept.lock().push(block);
        self.puts.fetch_add(1, SeqCst);
    }
}

#[derive(Default)]
pub struct EvictionRecorder {
    evicted: Mutex<Vec<(SeriesId, UnixNanos)>>,
}

impl EvictionRecorder {
    pub fn evictions(&self) -> Vec<(SeriesId, UnixNanos)> {
        self.evicted.lock().clone()
    }
}

impl OnEvictedFromWiredList for EvictionRecorder {
    fn on_evicted_from_wired_list(&self, id: &SeriesId, start: UnixNanos) {
        self.evicted.lock().push((id.clone(), start));
    }
}

#[derive(Default)]
pub struct RecordingPersist {
    entries: Vec<(SeriesId, Segment, u32)>,
}

impl RecordingPersist {
    pub fn func(
        &mut self,
    ) -> impl FnMut(&SeriesId, &Tags, Segment, u32) -> std::result::Result<(), BoxError> + '_ {
        move |id: &SeriesId, _tags: &Tags, segment: Segment, checksum: u32| {
            self.entries.push((id.clone(), segment, checksum));
            Ok(())
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn take(&mut self) -> Vec<(SeriesId, Segment, u32)> {
        std::mem::take(&mut self.entries)
    }
}

/// In-memory block retriever. Calls `on_retrieve` on the streaming thread.
#[derive(Default)]
pub struct FakeRetriever {
    data: Mutex<HashMap<(SeriesId, UnixNanos), Segment>>,
    streams: AtomicUsize,
    fail: AtomicBool,
}

impl FakeRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &SeriesId, start: UnixNanos, segment: Segment) {
        self.data.lock().insert((id.clone(), start), segment);
    }

    pub fn fail_streams(&self) {
        self.fail.store(true, SeqCst);
    }

    pub fn streams(&self) -> usize {
        self.streams.load(SeqCst)
    }
}

impl QueryableBlockRetriever for FakeRetriever {
    fn is_block_retrievable(&self, start: UnixNanos) -> Result<bool> {
        Ok(self.data.lock().keys().any(|(_, s)| *s == start))
    }

    fn retrievable_block_cold_version(&self, _start: UnixNanos) -> Result<i32> {
        Ok(0)
    }

    fn stream(
        &self,
        ctx: &Context,
        id: &SeriesId,
        start: UnixNanos,
        on_retrieve: Option<Arc<dyn OnRetrieveBlock>>,
        ns: &NamespaceContext,
    ) -> Result<Option<BlockReader>> {
        ctx.check()?;
        self.streams.fetch_add(1, SeqCst);
        if self.fail.load(SeqCst) {
            return Err(Error::Retrieve("fake retriever failure".into()));
        }
        let segment = match self.data.lock().get(&(id.clone(), start)) {
            Some(segment) => segment.clone(),
            None => return Ok(None),
        };
        if let Some(f) = on_retrieve {
            f.on_retrieve_block(id, &Tags::empty(), start, segment.clone(), ns);
        }
        Ok(Some(BlockReader::new(start, Duration::ZERO, segment)))
    }
}

/// Routes wired list evictions to series by id, like a shard does.
#[derive(Default)]
pub struct TestShard {
    series: DashMap<SeriesId, Arc<DatabaseSeries>>,
}

impl TestShard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, series: Arc<DatabaseSeries>) {
        if let Some(id) = series.id() {
            self.series.insert(id, series);
        }
    }

    pub fn get(&self, id: &SeriesId) -> Option<Arc<DatabaseSeries>> {
        self.series.get(id).map(|s| s.value().clone())
    }
}

impl OnEvictedFromWiredList for TestShard {
    fn on_evicted_from_wired_list(&self, id: &SeriesId, start: UnixNanos) {
        if let Some(series) = self.get(id) {
            series.on_evicted_from_wired_list(id, start);
        }
    }
}
