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

//! Cross-series LRU over blocks retrieved from disk.
//!
//! Series never touch the list's state directly. They push the block into a
//! bounded channel, either blocking (first time a retrieved block is cached,
//! the list takes over closing it) or non-blocking (recency touch on read,
//! dropped when the channel is full). A single worker drains the channel,
//! reorders the LRU and evicts from the front once it holds more than
//! `max_wired_blocks`. Evicted blocks get their owner's eviction callback
//! first and are closed after, both outside the list's lock.

use crate::block::DatabaseBlock;
use crate::clock::{Clock, SystemClock};
use crate::constants::*;
use crate::counters::{
    WIRED_LIST_DROPPED_UPDATES, WIRED_LIST_EVICTIONS, WIRED_LIST_SKIPPED_UPDATES,
    WIRED_LIST_WORKER_PANICS,
};
use crate::error::Result;
use crate::time::UnixNanos;
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use log::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicUsize, Ordering::SeqCst},
    Arc,
};
use std::thread::JoinHandle;

#[derive(Clone)]
pub struct WiredListOptions {
    pub max_wired_blocks: usize,
    pub events_channel_size: usize,
    pub clock: Arc<dyn Clock>,
}

impl Default for WiredListOptions {
    fn default() -> Self {
        Self {
            max_wired_blocks: DEFAULT_MAX_WIRED_BLOCKS,
            events_channel_size: DEFAULT_WIRED_LIST_EVENTS_CHANNEL_SIZE,
            clock: Arc::new(SystemClock),
        }
    }
}

impl WiredListOptions {
    pub fn with_max_wired_blocks(mut self, n: usize) -> Self {
        self.max_wired_blocks = n;
        self
    }

    pub fn with_events_channel_size(mut self, n: usize) -> Self {
        self.events_channel_size = n;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

enum Event {
    Update(Arc<DatabaseBlock>),
    Barrier(Sender<()>),
    Stop,
}

struct Entry {
    block: Arc<DatabaseBlock>,
    entered_at: UnixNanos,
}

fn key(block: &Arc<DatabaseBlock>) -> usize {
    Arc::as_ptr(block) as usize
}

#[derive(Default)]
struct LruState {
    seq: u64,
    // Least recently used first.
    order: BTreeMap<u64, Entry>,
    index: HashMap<usize, u64>,
}

impl LruState {
    fn touch(&mut self, block: Arc<DatabaseBlock>, now: UnixNanos) {
        self.seq += 1;
        let seq = self.seq;
        let entry = match self.index.insert(key(&block), seq) {
            Some(prev) => self.order.remove(&prev),
            None => None,
        };
        let entry = entry.unwrap_or(Entry {
            block,
            entered_at: now,
        });
        self.order.insert(seq, entry);
    }

    fn evict_over(&mut self, max: usize) -> Vec<Arc<DatabaseBlock>> {
        let mut evicted = Vec::new();
        while self.order.len() > max {
            let entry = match self.order.pop_first() {
                Some((_, entry)) => entry,
                None => break,
            };
            self.index.remove(&key(&entry.block));
            evicted.push(entry.block);
        }
        evicted
    }
}

pub struct WiredList {
    state: Mutex<LruState>,
    max_wired_blocks: AtomicUsize,
    clock: Arc<dyn Clock>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WiredList {
    pub fn new(opts: WiredListOptions) -> Arc<Self> {
        let (tx, rx) = bounded(opts.events_channel_size.max(1));
        Arc::new(WiredList {
            state: Mutex::new(LruState::default()),
            max_wired_blocks: AtomicUsize::new(opts.max_wired_blocks),
            clock: opts.clock,
            tx,
            rx,
            worker: Mutex::new(None),
        })
    }

    /// Spawns the worker that applies queued updates. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let list = self.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("WiredList: Update Worker"))
            .spawn(move || list.update_worker())?;
        *worker = Some(handle);
        info!("wired list started, max wired blocks {}", self.max_wired_blocks());
        Ok(())
    }

    /// Stops the worker after it applied every update queued before the call.
    pub fn stop(&self) {
        let handle = match self.worker.lock().take() {
            Some(handle) => handle,
            None => return,
        };
        let _ = self.tx.send(Event::Stop);
        if handle.join().is_err() {
            error!("wired list worker panicked");
        }
    }

    fn update_worker(&self) {
        while let Ok(event) = self.rx.recv() {
            // A panicking eviction callback must not take the worker down:
            // nothing else drains the channel and blocking updates would hang.
            match panic::catch_unwind(AssertUnwindSafe(|| self.handle(event))) {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    WIRED_LIST_WORKER_PANICS.increment(1);
                    error!("wired list update panicked, worker continues");
                }
            }
        }
        debug!("wired list worker exiting");
    }

    fn handle(&self, event: Event) -> bool {
        match event {
            Event::Update(block) => self.process_update_block(block),
            Event::Barrier(done) => {
                let _ = done.send(());
            }
            Event::Stop => return false,
        }
        true
    }

    /// Queues `block`, waiting for room in the channel. Used when the list has
    /// to take over the block's lifecycle, so the update cannot be lost.
    /// Never call while holding a series lock.
    pub fn blocking_update(&self, block: Arc<DatabaseBlock>) {
        let _ = self.tx.send(Event::Update(block));
    }

    /// Queues a recency touch for `block`. Dropped if the channel is full.
    pub fn non_blocking_update(&self, block: Arc<DatabaseBlock>) -> bool {
        match self.tx.try_send(Event::Update(block)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                WIRED_LIST_DROPPED_UPDATES.increment(1);
                false
            }
        }
    }

    /// Applies queued updates on the calling thread. Returns how many events
    /// were taken off the channel.
    pub fn process_pending(&self) -> usize {
        let mut n = 0;
        loop {
            match self.rx.try_recv() {
                Ok(Event::Stop) => {
                    // Belongs to the worker.
                    let _ = self.tx.try_send(Event::Stop);
                    break;
                }
                Ok(event) => {
                    self.handle(event);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        n
    }

    /// Waits until the worker applied every update queued before this call.
    /// Only valid while the worker is running.
    pub fn wait_for_pending_updates(&self) {
        let (done_tx, done_rx) = bounded(1);
        if self.tx.send(Event::Barrier(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    fn process_update_block(&self, block: Arc<DatabaseBlock>) {
        // Stale update for a block that has since been closed, or a block the
        // list does not own.
        if block.is_closed() || !block.was_retrieved_from_disk() {
            WIRED_LIST_SKIPPED_UPDATES.increment(1);
            return;
        }

        let now = self.clock.now();
        let evicted = {
            let mut state = self.state.lock();
            state.touch(block, now);
            state.evict_over(self.max_wired_blocks())
        };

        for block in evicted {
            self.evict(block);
        }
    }

    fn evict(&self, block: Arc<DatabaseBlock>) {
        if block.is_closed() {
            return;
        }
        WIRED_LIST_EVICTIONS.increment(1);
        let start = block.start();
        if let (Some(callback), Some(id)) = (block.on_evicted_from_wired_list(), block.id()) {
            callback.on_evicted_from_wired_list(&id, start);
        }
        block.close_if_from_disk();
    }

    pub fn max_wired_blocks(&self) -> usize {
        self.max_wired_blocks.load(SeqCst)
    }

    /// Takes effect on the next update.
    pub fn set_max_wired_blocks(&self, n: usize) {
        self.max_wired_blocks.store(n, SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, block: &Arc<DatabaseBlock>) -> bool {
        self.state.lock().index.contains_key(&key(block))
    }

    /// When `block` first entered the list, if it is still tracked.
    pub fn entered_list_at(&self, block: &Arc<DatabaseBlock>) -> Option<UnixNanos> {
        let state = self.state.lock();
        let seq = state.index.get(&key(block))?;
        state.order.get(seq).map(|e| e.entered_at)
    }
}
