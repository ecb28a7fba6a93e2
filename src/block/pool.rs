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

use crate::block::DatabaseBlock;
use crate::counters::BLOCK_POOL_ALLOCATIONS;
use crossbeam::queue::ArrayQueue;
use std::sync::{Arc, Weak};

pub trait BlockPool: Send + Sync {
    fn get(&self) -> Arc<DatabaseBlock>;
    fn put(&self, block: Arc<DatabaseBlock>);
}

/// Bounded free list of blocks. Blocks handed out hold a weak reference back
/// to the pool and return to it on close; when the free list is full the
/// returned block is dropped.
pub struct DatabaseBlockPool {
    free: ArrayQueue<Arc<DatabaseBlock>>,
    this: Weak<DatabaseBlockPool>,
}

impl DatabaseBlockPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| DatabaseBlockPool {
            free: ArrayQueue::new(size.max(1)),
            this: this.clone(),
        })
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl BlockPool for DatabaseBlockPool {
    fn get(&self) -> Arc<DatabaseBlock> {
        match self.free.pop() {
            Some(block) => block,
            None => {
                BLOCK_POOL_ALLOCATIONS.increment(1);
                let pool: Weak<dyn BlockPool> = self.this.clone();
                Arc::new(DatabaseBlock::new(Some(pool)))
            }
        }
    }

    fn put(&self, block: Arc<DatabaseBlock>) {
        let _ = self.free.push(block);
    }
}
