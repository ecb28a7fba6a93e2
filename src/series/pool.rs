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

use crate::constants::DEFAULT_SERIES_POOL_SIZE;
use crate::series::{options::Options, DatabaseSeries};
use crossbeam::queue::ArrayQueue;
use std::sync::{Arc, Weak};

pub trait SeriesPool: Send + Sync {
    fn get(&self) -> Arc<DatabaseSeries>;
    fn put(&self, series: Arc<DatabaseSeries>);
}

/// Bounded free list of closed series awaiting `reset`.
pub struct DatabaseSeriesPool {
    free: ArrayQueue<Arc<DatabaseSeries>>,
    opts: Options,
    this: Weak<DatabaseSeriesPool>,
}

impl DatabaseSeriesPool {
    pub fn new(size: usize, opts: Options) -> Arc<Self> {
        Arc::new_cyclic(|this| DatabaseSeriesPool {
            free: ArrayQueue::new(size.max(1)),
            opts,
            this: this.clone(),
        })
    }

    pub fn with_options(opts: Options) -> Arc<Self> {
        Self::new(DEFAULT_SERIES_POOL_SIZE, opts)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl SeriesPool for DatabaseSeriesPool {
    fn get(&self) -> Arc<DatabaseSeries> {
        match self.free.pop() {
            Some(series) => series,
            None => {
                let pool: Weak<dyn SeriesPool> = self.this.clone();
                DatabaseSeries::new_pooled(Some(pool), self.opts.clone())
            }
        }
    }

    fn put(&self, series: Arc<DatabaseSeries>) {
        let _ = self.free.push(series);
    }
}
