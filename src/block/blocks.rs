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
use crate::time::UnixNanos;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Block cache of one series, keyed by block start. Has no lock of its own;
/// the owning series' lock guards it.
#[derive(Default)]
pub struct DatabaseSeriesBlocks {
    elems: BTreeMap<UnixNanos, Arc<DatabaseBlock>>,
}

impl DatabaseSeriesBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `block` at its start, handing back whatever it replaced.
    pub fn add_block(&mut self, block: Arc<DatabaseBlock>) -> Option<Arc<DatabaseBlock>> {
        self.elems.insert(block.start(), block)
    }

    pub fn block_at(&self, t: UnixNanos) -> Option<&Arc<DatabaseBlock>> {
        self.elems.get(&t)
    }

    pub fn all_blocks(&self) -> &BTreeMap<UnixNanos, Arc<DatabaseBlock>> {
        &self.elems
    }

    pub fn starts(&self) -> Vec<UnixNanos> {
        self.elems.keys().copied().collect()
    }

    pub fn remove_block_at(&mut self, t: UnixNanos) -> Option<Arc<DatabaseBlock>> {
        self.elems.remove(&t)
    }

    /// Removes and closes every block.
    pub fn remove_all(&mut self) {
        for (_, block) in std::mem::take(&mut self.elems) {
            block.close();
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn min_time(&self) -> Option<UnixNanos> {
        self.elems.keys().next().copied()
    }

    pub fn max_time(&self) -> Option<UnixNanos> {
        self.elems.keys().next_back().copied()
    }

    /// Forgets every block without closing any.
    pub fn reset(&mut self) {
        self.elems.clear();
    }
}
