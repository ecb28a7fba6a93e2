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

use crate::time::{TimeUnit, UnixNanos};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Datapoint {
    pub timestamp: UnixNanos,
    pub value: f64,
    pub unit: TimeUnit,
    pub annotation: Option<Vec<u8>>,
}

impl Datapoint {
    pub fn new(timestamp: UnixNanos, value: f64) -> Self {
        Self {
            timestamp,
            value,
            unit: TimeUnit::Second,
            annotation: None,
        }
    }

    /// Bitwise comparison so a repeated NaN write still dedups.
    pub fn same_as(&self, other: &Datapoint) -> bool {
        self.timestamp == other.timestamp
            && self.value.to_bits() == other.value.to_bits()
            && self.unit == other.unit
            && self.annotation == other.annotation
    }

    pub fn size(&self) -> usize {
        let annotation = self.annotation.as_ref().map(|a| a.len()).unwrap_or(0);
        2 * std::mem::size_of::<u64>() + annotation
    }
}
