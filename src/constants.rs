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

use std::time::Duration;

const HOUR: u64 = 60 * 60;

// Retention defaults
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(2 * 24 * HOUR);
pub const DEFAULT_BLOCK_SIZE: Duration = Duration::from_secs(2 * HOUR);
pub const DEFAULT_BUFFER_PAST: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BUFFER_FUTURE: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_BLOCK_DATA_EXPIRY_AFTER_NOT_ACCESSED: Duration = Duration::from_secs(5 * 60);

// Buffer bucket versions. Cold flush versions handed out by the flush layer
// start at 1, so 0 is never a flushed version.
pub const WRITABLE_BUCKET_VERSION: i32 = 0;
pub const WARM_FLUSHED_BUCKET_VERSION: i32 = 1;

// Wired list parameters
pub const DEFAULT_MAX_WIRED_BLOCKS: usize = 65_536;
pub const DEFAULT_WIRED_LIST_EVENTS_CHANNEL_SIZE: usize = 65_536;

// Pools
pub const DEFAULT_BLOCK_POOL_SIZE: usize = 4_096;
pub const DEFAULT_SERIES_POOL_SIZE: usize = 1_024;

// Segment framing
pub const SEGMENT_HEADER_SZ: usize = std::mem::size_of::<u64>();
pub const SEGMENT_COMPRESS_ACC: i32 = lzzzz::lz4::ACC_LEVEL_DEFAULT;

pub const PANIC_ON_INVARIANT_VIOLATION_ENV: &str = "PANIC_ON_INVARIANT_VIOLATION";
