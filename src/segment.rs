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

//! Encoded datapoint payloads.
//!
//! A segment is the bincode encoding of a time ordered run of datapoints,
//! lz4 compressed and prefixed with the uncompressed length.

use crate::constants::{SEGMENT_COMPRESS_ACC, SEGMENT_HEADER_SZ};
use crate::sample::Datapoint;
use crate::time::UnixNanos;
use log::debug;
use lzzzz::lz4;
use std::collections::BTreeMap;
use std::sync::Arc;

// Refuse to allocate for a header claiming more than this.
const MAX_DECOMPRESSED_SZ: u64 = 1 << 32;

#[derive(Debug)]
pub enum Error {
    Serialize(bincode::Error),
    Compression(lzzzz::Error),
    Corrupt(&'static str),
}

impl From<bincode::Error> for Error {
    fn from(item: bincode::Error) -> Self {
        Error::Serialize(item)
    }
}

impl From<lzzzz::Error> for Error {
    fn from(item: lzzzz::Error) -> Self {
        Error::Compression(item)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Serialize(e) => write!(f, "segment serialization failed: {}", e),
            Error::Compression(e) => write!(f, "segment compression failed: {}", e),
            Error::Corrupt(msg) => write!(f, "corrupt segment: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Immutable, cheaply clonable encoded payload. The empty segment holds no
/// allocation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Segment {
    bytes: Option<Arc<[u8]>>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("len", &self.len()).finish()
    }
}

impl Segment {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            bytes: Some(bytes.into()),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.bytes {
            Some(b) => b,
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checksum(&self) -> u32 {
        crc32fast::hash(self.bytes())
    }
}

pub fn encode(points: &[Datapoint]) -> Result<Segment, Error> {
    if points.is_empty() {
        return Ok(Segment::empty());
    }
    let data = bincode::serialize(points)?;
    let mut v = Vec::with_capacity(SEGMENT_HEADER_SZ + data.len() / 2);
    v.extend_from_slice(&(data.len() as u64).to_be_bytes());
    lz4::compress_to_vec(&data, &mut v, SEGMENT_COMPRESS_ACC)?;
    debug!("Segment compression result: {} -> {}", data.len(), v.len());
    Ok(Segment::from_bytes(v))
}

pub fn decode(segment: &Segment) -> Result<Vec<Datapoint>, Error> {
    let data = segment.bytes();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < SEGMENT_HEADER_SZ {
        return Err(Error::Corrupt("short header"));
    }
    let sz = u64::from_be_bytes(
        data[..SEGMENT_HEADER_SZ]
            .try_into()
            .map_err(|_| Error::Corrupt("short header"))?,
    );
    if sz > MAX_DECOMPRESSED_SZ {
        return Err(Error::Corrupt("length header out of range"));
    }
    let mut decompressed = vec![0u8; sz as usize];
    let n = lz4::decompress(&data[SEGMENT_HEADER_SZ..], decompressed.as_mut_slice())?;
    if n != decompressed.len() {
        return Err(Error::Corrupt("length mismatch"));
    }
    Ok(bincode::deserialize(&decompressed)?)
}

/// Merges runs of datapoints into one time ordered run. For equal timestamps
/// the run that comes later in `runs` wins.
pub fn merge_datapoints<I>(runs: I) -> Vec<Datapoint>
where
    I: IntoIterator<Item = Vec<Datapoint>>,
{
    let mut merged: BTreeMap<UnixNanos, Datapoint> = BTreeMap::new();
    for run in runs {
        for dp in run {
            merged.insert(dp.timestamp, dp);
        }
    }
    merged.into_values().collect()
}

pub fn merge(segments: &[Segment]) -> Result<Segment, Error> {
    match segments {
        [] => Ok(Segment::empty()),
        [only] => Ok(only.clone()),
        _ => {
            let mut runs = Vec::with_capacity(segments.len());
            for s in segments {
                runs.push(decode(s)?);
            }
            encode(&merge_datapoints(runs))
        }
    }
}
