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

//! Series identity.
//!
//! Ids and tags are reference counted rather than pooled. A block held by the
//! wired list keeps its series id alive after the series itself was closed
//! and handed back to its pool, and the eviction callback needs that id.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SeriesId(Arc<[u8]>);

impl SeriesId {
    pub fn new(bytes: &[u8]) -> Self {
        SeriesId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if both ids share the same allocation.
    pub fn ptr_eq(&self, other: &SeriesId) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for SeriesId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SeriesId {
    fn from(s: &str) -> Self {
        SeriesId::new(s.as_bytes())
    }
}

impl From<String> for SeriesId {
    fn from(s: String) -> Self {
        SeriesId::new(s.as_bytes())
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesId({})", self)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tag {
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Tag {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Tags ordered by name then value.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Tags {
    data: Arc<[Tag]>,
}

impl Tags {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[Tag] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.data
            .binary_search_by(|t| t.name.as_slice().cmp(name))
            .ok()
            .map(|i| self.data[i].value.as_slice())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.data.iter()
    }
}

impl FromIterator<Tag> for Tags {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut data: Vec<Tag> = iter.into_iter().collect();
        data.sort();
        data.dedup_by(|a, b| a.name == b.name);
        Tags { data: data.into() }
    }
}

impl From<HashMap<String, String>> for Tags {
    fn from(map: HashMap<String, String>) -> Self {
        map.iter()
            .map(|(k, v)| Tag::new(k.as_bytes(), v.as_bytes()))
            .collect()
    }
}

impl From<Vec<(&str, &str)>> for Tags {
    fn from(pairs: Vec<(&str, &str)>) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| Tag::new(k.as_bytes(), v.as_bytes()))
            .collect()
    }
}

/// Namespace the series belongs to. Opaque to this crate, handed back to the
/// retriever and persisted with blocks.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct NamespaceContext {
    pub id: Option<Arc<str>>,
}

impl NamespaceContext {
    pub fn new(id: &str) -> Self {
        Self {
            id: Some(id.into()),
        }
    }
}
