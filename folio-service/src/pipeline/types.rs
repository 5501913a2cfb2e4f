//! Values that flow through a pipeline run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Separator placed between the text of consecutive pages.
///
/// Chunk texts are joined with the same separator, so combining chunks gives
/// the same text as extracting the whole document at once.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Ordered 1-based page indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageRange(Vec<u32>);

impl PageRange {
    /// Contiguous range `first..=last`; empty when `last < first`
    pub fn inclusive(first: u32, last: u32) -> Self {
        Self((first..=last).collect())
    }

    pub fn first(&self) -> Option<u32> {
        self.0.first().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }
}

impl From<Vec<u32>> for PageRange {
    fn from(pages: Vec<u32>) -> Self {
        Self(pages)
    }
}

/// A bounded slice of a document's pages processed as one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub pages: PageRange,
}

impl Chunk {
    pub fn new(pages: impl Into<PageRange>) -> Self {
        Self {
            pages: pages.into(),
        }
    }

    /// Ordering key: the chunk's first page index
    pub fn key(&self) -> u32 {
        self.pages.first().unwrap_or(0)
    }
}

/// Output of one chunk's text and entity stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub pages: PageRange,
    pub text: String,
    pub entities: Vec<String>,
}

impl ChunkResult {
    pub fn key(&self) -> u32 {
        self.pages.first().unwrap_or(0)
    }
}

/// Combined output of a whole document, written once per successful run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentResult {
    pub text: String,
    pub entities: Vec<String>,
}

/// What a page reader needs to open a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub id: String,
    pub path: PathBuf,
}

impl DocumentHandle {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Raw text of a single page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page: u32,
    pub text: String,
}

/// Join page texts with [`PAGE_SEPARATOR`], skipping blank pages
pub fn join_pages<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    let mut joined = String::new();
    for text in texts {
        if text.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push_str(PAGE_SEPARATOR);
        }
        joined.push_str(text);
    }
    joined
}
