use std::fmt;

use super::chunks::Chunk;
use crate::error::{Error, Result};

/// A contiguous single-chromosome interval, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub chrom: String,
    pub start: usize,
    pub end: usize,
}

impl Region {
    pub fn new(chrom: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            chrom: chrom.into(),
            start,
            end,
        }
    }
}

/// Formats as `chr:start-end`.
impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

/// One region per maximal run of a chromosome within the chunk, in first-seen order.
pub fn resolve_regions(chunk: &Chunk) -> Result<Vec<Region>> {
    if chunk.is_empty() {
        return Err(Error::invariant(format!("Chunk {} is empty", chunk.id)));
    }

    if let Some(bad) = chunk.runs().iter().find(|r| r.start > r.end) {
        return Err(Error::invariant(format!(
            "Region {bad} in chunk {} ends before it starts; positions are not sorted",
            chunk.id
        )));
    }

    Ok(chunk.runs().to_vec())
}
