use std::cmp::Ordering;
use std::fmt;

use super::regions::Region;
use crate::core::position::Position;
use crate::error::{Error, Result};

/// Sequence number of a chunk, zero-padded to a width fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    seq: usize,
    width: usize,
}

impl ChunkId {
    pub fn new(seq: usize, width: usize) -> Self {
        Self { seq, width }
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Name of the chunk's result artifact in the work directory.
    pub fn artifact_name(&self) -> String {
        format!("chunk_{self}.tsv")
    }
}

impl Ord for ChunkId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl PartialOrd for ChunkId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.seq, width = self.width)
    }
}

/// Digits needed so that every id in `0..count` has the same width.
pub fn id_width(count: usize) -> usize {
    count.saturating_sub(1).to_string().len()
}

/// A slice of the position stream, kept as its chromosome runs rather than every position.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    len: usize,
    runs: Vec<Region>,
}

impl Chunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            len: 0,
            runs: Vec::new(),
        }
    }

    pub fn from_positions<'a>(id: ChunkId, positions: impl IntoIterator<Item = &'a Position>) -> Self {
        let mut chunk = Self::new(id);
        for position in positions {
            chunk.push(position);
        }
        chunk
    }

    /// Extends the current chromosome run, or opens a new one.
    pub fn push(&mut self, position: &Position) {
        match self.runs.last_mut() {
            Some(run) if run.chrom == position.chrom() => run.end = position.pos(),
            _ => self
                .runs
                .push(Region::new(position.chrom(), position.pos(), position.pos())),
        }
        self.len += 1;
    }

    /// Maximal same-chromosome runs in first-seen order.
    pub fn runs(&self) -> &[Region] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Partitions the ordered position stream into chunks of a fixed number of positions.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSplitter {
    size: usize,
}

impl ChunkSplitter {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::configuration("Chunk size must be a positive integer"));
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn split<I>(&self, positions: I) -> Result<Vec<Chunk>>
    where
        I: IntoIterator<Item = Result<Position>>,
    {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current = Chunk::new(ChunkId::new(0, 1));

        for position in positions {
            current.push(&position?);
            if current.len() == self.size {
                let next = Chunk::new(ChunkId::new(chunks.len() + 1, 1));
                chunks.push(std::mem::replace(&mut current, next));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let width = id_width(chunks.len());
        for chunk in &mut chunks {
            chunk.id = ChunkId::new(chunk.id.seq(), width);
        }
        Ok(chunks)
    }
}
