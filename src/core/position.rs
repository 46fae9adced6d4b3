use std::collections::HashSet;
use std::fmt;
use std::io::{self, BufRead};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use fnv::FnvHashSet;
use log::debug;
use noodles::vcf;

use crate::error::{Error, Result};

/// A variant position: chromosome name and 1-based coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    chrom: Arc<str>,
    pos: usize,
}

impl Position {
    pub fn new(chrom: impl Into<Arc<str>>, pos: usize) -> Self {
        Self {
            chrom: chrom.into(),
            pos,
        }
    }

    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    pub fn pos(&self) -> usize {
        self.pos
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chrom, self.pos)
    }
}

/// Include/exclude chromosome filter applied while reading positions.
#[derive(Debug, Clone, Default)]
pub struct ChromFilter {
    pub include: Option<HashSet<String>>,
    pub exclude: Option<HashSet<String>>,
}

impl ChromFilter {
    pub fn allows(&self, chrom: &str) -> bool {
        let is_included = self.include.as_ref().map_or(true, |set| set.contains(chrom));
        let is_not_excluded = self.exclude.as_ref().map_or(true, |set| !set.contains(chrom));
        is_included && is_not_excluded
    }
}

/// Opens the source with its tabix/CSI index to make sure both are readable.
pub fn validate_indexed_source(path: &Utf8Path) -> Result<vcf::Header> {
    let mut reader = vcf::io::indexed_reader::Builder::default()
        .build_from_path(path)
        .map_err(|e| Error::source_unreadable(path, e))?;
    reader
        .read_header()
        .map_err(|e| Error::source_unreadable(path, e))
}

/// Reads the ordered (chromosome, position) stream out of an indexed VCF.
///
/// Every call to [`PositionIndex::positions`] reopens the source, so the stream can be
/// restarted as often as needed.
#[derive(Debug, Clone)]
pub struct PositionIndex {
    path: Utf8PathBuf,
    filter: ChromFilter,
}

impl PositionIndex {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        let header = validate_indexed_source(&path)?;
        debug!(
            "Opened {} ({} contigs in header, {} samples)",
            path,
            header.contigs().len(),
            header.sample_names().len()
        );
        Ok(Self {
            path,
            filter: ChromFilter::default(),
        })
    }

    pub fn with_filter(mut self, filter: ChromFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn positions(&self) -> Result<Positions<Box<dyn BufRead>>> {
        let mut reader = vcf::io::reader::Builder::default()
            .build_from_path(&self.path)
            .map_err(|e| Error::source_unreadable(&self.path, e))?;
        reader
            .read_header()
            .map_err(|e| Error::source_unreadable(&self.path, e))?;
        Ok(Positions::new(reader, self.path.clone(), self.filter.clone()))
    }
}

/// Lazy iterator over the positions of a VCF whose header was already consumed.
pub struct Positions<R> {
    reader: vcf::io::Reader<R>,
    record: vcf::Record,
    path: Utf8PathBuf,
    filter: ChromFilter,
    current: Option<Arc<str>>,
    finished: FnvHashSet<Arc<str>>,
    done: bool,
}

impl<R: BufRead> Positions<R> {
    pub fn new(reader: vcf::io::Reader<R>, path: Utf8PathBuf, filter: ChromFilter) -> Self {
        Self {
            reader,
            record: vcf::Record::default(),
            path,
            filter,
            current: None,
            finished: FnvHashSet::default(),
            done: false,
        }
    }

    fn read_next(&mut self) -> Result<Option<Position>> {
        loop {
            let n = self
                .reader
                .read_record(&mut self.record)
                .map_err(|e| Error::source_unreadable(&self.path, e))?;
            if n == 0 {
                return Ok(None);
            }

            let name = self.record.reference_sequence_name();
            if !self.filter.allows(name) {
                continue;
            }

            let pos = match self.record.variant_start() {
                Some(Ok(pos)) => pos.get(),
                Some(Err(e)) => return Err(Error::source_unreadable(&self.path, e)),
                None => {
                    return Err(Error::source_unreadable(
                        &self.path,
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("record on {name} is missing a position"),
                        ),
                    ))
                }
            };

            let same = match &self.current {
                Some(current) if current.as_ref() == name => Some(current.clone()),
                _ => None,
            };
            let chrom = match same {
                Some(chrom) => chrom,
                None => {
                    let name = name.to_owned();
                    self.start_chromosome(&name)?
                }
            };

            return Ok(Some(Position { chrom, pos }));
        }
    }

    fn start_chromosome(&mut self, name: &str) -> Result<Arc<str>> {
        if self.finished.contains(name) {
            return Err(Error::invariant(format!(
                "Chromosome {name} reappears after {}; {} is not grouped by chromosome",
                self.current.as_deref().unwrap_or("?"),
                self.path
            )));
        }
        let chrom: Arc<str> = Arc::from(name);
        if let Some(previous) = self.current.replace(chrom.clone()) {
            self.finished.insert(previous);
        }
        Ok(chrom)
    }
}

impl<R: BufRead> Iterator for Positions<R> {
    type Item = Result<Position>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(position)) => Some(Ok(position)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcf_text(records: &[(&str, usize)]) -> String {
        let mut text = String::from(
            "##fileformat=VCFv4.3\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n",
        );
        for (chrom, pos) in records {
            text.push_str(&format!("{chrom}\t{pos}\t.\tA\tG\t.\t.\t.\n"));
        }
        text
    }

    fn positions_of(text: &str, filter: ChromFilter) -> Vec<Result<Position>> {
        let mut reader = vcf::io::Reader::new(text.as_bytes());
        reader.read_header().unwrap();
        Positions::new(reader, Utf8PathBuf::from("test.vcf"), filter).collect()
    }

    #[test]
    fn test_positions_follow_source_order() {
        let text = vcf_text(&[("chr1", 10), ("chr1", 20), ("chr1", 20), ("chr2", 5)]);
        let positions: Vec<Position> = positions_of(&text, ChromFilter::default())
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(
            positions,
            vec![
                Position::new("chr1", 10),
                Position::new("chr1", 20),
                Position::new("chr1", 20),
                Position::new("chr2", 5),
            ]
        );
    }

    #[test]
    fn test_filter_skips_chromosomes() {
        let text = vcf_text(&[("chr1", 10), ("chr2", 5), ("chr3", 7)]);
        let filter = ChromFilter {
            include: None,
            exclude: Some(["chr2".to_string()].into_iter().collect()),
        };
        let positions: Vec<Position> = positions_of(&text, filter)
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            positions,
            vec![Position::new("chr1", 10), Position::new("chr3", 7)]
        );
    }

    #[test]
    fn test_interleaved_chromosomes_rejected() {
        let text = vcf_text(&[("chr1", 10), ("chr2", 5), ("chr1", 30)]);
        let results = positions_of(&text, ChromFilter::default());
        assert_eq!(results.len(), 3);
        assert!(matches!(results[2], Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_missing_index_is_unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("plain.vcf.gz")).unwrap();
        std::fs::write(&path, vcf_text(&[("chr1", 1)])).unwrap();

        let err = PositionIndex::open(&path).unwrap_err();
        assert!(matches!(err, Error::SourceUnreadable { .. }));
    }
}
