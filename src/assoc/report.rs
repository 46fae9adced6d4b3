use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use super::chunks::Chunk;
use super::dispatch::RegionFailure;
use super::regions::resolve_regions;
use crate::error::Result;

#[derive(Debug, Serialize)]
struct FailureRecord<'a> {
    chunk: String,
    k: usize,
    region: String,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct RegionRecord {
    chunk: String,
    k: usize,
    region: String,
}

fn tsv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer)
}

/// Sidecar listing the regions missing from `<output name>`.
pub fn failures_path(outdir: &Utf8Path, output_name: &str) -> Utf8PathBuf {
    outdir.join(format!("{output_name}.failed.tsv"))
}

pub fn write_failures(path: &Utf8Path, failures: &[RegionFailure]) -> Result<()> {
    let mut writer = tsv_writer(fs::File::create(path)?);
    for failure in failures {
        writer.serialize(FailureRecord {
            chunk: failure.chunk.to_string(),
            k: failure.k,
            region: failure.region.to_string(),
            reason: &failure.reason,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Removes a sidecar left behind by an earlier, partial run.
pub fn clear_stale_failures(path: &Utf8Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::info!("Removed stale failure report {path}");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Writes the `chunk, k, region` table for every chunk. Returns the number of regions.
pub fn write_regions<W: Write>(writer: W, chunks: &[Chunk]) -> Result<usize> {
    let mut writer = tsv_writer(writer);
    let mut count = 0;
    for chunk in chunks {
        for (idx, region) in resolve_regions(chunk)?.iter().enumerate() {
            writer.serialize(RegionRecord {
                chunk: chunk.id.to_string(),
                k: idx + 1,
                region: region.to_string(),
            })?;
            count += 1;
        }
    }
    writer.flush()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::chunks::{ChunkId, ChunkSplitter};
    use crate::assoc::regions::Region;
    use crate::core::position::Position;
    use tempfile::TempDir;

    #[test]
    fn test_write_regions_table() {
        let positions = [("chr1", 10), ("chr1", 20), ("chr1", 30), ("chr2", 5)]
            .into_iter()
            .map(|(c, p)| Ok(Position::new(c, p)));
        let chunks = ChunkSplitter::new(2).unwrap().split(positions).unwrap();

        let mut buf = Vec::new();
        let count = write_regions(&mut buf, &chunks).unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "chunk\tk\tregion\n0\t1\tchr1:10-20\n1\t1\tchr1:30-30\n1\t2\tchr2:5-5\n"
        );
    }

    #[test]
    fn test_failures_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let outdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let path = failures_path(&outdir, "results.tsv");
        assert!(path.as_str().ends_with("results.tsv.failed.tsv"));

        let failures = vec![RegionFailure {
            chunk: ChunkId::new(4, 2),
            k: 1,
            region: Region::new("chr2", 28, 35),
            reason: "test exit status: 1".to_string(),
        }];
        write_failures(&path, &failures).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "chunk\tk\tregion\treason\n04\t1\tchr2:28-35\ttest exit status: 1\n"
        );

        clear_stale_failures(&path).unwrap();
        assert!(!path.exists());
        clear_stale_failures(&path).unwrap();
    }
}
