use std::fs;
use std::io::{BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fnv::FnvHashMap;
use log::{info, warn};
use tempfile::NamedTempFile;

use super::chunks::{id_width, ChunkId};
use super::config::{FailurePolicy, Interaction};
use crate::error::{Error, Result};

const HEADER_DELIMITER: &str = " ";
const FIXED_COLUMNS: [&str; 5] = ["CHR", "POS", "ID", "REF", "ALT"];
const STAT_COLUMNS: [&str; 3] = ["F", "R2", "P"];

pub fn header_columns(interaction: &Interaction) -> Vec<String> {
    let fixed = FIXED_COLUMNS.iter().map(|c| c.to_string());
    match interaction {
        Interaction::None => fixed
            .chain(STAT_COLUMNS.iter().map(|c| c.to_string()))
            .collect(),
        Interaction::Covariate(v) => fixed
            .chain(STAT_COLUMNS.iter().flat_map(|stat| {
                [
                    format!("{stat}({v})"),
                    format!("{stat}(GT)"),
                    format!("{stat}({v}:GT)"),
                ]
            }))
            .collect(),
    }
}

pub fn header_line(interaction: &Interaction) -> String {
    header_columns(interaction).join(HEADER_DELIMITER)
}

/// Copies `src` into `writer`, terminating the last line if needed. Returns the line count.
pub(crate) fn append_lines<W: Write>(writer: &mut W, src: &Utf8Path) -> Result<usize> {
    let bytes = fs::read(src)?;
    if bytes.is_empty() {
        return Ok(0);
    }
    writer.write_all(&bytes)?;
    let mut lines = bytes.iter().filter(|&&b| b == b'\n').count();
    if bytes.last() != Some(&b'\n') {
        writer.write_all(b"\n")?;
        lines += 1;
    }
    Ok(lines)
}

/// A per-chunk result file found in the work directory.
#[derive(Debug, Clone)]
pub struct ChunkArtifact {
    pub seq: usize,
    pub path: Utf8PathBuf,
}

fn artifact_seq(file_name: &str) -> Option<usize> {
    let digits = file_name.strip_prefix("chunk_")?.strip_suffix(".tsv")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Chunk artifacts in `work_dir`, sorted by sequence number.
pub fn find_chunk_artifacts(work_dir: &Utf8Path) -> Result<Vec<ChunkArtifact>> {
    let mut artifacts = Vec::new();
    let mut seen: FnvHashMap<usize, Utf8PathBuf> = FnvHashMap::default();

    for entry in work_dir.read_dir_utf8()? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(seq) = artifact_seq(entry.file_name()) else {
            continue;
        };
        let path = entry.path().to_path_buf();
        if let Some(other) = seen.insert(seq, path.clone()) {
            return Err(Error::invariant(format!(
                "Two artifacts claim chunk {seq}: {other} and {path}"
            )));
        }
        artifacts.push(ChunkArtifact { seq, path });
    }

    artifacts.sort_unstable_by_key(|a| a.seq);
    Ok(artifacts)
}

/// Removes chunk artifacts (and unfinished `.tmp` ones) left by an earlier run, so a
/// different chunk layout in the same work directory cannot collide with them.
pub fn clear_chunk_artifacts(work_dir: &Utf8Path) -> Result<usize> {
    let mut removed = 0;
    for entry in work_dir.read_dir_utf8()? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let artifact = name.strip_suffix(".tmp").unwrap_or(name);
        if artifact_seq(artifact).is_some() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Removed {removed} chunk artifacts left in {work_dir} by an earlier run");
    }
    Ok(removed)
}

#[derive(Debug, Clone)]
pub struct AggregateSummary {
    pub output: Utf8PathBuf,
    pub chunks: usize,
    pub rows: usize,
    pub missing: Vec<String>,
}

impl AggregateSummary {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Concatenates per-chunk artifacts in chunk order under a single header line.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    interaction: Interaction,
    policy: FailurePolicy,
}

impl ResultAggregator {
    pub fn new(interaction: Interaction, policy: FailurePolicy) -> Self {
        Self {
            interaction,
            policy,
        }
    }

    /// `expected` is the number of chunks the run produced; when unknown, every
    /// sequence number up to the highest artifact found is expected.
    pub fn aggregate(
        &self,
        work_dir: &Utf8Path,
        expected: Option<usize>,
        dest: &Utf8Path,
    ) -> Result<AggregateSummary> {
        let artifacts = find_chunk_artifacts(work_dir)?;
        let expected =
            expected.unwrap_or_else(|| artifacts.last().map_or(0, |artifact| artifact.seq + 1));

        let (artifacts, extra): (Vec<_>, Vec<_>) =
            artifacts.into_iter().partition(|a| a.seq < expected);
        for artifact in &extra {
            warn!(
                "Ignoring {}: chunk {} is beyond the {} expected chunks",
                artifact.path, artifact.seq, expected
            );
        }

        let width = id_width(expected);
        let mut present = artifacts.iter().map(|a| a.seq).peekable();
        let mut missing = Vec::new();
        for seq in 0..expected {
            if present.peek() == Some(&seq) {
                present.next();
            } else {
                missing.push(ChunkId::new(seq, width).to_string());
            }
        }

        if !missing.is_empty() {
            let err = Error::AggregationIncomplete {
                missing: missing.clone(),
            };
            if self.policy == FailurePolicy::Strict {
                return Err(err);
            }
            warn!("{err}; the aggregated output is partial");
        }

        let parent = match dest.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut tmp = NamedTempFile::new_in(&parent)?;
        let mut rows = 0;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            writeln!(writer, "{}", header_line(&self.interaction))?;
            for artifact in &artifacts {
                rows += append_lines(&mut writer, &artifact.path)?;
            }
            writer.flush()?;
        }
        tmp.persist(dest).map_err(|e| Error::Io(e.error))?;

        info!(
            "Wrote {} rows from {} chunks to {}",
            rows,
            artifacts.len(),
            dest
        );

        Ok(AggregateSummary {
            output: dest.to_path_buf(),
            chunks: artifacts.len(),
            rows,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn write_artifacts(dir: &Utf8Path, contents: &[(&str, &str)]) {
        for (name, content) in contents {
            fs::write(dir.join(name), content).unwrap();
        }
    }

    #[test]
    fn test_header_without_interaction() {
        assert_eq!(
            header_line(&Interaction::None),
            "CHR POS ID REF ALT F R2 P"
        );
        assert_eq!(header_columns(&Interaction::None).len(), 8);
    }

    #[test]
    fn test_header_with_interaction() {
        assert_eq!(
            header_line(&Interaction::Covariate("age".to_string())),
            "CHR POS ID REF ALT F(age) F(GT) F(age:GT) R2(age) R2(GT) R2(age:GT) P(age) P(GT) P(age:GT)"
        );
    }

    #[rstest]
    #[case("chunk_0.tsv", Some(0))]
    #[case("chunk_0012.tsv", Some(12))]
    #[case("chunk_01.r1.out", None)]
    #[case("chunk_.tsv", None)]
    #[case("chunk_1a.tsv", None)]
    #[case("chunk_03.tsv.tmp", None)]
    #[case("results.tsv", None)]
    fn test_artifact_seq(#[case] name: &str, #[case] expected: Option<usize>) {
        assert_eq!(artifact_seq(name), expected);
    }

    #[test]
    fn test_aggregate_orders_by_chunk() {
        let dir = TempDir::new().unwrap();
        let work = utf8_dir(&dir);
        write_artifacts(
            &work,
            &[
                ("chunk_10.tsv", "c10\n"),
                ("chunk_02.tsv", "c2a\nc2b\n"),
                ("chunk_00.tsv", "c0"),
                ("chunk_01.tsv", ""),
                ("chunk_01.r1.out", "partial\n"),
            ],
        );
        for seq in 3..10 {
            fs::write(work.join(format!("chunk_{seq:02}.tsv")), format!("c{seq}\n")).unwrap();
        }

        let dest = work.join("out").join("results.tsv");
        let summary = ResultAggregator::new(Interaction::None, FailurePolicy::Lenient)
            .aggregate(&work, Some(11), &dest)
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.chunks, 11);
        assert_eq!(summary.rows, 11);
        let content = fs::read_to_string(&dest).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "CHR POS ID REF ALT F R2 P");
        assert_eq!(
            &lines[1..],
            &["c0", "c2a", "c2b", "c3", "c4", "c5", "c6", "c7", "c8", "c9", "c10"]
        );
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let work = utf8_dir(&dir);
        write_artifacts(&work, &[("chunk_0.tsv", "a\n"), ("chunk_1.tsv", "b\n")]);

        let dest = work.join("results.tsv");
        let aggregator =
            ResultAggregator::new(Interaction::Covariate("sex".to_string()), FailurePolicy::Strict);
        aggregator.aggregate(&work, Some(2), &dest).unwrap();
        let first = fs::read(&dest).unwrap();
        aggregator.aggregate(&work, Some(2), &dest).unwrap();
        let second = fs::read(&dest).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_chunk_lenient_and_strict() {
        let dir = TempDir::new().unwrap();
        let work = utf8_dir(&dir);
        write_artifacts(&work, &[("chunk_0.tsv", "a\n"), ("chunk_2.tsv", "c\n")]);
        let dest = work.join("results.tsv");

        let summary = ResultAggregator::new(Interaction::None, FailurePolicy::Lenient)
            .aggregate(&work, Some(3), &dest)
            .unwrap();
        assert_eq!(summary.missing, vec!["1".to_string()]);
        assert!(!summary.is_complete());

        let err = ResultAggregator::new(Interaction::None, FailurePolicy::Strict)
            .aggregate(&work, None, &dest)
            .unwrap_err();
        assert!(matches!(err, Error::AggregationIncomplete { .. }));
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let dir = TempDir::new().unwrap();
        let work = utf8_dir(&dir);
        write_artifacts(&work, &[("chunk_1.tsv", "a\n"), ("chunk_01.tsv", "b\n")]);
        assert!(matches!(
            find_chunk_artifacts(&work),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_clear_chunk_artifacts_keeps_other_files() {
        let dir = TempDir::new().unwrap();
        let work = utf8_dir(&dir);
        write_artifacts(
            &work,
            &[
                ("chunk_00.tsv", "a\n"),
                ("chunk_10.tsv", "b\n"),
                ("chunk_03.tsv.tmp", "c\n"),
                ("chunk_00.r1.out", "d\n"),
                ("results.tsv", "e\n"),
            ],
        );
        assert_eq!(clear_chunk_artifacts(&work).unwrap(), 3);
        assert!(find_chunk_artifacts(&work).unwrap().is_empty());
        assert!(work.join("chunk_00.r1.out").exists());
        assert!(work.join("results.tsv").exists());
        assert_eq!(clear_chunk_artifacts(&work).unwrap(), 0);
    }

    #[test]
    fn test_no_chunks_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let work = utf8_dir(&dir);
        let dest = work.join("results.tsv");
        let summary = ResultAggregator::new(Interaction::None, FailurePolicy::Strict)
            .aggregate(&work, Some(0), &dest)
            .unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "CHR POS ID REF ALT F R2 P\n"
        );
    }
}
