pub mod aggregate;
pub mod chunks;
pub mod config;
pub mod dispatch;
pub mod regions;
pub mod report;

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, error, info, warn};
use tempfile::TempDir;

use crate::core::position::{ChromFilter, PositionIndex};
use crate::core::utils::create_spinner;
use crate::error::{Error, Result};
use aggregate::ResultAggregator;
use chunks::{Chunk, ChunkSplitter};
use config::RunConfig;
use dispatch::{AssociationTest, ExternalTest, RegionFailure, TestDispatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    Splitting,
    Dispatching,
    Aggregating,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output: Utf8PathBuf,
    pub chunks: usize,
    pub regions: usize,
    pub empty_regions: usize,
    pub rows: usize,
    pub failures: Vec<RegionFailure>,
    pub failures_file: Option<Utf8PathBuf>,
    pub missing_chunks: Vec<String>,
}

impl RunSummary {
    /// True when some regions or chunks are absent from the output.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() || !self.missing_chunks.is_empty()
    }
}

/// Reads, splits and chunks the variant positions of `genotype`.
pub fn split_source(genotype: &Utf8Path, chunk_size: usize, chroms: &ChromFilter) -> Result<Vec<Chunk>> {
    let splitter = ChunkSplitter::new(chunk_size)?;
    let spinner = create_spinner("Reading variant positions...");
    let index = PositionIndex::open(genotype)?.with_filter(chroms.clone());
    let chunks = splitter.split(index.positions()?)?;
    let positions: usize = chunks.iter().map(Chunk::len).sum();
    spinner.finish_and_clear();
    info!(
        "Split {} positions from {} into {} chunks of up to {}",
        positions,
        genotype,
        chunks.len(),
        chunk_size
    );
    Ok(chunks)
}

/// One association run, from pre-flight validation to the published output.
pub struct Pipeline<'a, T: AssociationTest> {
    config: &'a RunConfig,
    test: T,
    state: RunState,
}

impl<'a, T: AssociationTest> Pipeline<'a, T> {
    pub fn new(config: &'a RunConfig, test: T) -> Self {
        Self {
            config,
            test,
            state: RunState::Initialized,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn advance(&mut self, next: RunState) {
        debug!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        match self.execute() {
            Ok(summary) => {
                self.advance(RunState::Completed);
                Ok(summary)
            }
            Err(e) => {
                error!("Run failed during {:?}: {e}", self.state);
                self.advance(RunState::Failed);
                Err(e)
            }
        }
    }

    fn execute(&mut self) -> Result<RunSummary> {
        let config = self.config;
        config.validate()?;
        fs::create_dir_all(&config.outdir).map_err(|e| {
            Error::configuration(format!(
                "Failed to create output directory {}: {e}",
                config.outdir
            ))
        })?;
        let (_guard, work_dir) = prepare_work_dir(config)?;

        self.advance(RunState::Splitting);
        let chunks = split_source(&config.genotype, config.chunk_size, &config.chroms)?;
        if chunks.is_empty() {
            warn!(
                "No variant positions in {}; the output will only contain a header",
                config.genotype
            );
        }

        self.advance(RunState::Dispatching);
        let report = TestDispatcher::new(&self.test, &work_dir, config.threads).dispatch(&chunks)?;

        let failures_path = report::failures_path(&config.outdir, &config.output_name);
        let failures_file = if report.failures.is_empty() {
            report::clear_stale_failures(&failures_path)?;
            None
        } else {
            report::write_failures(&failures_path, &report.failures)?;
            warn!(
                "{} of {} region tests failed; see {}",
                report.failures.len(),
                report.invocations,
                failures_path
            );
            if config.is_strict() {
                return Err(Error::RegionsFailed {
                    count: report.failures.len(),
                    first: format!(
                        "chunk {} region {}: {}",
                        report.failures[0].chunk, report.failures[0].region, report.failures[0].reason
                    ),
                });
            }
            Some(failures_path)
        };

        self.advance(RunState::Aggregating);
        let aggregated = ResultAggregator::new(config.interaction.clone(), config.policy).aggregate(
            &work_dir,
            Some(chunks.len()),
            &config.output_path(),
        )?;

        let summary = RunSummary {
            output: aggregated.output,
            chunks: report.chunks,
            regions: report.invocations,
            empty_regions: report.empty,
            rows: aggregated.rows,
            failures: report.failures,
            failures_file,
            missing_chunks: aggregated.missing,
        };
        if summary.is_partial() {
            warn!("{} is PARTIAL: some regions are missing", summary.output);
        }
        Ok(summary)
    }
}

/// Work directory for partials and chunk artifacts. A temporary one lives next to the
/// output and is removed when the guard drops.
fn prepare_work_dir(config: &RunConfig) -> Result<(Option<TempDir>, Utf8PathBuf)> {
    if let Some(dir) = &config.work_dir {
        fs::create_dir_all(dir)?;
        info!("Using work directory {dir}");
        return Ok((None, dir.clone()));
    }

    let tmp = tempfile::Builder::new()
        .prefix(".assoc-work-")
        .tempdir_in(&config.outdir)?;
    let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).map_err(|p| {
        Error::configuration(format!("Work directory {} is not valid UTF-8", p.display()))
    })?;
    debug!("Using temporary work directory {path}");
    Ok((Some(tmp), path))
}

/// Runs the whole pipeline with the configured external test program.
pub fn run_assoc(config: &RunConfig) -> Result<RunSummary> {
    Pipeline::new(config, ExternalTest::from_config(config)).run()
}

/// Splits and resolves without running any test, writing the region table to `writer`.
pub fn run_regions<W: Write>(
    genotype: &Utf8Path,
    chunk_size: usize,
    chroms: &ChromFilter,
    writer: W,
) -> Result<usize> {
    let chunks = split_source(genotype, chunk_size, chroms)?;
    let count = report::write_regions(writer, &chunks)?;
    info!("Resolved {} regions in {} chunks", count, chunks.len());
    Ok(count)
}
