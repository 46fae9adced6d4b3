use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use log::{debug, error, info, trace, warn};
use rayon::prelude::*;

use super::aggregate::{append_lines, clear_chunk_artifacts};
use super::chunks::{Chunk, ChunkId};
use super::config::{Interaction, RunConfig, TestCommand, Transform};
use super::regions::{resolve_regions, Region};
use crate::core::utils::create_progress_bar;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOG_TAIL_LINES: usize = 5;

/// Shared flag telling in-flight and pending invocations to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One test run: the k-th region of a chunk and the files it owns.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub chunk: ChunkId,
    pub k: usize,
    pub region: Region,
    pub output: Utf8PathBuf,
    pub log: Utf8PathBuf,
}

impl Invocation {
    pub fn new(work_dir: &Utf8Path, chunk: ChunkId, k: usize, region: Region) -> Self {
        Self {
            output: work_dir.join(format!("chunk_{chunk}.r{k}.out")),
            log: work_dir.join(format!("chunk_{chunk}.r{k}.log")),
            chunk,
            k,
            region,
        }
    }

    pub fn failure(&self, reason: impl Into<String>) -> Error {
        Error::TestInvocation {
            chunk: self.chunk.to_string(),
            k: self.k,
            region: self.region.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutput {
    /// Rows were written to the invocation's output file
    Rows,
    /// Nothing to report for this region
    Empty,
}

/// The statistical test run once per region.
///
/// Implementations write their rows to `invocation.output` and nowhere else, and should
/// give up promptly once `cancel` is set.
pub trait AssociationTest: Send + Sync {
    fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<TestOutput>;
}

/// Runs the configured external program for each region.
#[derive(Debug, Clone)]
pub struct ExternalTest {
    command: TestCommand,
    phenotype: Utf8PathBuf,
    covariate: Utf8PathBuf,
    genotype: Utf8PathBuf,
    min_per_group: usize,
    transform: Transform,
    interaction: Interaction,
    timeout: Option<Duration>,
}

impl ExternalTest {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            command: config.test.clone(),
            phenotype: config.phenotype.clone(),
            covariate: config.covariate.clone(),
            genotype: config.genotype.clone(),
            min_per_group: config.min_per_group,
            transform: config.transform,
            interaction: config.interaction.clone(),
            timeout: config.timeout,
        }
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg("--phenotype")
            .arg(&self.phenotype)
            .arg("--covariate")
            .arg(&self.covariate)
            .arg("--genotype")
            .arg(&self.genotype)
            .arg("--region")
            .arg(invocation.region.to_string())
            .arg("--min-per-group")
            .arg(self.min_per_group.to_string())
            .arg("--transform")
            .arg(self.transform.to_string())
            .arg("--interaction")
            .arg(self.interaction.to_string())
            .arg("--output")
            .arg(&invocation.output);
        cmd
    }

    fn wait(
        &self,
        child: &mut Child,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<std::process::ExitStatus> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    kill(child);
                    return Err(invocation.failure(format!("failed to wait on test: {e}")));
                }
            }
            if cancel.is_cancelled() {
                kill(child);
                return Err(Error::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    kill(child);
                    return Err(invocation.failure(format!(
                        "timed out after {}s",
                        timeout.as_secs_f64()
                    )));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl AssociationTest for ExternalTest {
    fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<TestOutput> {
        let log = File::create(&invocation.log)?;
        let spawned = self
            .command(invocation)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                return Err(Error::configuration(format!(
                    "Cannot launch test program {}: {e}",
                    self.command.program
                )))
            }
            Err(e) => return Err(invocation.failure(format!("failed to start test: {e}"))),
        };
        trace!("Started test for chunk {} region {}", invocation.chunk, invocation.region);

        let status = self.wait(&mut child, invocation, cancel)?;
        if !status.success() {
            let tail = log_tail(&invocation.log);
            let reason = if tail.is_empty() {
                format!("test {status}")
            } else {
                format!("test {status}: {tail}")
            };
            return Err(invocation.failure(reason));
        }

        output_kind(invocation)
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn output_kind(invocation: &Invocation) -> Result<TestOutput> {
    match fs::metadata(&invocation.output) {
        Ok(meta) if meta.len() > 0 => Ok(TestOutput::Rows),
        Ok(_) => Ok(TestOutput::Empty),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TestOutput::Empty),
        Err(e) => Err(invocation.failure(format!("cannot read test output: {e}"))),
    }
}

fn log_tail(path: &Utf8Path) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].join(" | ")
}

#[derive(Debug, Clone)]
pub struct RegionFailure {
    pub chunk: ChunkId,
    pub k: usize,
    pub region: Region,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub chunks: usize,
    pub invocations: usize,
    pub empty: usize,
    pub failures: Vec<RegionFailure>,
}

/// Runs one test per region on a bounded pool and assembles per-chunk artifacts.
pub struct TestDispatcher<'a, T: AssociationTest> {
    test: &'a T,
    work_dir: &'a Utf8Path,
    threads: usize,
}

impl<'a, T: AssociationTest> TestDispatcher<'a, T> {
    pub fn new(test: &'a T, work_dir: &'a Utf8Path, threads: usize) -> Self {
        Self {
            test,
            work_dir,
            threads,
        }
    }

    pub fn invocations(&self, chunks: &[Chunk]) -> Result<Vec<Invocation>> {
        let mut invocations = Vec::new();
        for chunk in chunks {
            for (idx, region) in resolve_regions(chunk)?.into_iter().enumerate() {
                invocations.push(Invocation::new(self.work_dir, chunk.id, idx + 1, region));
            }
        }
        Ok(invocations)
    }

    pub fn dispatch(&self, chunks: &[Chunk]) -> Result<DispatchReport> {
        let invocations = self.invocations(chunks)?;
        clear_chunk_artifacts(self.work_dir)?;
        info!(
            "Dispatching {} region tests from {} chunks on {} threads",
            invocations.len(),
            chunks.len(),
            self.threads
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| Error::configuration(format!("Failed to build thread pool: {e}")))?;
        let cancel = CancellationToken::new();
        let pb = create_progress_bar(invocations.len());

        // collect keeps input order, so outcomes line up with invocations
        let outcomes: Vec<Result<TestOutput>> = pool.install(|| {
            invocations
                .par_iter()
                .map(|invocation| {
                    let outcome = self.run_one(invocation, &cancel);
                    pb.inc(1);
                    outcome
                })
                .collect()
        });
        pb.finish_and_clear();

        let mut report = DispatchReport {
            chunks: chunks.len(),
            invocations: invocations.len(),
            ..Default::default()
        };
        let mut fatal = None;
        let mut produced: IndexMap<ChunkId, Vec<&Utf8Path>> = IndexMap::new();

        for (invocation, outcome) in invocations.iter().zip(outcomes) {
            match outcome {
                Ok(TestOutput::Rows) => produced
                    .entry(invocation.chunk)
                    .or_default()
                    .push(&invocation.output),
                Ok(TestOutput::Empty) => report.empty += 1,
                Err(Error::TestInvocation { reason, .. }) => report.failures.push(RegionFailure {
                    chunk: invocation.chunk,
                    k: invocation.k,
                    region: invocation.region.clone(),
                    reason,
                }),
                Err(Error::Cancelled) => {}
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        chunks.par_iter().try_for_each(|chunk| {
            let partials = produced.get(&chunk.id).map_or(&[][..], Vec::as_slice);
            write_chunk_artifact(self.work_dir, chunk.id, partials)
        })?;

        info!(
            "Finished {} region tests: {} with rows, {} empty, {} failed",
            report.invocations,
            report.invocations - report.empty - report.failures.len(),
            report.empty,
            report.failures.len()
        );
        Ok(report)
    }

    fn run_one(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<TestOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // a stale partial from an earlier run in the same work dir must not count as rows
        match fs::remove_file(&invocation.output) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let outcome = self.test.run(invocation, cancel);
        match &outcome {
            Ok(TestOutput::Rows) => trace!(
                "Chunk {} region {} (k={}) produced rows",
                invocation.chunk,
                invocation.region,
                invocation.k
            ),
            Ok(TestOutput::Empty) => debug!(
                "Chunk {} region {} (k={}) produced no rows",
                invocation.chunk, invocation.region, invocation.k
            ),
            Err(Error::Cancelled) => {}
            Err(e) if e.is_fatal() => {
                error!("{e}; cancelling remaining tests");
                cancel.cancel();
            }
            Err(e) => warn!("{e}"),
        }
        outcome
    }
}

/// Concatenates a chunk's partial outputs in k order into its artifact.
fn write_chunk_artifact(work_dir: &Utf8Path, chunk: ChunkId, partials: &[&Utf8Path]) -> Result<()> {
    let path = work_dir.join(chunk.artifact_name());
    let tmp = work_dir.join(format!("{}.tmp", chunk.artifact_name()));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for partial in partials {
            append_lines(&mut writer, partial)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}
