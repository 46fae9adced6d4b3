use std::fs::File;
use std::io::{self, BufWriter};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use assoc_chunks::assoc::aggregate::ResultAggregator;
use assoc_chunks::assoc::config::{
    validate_output_name, FailurePolicy, Interaction, RunConfig, TestCommand, Transform,
    DEFAULT_CHUNK_SIZE, DEFAULT_MIN_PER_GROUP,
};
use assoc_chunks::assoc::{run_assoc, run_regions};
use assoc_chunks::core::position::ChromFilter;
use assoc_chunks::core::utils::{init_logging, read_chromosome_set};
use camino::Utf8PathBuf;
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::{error, info, warn};

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_PARTIAL: u8 = 3;

/// Chunked, parallel genome-wide association runs
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked, parallel genome-wide association runs")]
pub struct Cli {
    /// Print the command line reference as markdown and exit
    #[arg(long = "markdown-help", hide = true)]
    pub markdown_help: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Split the variant source, test every region and aggregate the results
    Run(RunArgs),
    /// Print the chunk/region table without running any test
    Regions(RegionsArgs),
    /// Re-aggregate the chunk artifacts of a kept work directory
    Aggregate(AggregateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ChromOptions {
    /// Comma separated list of chromosomes to exclude
    #[arg(short = 'x', long = "exclude", value_delimiter = ',', num_args = 1.., conflicts_with = "exclude_file")]
    pub exclude: Option<Vec<String>>,

    /// Path to file with chromosomes to exclude, one per line
    #[arg(long = "exclude-file")]
    pub exclude_file: Option<Utf8PathBuf>,

    /// Comma separated list of chromosomes to include (restrict analysis to)
    #[arg(short = 'i', long = "include", value_delimiter = ',', num_args = 1.., conflicts_with = "include_file")]
    pub include: Option<Vec<String>>,

    /// Path to file with chromosomes to include, one per line
    #[arg(long = "include-file")]
    pub include_file: Option<Utf8PathBuf>,
}

impl ChromOptions {
    pub fn to_filter(&self) -> Result<ChromFilter> {
        Ok(ChromFilter {
            include: read_chromosome_set(self.include.as_deref(), self.include_file.as_deref())?,
            exclude: read_chromosome_set(self.exclude.as_deref(), self.exclude_file.as_deref())?,
        })
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Preprocessed phenotype table
    #[arg(short = 'p', long = "phenotype", required = true)]
    pub phenotype: Utf8PathBuf,

    /// Preprocessed covariate table
    #[arg(short = 'c', long = "covariate", required = true)]
    pub covariate: Utf8PathBuf,

    /// Bgzipped VCF with a tabix or CSI index next to it
    #[arg(short = 'g', long = "genotype", required = true)]
    pub genotype: Utf8PathBuf,

    /// External program running the association test for one region
    #[arg(long = "test-command", required = true)]
    pub test_command: Utf8PathBuf,

    /// Extra argument passed to the test program before the standard ones (repeatable)
    #[arg(long = "test-arg", allow_hyphen_values = true)]
    pub test_args: Vec<String>,

    /// Number of variant positions per chunk
    #[arg(short = 'l', long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Phenotype transformation
    #[arg(long = "transform", value_enum, default_value_t = Transform::None)]
    pub transform: Transform,

    /// Covariate to model an interaction with, or "none"
    #[arg(long = "interaction", default_value = "none")]
    pub interaction: String,

    /// Minimum individuals per genotype group
    #[arg(short = 'm', long = "min-per-group", default_value_t = DEFAULT_MIN_PER_GROUP)]
    pub min_per_group: usize,

    /// Output directory
    #[arg(short = 'o', long = "outdir", default_value = ".")]
    pub outdir: Utf8PathBuf,

    /// Output file name
    #[arg(short = 'n', long = "output-name", default_value = "assoc_results.txt")]
    pub output_name: String,

    /// Number of tests to run in parallel
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: usize,

    /// Kill a region's test after this many seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Fail the run if any region's test fails
    #[arg(long = "strict")]
    pub strict: bool,

    /// Keep per-region and per-chunk files in this directory
    #[arg(long = "work-dir")]
    pub work_dir: Option<Utf8PathBuf>,

    #[command(flatten)]
    pub chroms: ChromOptions,
}

impl RunArgs {
    fn into_config(self) -> Result<RunConfig> {
        let interaction: Interaction = self.interaction.parse()?;
        let chroms = self.chroms.to_filter()?;
        Ok(RunConfig {
            phenotype: self.phenotype,
            covariate: self.covariate,
            genotype: self.genotype,
            chunk_size: self.chunk_size,
            transform: self.transform,
            interaction,
            min_per_group: self.min_per_group,
            outdir: self.outdir,
            output_name: self.output_name,
            test: TestCommand {
                program: self.test_command,
                args: self.test_args,
            },
            threads: self.threads,
            timeout: self.timeout.map(Duration::from_secs),
            policy: policy(self.strict),
            work_dir: self.work_dir,
            chroms,
        })
    }

    pub fn run(self) -> Result<u8> {
        let config = self.into_config()?;

        let summary = run_assoc(&config)?;
        info!(
            "{} chunks, {} regions ({} without rows), {} rows written to {}",
            summary.chunks, summary.regions, summary.empty_regions, summary.rows, summary.output
        );
        if summary.is_partial() {
            if let Some(path) = &summary.failures_file {
                warn!("Failed regions are listed in {path}");
            }
            if !summary.missing_chunks.is_empty() {
                warn!(
                    "Chunks missing from the output: {}",
                    summary.missing_chunks.join(", ")
                );
            }
            return Ok(EXIT_PARTIAL);
        }
        Ok(0)
    }
}

#[derive(Args, Debug)]
pub struct RegionsArgs {
    /// Bgzipped VCF with a tabix or CSI index next to it
    #[arg(short = 'g', long = "genotype", required = true)]
    pub genotype: Utf8PathBuf,

    /// Number of variant positions per chunk
    #[arg(short = 'l', long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Write the table here instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<Utf8PathBuf>,

    #[command(flatten)]
    pub chroms: ChromOptions,
}

impl RegionsArgs {
    pub fn run(self) -> Result<u8> {
        let chroms = self.chroms.to_filter()?;
        match &self.output {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create region table {path}"))?;
                run_regions(&self.genotype, self.chunk_size, &chroms, BufWriter::new(file))?;
            }
            None => {
                run_regions(&self.genotype, self.chunk_size, &chroms, io::stdout().lock())?;
            }
        }
        Ok(0)
    }
}

#[derive(Args, Debug)]
pub struct AggregateArgs {
    /// Work directory holding chunk_<id>.tsv artifacts
    #[arg(short = 'w', long = "work-dir", required = true)]
    pub work_dir: Utf8PathBuf,

    /// Number of chunks the run produced (default: highest chunk found + 1)
    #[arg(short = 'e', long = "expected-chunks")]
    pub expected_chunks: Option<usize>,

    /// Covariate the test modelled an interaction with, or "none"
    #[arg(long = "interaction", default_value = "none")]
    pub interaction: String,

    /// Output directory
    #[arg(short = 'o', long = "outdir", default_value = ".")]
    pub outdir: Utf8PathBuf,

    /// Output file name
    #[arg(short = 'n', long = "output-name", default_value = "assoc_results.txt")]
    pub output_name: String,

    /// Fail if any expected chunk artifact is missing
    #[arg(long = "strict")]
    pub strict: bool,
}

impl AggregateArgs {
    pub fn run(self) -> Result<u8> {
        let interaction: Interaction = self.interaction.parse()?;
        validate_output_name(&self.output_name)?;
        if !self.work_dir.is_dir() {
            anyhow::bail!("Work directory {} does not exist", self.work_dir);
        }

        let dest = self.outdir.join(&self.output_name);
        let summary = ResultAggregator::new(interaction, policy(self.strict)).aggregate(
            &self.work_dir,
            self.expected_chunks,
            &dest,
        )?;
        if !summary.is_complete() {
            return Ok(EXIT_PARTIAL);
        }
        Ok(0)
    }
}

fn policy(strict: bool) -> FailurePolicy {
    if strict {
        FailurePolicy::Strict
    } else {
        FailurePolicy::Lenient
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    if cli.markdown_help {
        print!("{}", clap_markdown::help_markdown::<Cli>());
        return Ok(0);
    }

    match cli.command {
        Some(Commands::Run(args)) => args.run(),
        Some(Commands::Regions(args)) => args.run(),
        Some(Commands::Aggregate(args)) => args.run(),
        None => {
            Cli::command().print_help()?;
            Ok(EXIT_USAGE)
        }
    }
}

// Main entry point
pub fn main() -> ExitCode {
    // help and version requests also end the run with a non-zero status
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if let Err(e) = init_logging() {
        eprintln!("{e}");
        return ExitCode::from(EXIT_FAILURE);
    }

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
