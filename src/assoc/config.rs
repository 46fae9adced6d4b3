use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;

use crate::core::position::ChromFilter;
use crate::error::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_MIN_PER_GROUP: usize = 10;

/// Phenotype transformation applied by the external test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Transform {
    #[default]
    None,
    Sqrt,
    Log,
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transform::None => "none",
            Transform::Sqrt => "sqrt",
            Transform::Log => "log",
        };
        f.write_str(s)
    }
}

/// Whether the test models an interaction with a named covariate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Interaction {
    #[default]
    None,
    Covariate(String),
}

impl FromStr for Interaction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "" => Err(Error::configuration("Interaction covariate name is empty")),
            "none" => Ok(Interaction::None),
            name if name.contains(char::is_whitespace) => Err(Error::configuration(format!(
                "Interaction covariate '{name}' contains whitespace"
            ))),
            name => Ok(Interaction::Covariate(name.to_string())),
        }
    }
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interaction::None => f.write_str("none"),
            Interaction::Covariate(name) => f.write_str(name),
        }
    }
}

/// What happens to the run when a region's test fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Failed regions are left out of the aggregate and listed in a sidecar file
    #[default]
    Lenient,
    /// Any failed region or missing chunk artifact fails the run
    Strict,
}

/// External program that runs the association test for one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
}

/// Immutable configuration for one association run, built once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub phenotype: Utf8PathBuf,
    pub covariate: Utf8PathBuf,
    pub genotype: Utf8PathBuf,
    pub chunk_size: usize,
    pub transform: Transform,
    pub interaction: Interaction,
    pub min_per_group: usize,
    pub outdir: Utf8PathBuf,
    pub output_name: String,
    pub test: TestCommand,
    pub threads: usize,
    pub timeout: Option<Duration>,
    pub policy: FailurePolicy,
    /// Kept after the run when set; otherwise a temporary directory is used
    pub work_dir: Option<Utf8PathBuf>,
    pub chroms: ChromFilter,
}

impl RunConfig {
    /// Pre-flight checks. Nothing is read from the variant source here beyond its existence.
    pub fn validate(&self) -> Result<()> {
        for (label, path) in [
            ("phenotype", &self.phenotype),
            ("covariate", &self.covariate),
            ("genotype", &self.genotype),
        ] {
            if !path.is_file() {
                return Err(Error::configuration(format!(
                    "Missing {label} input: {path} does not exist or is not a file"
                )));
            }
        }

        if self.chunk_size == 0 {
            return Err(Error::configuration("Chunk size must be a positive integer"));
        }
        if self.min_per_group == 0 {
            return Err(Error::configuration(
                "Minimum individuals per genotype group must be a positive integer",
            ));
        }
        if self.threads == 0 {
            return Err(Error::configuration("Thread count must be a positive integer"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::configuration("Timeout must be greater than zero"));
        }
        validate_output_name(&self.output_name)?;

        if let Interaction::Covariate(name) = &self.interaction {
            let columns = read_header_columns(&self.covariate)?;
            if !columns.iter().any(|c| c == name) {
                return Err(Error::configuration(format!(
                    "Interaction covariate '{}' not found in covariate table {} (columns: {})",
                    name,
                    self.covariate,
                    columns.join(", ")
                )));
            }
        }

        Ok(())
    }

    pub fn output_path(&self) -> Utf8PathBuf {
        self.outdir.join(&self.output_name)
    }

    pub fn is_strict(&self) -> bool {
        self.policy == FailurePolicy::Strict
    }
}

pub fn validate_output_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::configuration(format!(
            "Output file name '{name}' must be a plain file name"
        )));
    }
    Ok(())
}

/// Column names from the first line of a whitespace or tab separated table.
fn read_header_columns(path: &Utf8Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .map_err(|e| Error::configuration(format!("Failed to open {path}: {e}")))?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|e| Error::configuration(format!("Failed to read header of {path}: {e}")))?;
    Ok(line.split_whitespace().map(str::to_string).collect())
}
