use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while splitting, dispatching and aggregating an association run.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing inputs, invalid numeric parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Variant source or its index cannot be opened or read
    #[error("Cannot read variant source {path}: {source}")]
    SourceUnreadable {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    /// Splitting or resolving produced something that should be impossible
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// One region's external test failed or timed out
    #[error("Test failed for chunk {chunk} region {region} (k={k}): {reason}")]
    TestInvocation {
        chunk: String,
        k: usize,
        region: String,
        reason: String,
    },

    /// Expected per-chunk artifacts are missing at aggregation time
    #[error("Aggregation incomplete: missing artifacts for chunk(s) {}", .missing.join(", "))]
    AggregationIncomplete { missing: Vec<String> },

    /// Strict policy: at least one region failed
    #[error("{count} region test(s) failed; first failure: {first}")]
    RegionsFailed { count: usize, first: String },

    /// The run was cancelled after a fatal error elsewhere
    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub fn source_unreadable(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the whole run. Region failures and cancellations do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TestInvocation { .. } | Self::Cancelled)
    }
}
