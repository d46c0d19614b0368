//! Error types for ea-convert

use std::path::PathBuf;
use thiserror::Error;

/// Why a channel-group file could not be turned into samples.
///
/// The conversion treats every variant the same way (the modality is absent
/// for that session), but the variants are kept apart for diagnostics.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Channel file missing: {0}")]
    Missing(PathBuf),

    #[error("Corrupt channel file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Unsupported channel file {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LoadError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LoadError::Unsupported {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Missing(_) => "missing",
            LoadError::Corrupt { .. } => "corrupt",
            LoadError::Unsupported { .. } => "unsupported",
            LoadError::Io { .. } => "io",
        }
    }
}

/// Failures of the session alignment stage.
#[derive(Debug, Error)]
pub enum AlignError {
    #[error(
        "FATAL: padded table for {session} has {actual} rows, expected {expected} \
         ({boundary_start} .. {boundary_end}); join or padding is defective"
    )]
    RowCountMismatch {
        session: String,
        expected: i64,
        actual: usize,
        boundary_start: String,
        boundary_end: String,
    },

    #[error("Duplicate {0} channel group in one session")]
    DuplicateModality(&'static str),

    #[error("Cannot round {0} to granularity")]
    Rounding(String),
}

/// Failures of the columnar chunk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed chunk file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Invalid JSON header: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of chunk writing, reading and joining.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Chunk file name {0} is not a UTC bucket name")]
    BadName(PathBuf),

    #[error("Chunk {path} does not match the configured layout: {reason}")]
    Schema { path: PathBuf, reason: String },

    #[error("Chunks {0} and {1} belong to different sessions")]
    NotSameSession(PathBuf, PathBuf),

    #[error("Chunks {0} and {1} are not adjacent in time")]
    NotAdjacent(PathBuf, PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the pipeline entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown patient id: {0}")]
    UnknownPatient(String),

    #[error("No raw sessions found for patient {0}")]
    NoRawData(String),

    #[error("No converted data for patient {0}; run convert first")]
    NoConvertedData(String),

    #[error("Patient {0} is already split; run unsplit before converting")]
    AlreadySplit(String),

    #[error("Missing split directories for patient {patient}: {missing:?}; run split first")]
    MissingSplits {
        patient: String,
        missing: Vec<String>,
    },

    #[error("Seizure table not found: {0}")]
    MissingSeizures(PathBuf),

    #[error("Invalid proportions: {0}")]
    InvalidProportions(String),

    #[error("Invalid window parameters: {0}")]
    InvalidWindow(String),

    #[error("{} session(s) failed alignment: {}", .0.len(), .0.join(", "))]
    AlignmentFailed(Vec<String>),

    #[error("Session directory {0} already exists in the unsplit pool")]
    SessionCollision(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Align(#[from] AlignError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Attach a path to an `io::Error` for the given error constructor.
pub(crate) trait IoContext<T> {
    fn with_path<E>(self, path: &std::path::Path, wrap: fn(PathBuf, std::io::Error) -> E) -> Result<T, E>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path<E>(self, path: &std::path::Path, wrap: fn(PathBuf, std::io::Error) -> E) -> Result<T, E> {
        self.map_err(|e| wrap(path.to_path_buf(), e))
    }
}

pub(crate) fn pipeline_io(path: PathBuf, source: std::io::Error) -> PipelineError {
    PipelineError::Io { path, source }
}

pub(crate) fn chunk_io(path: PathBuf, source: std::io::Error) -> ChunkError {
    ChunkError::Io { path, source }
}

pub(crate) fn store_io(path: PathBuf, source: std::io::Error) -> StoreError {
    StoreError::Io { path, source }
}
