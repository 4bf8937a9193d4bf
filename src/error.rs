use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the flatten → batch → merge pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed markup. Fatal to the document being flattened.
    #[error("malformed document at byte {offset}: {message}")]
    Parse { offset: u64, message: String },

    /// A source table could not be introspected. Callers degrade this to an
    /// empty contribution instead of aborting.
    #[error("cannot read schema of table `{table}`: {source}")]
    SchemaIntrospection {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("artifact {path}: {message}")]
    ArtifactIo { path: PathBuf, message: String },

    /// Widening or rewriting a destination table failed partway.
    #[error("reconciling table `{table}` failed: {source}")]
    Reconciliation {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("chunk size must be positive")]
    InvalidChunkSize,
}

impl Error {
    pub(crate) fn artifact(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Error::ArtifactIo {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Short machine-friendly label used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse { .. } => "parse",
            Error::SchemaIntrospection { .. } => "schema_introspection",
            Error::ArtifactIo { .. } => "artifact_io",
            Error::Reconciliation { .. } => "reconciliation",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::InvalidChunkSize => "invalid_chunk_size",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
