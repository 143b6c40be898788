// ABOUTME: Error type shared by every store operation: open/validation, range lookup,
// ABOUTME: tailing, decoding and the transactional write path.

use std::path::PathBuf;

use aedb_core::{ChannelId, CodecError, TimeTick, WaveError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while opening, reading or writing a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store already exists and is not empty: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("schema mismatch in {}: {reason}", path.display())]
    SchemaMismatch { path: PathBuf, reason: String },

    #[error("unsupported schema version {found:?} in {}, supported: {supported}", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: Option<String>,
        supported: i64,
    },

    #[error("{table}: no row with {key}")]
    NotFound { table: String, key: String },

    #[error("{table}: no rows between {start:?} and {stop:?} (ticks)")]
    EmptyRange {
        table: String,
        start: Option<TimeTick>,
        stop: Option<TimeTick>,
    },

    #[error("{table}: time {time} goes back from {previous} at key {key}")]
    NotMonotonic {
        table: String,
        key: i64,
        previous: TimeTick,
        time: TimeTick,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{table}: cannot decode row {key}: {source}")]
    Codec {
        table: String,
        key: i64,
        #[source]
        source: CodecError,
    },

    #[error("channel {channel}: {source}")]
    Wave {
        channel: ChannelId,
        #[source]
        source: WaveError,
    },

    #[error("write to {table} failed: {source}")]
    WriteFailed {
        table: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("store opened read-only: {}", path.display())]
    ReadOnly { path: PathBuf },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StoreError {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }

    pub(crate) fn not_found(table: &str, key: impl std::fmt::Display) -> StoreError {
        StoreError::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    /// Unwraps `WriteFailed` to the underlying cause.
    pub fn root_cause(&self) -> &StoreError {
        match self {
            StoreError::WriteFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
