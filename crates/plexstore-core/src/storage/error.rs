use std::io;

use snafu::{Backtrace, prelude::*};

/// Filesystem failures of store access, tagged with the operation and path.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// A store file that was asked for does not exist.
    #[snafu(display("Missing store file: {path}"))]
    NotFound {
        /// Absolute path of the missing file.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Reading a store file or listing a store directory failed.
    #[snafu(display("Cannot read {path}: {source}"))]
    Read {
        /// Absolute path being read.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Writing a store file failed.
    #[snafu(display("Cannot write {path}: {source}"))]
    Write {
        /// Absolute path being written.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The staging directory could not be cleared or created.
    #[snafu(display("Cannot prepare staging directory {path}: {source}"))]
    Stage {
        /// Staging directory path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The staged store could not replace the output path.
    #[snafu(display("Cannot publish store to {path}: {source}"))]
    Publish {
        /// Output path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The output path cannot host a staging directory next to it.
    #[snafu(display("Output path has no parent directory or file name: {path}"))]
    InvalidOutputPath {
        /// The rejected output path.
        path: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Whether the error reports a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
