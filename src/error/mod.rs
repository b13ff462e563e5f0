//! Error types for spawn manifest extraction

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
/// Error type for errors during manifest extraction
pub enum Error {
    #[error("An I/O error occurred on {path:?}: {kind}")]
    /// A file could not be read
    Io {
        /// The path that failed
        path: PathBuf,
        /// The kind of I/O failure
        kind: std::io::ErrorKind,
    },
    #[error("{path:?} is too small to be a PE32 image ({size} bytes)")]
    /// The image file is smaller than the minimum header size
    ImageTooSmall {
        /// The path of the image
        path: PathBuf,
        /// The observed file size
        size: usize,
    },
    #[error("{path:?} is missing the MZ signature")]
    /// The image file does not start with the DOS signature
    MissingDosSignature {
        /// The path of the image
        path: PathBuf,
    },
    #[error("{path:?} is missing the PE signature at offset {offset:#x}")]
    /// The image file has no PE signature where `e_lfanew` points
    MissingPeSignature {
        /// The path of the image
        path: PathBuf,
        /// The `e_lfanew` value that was followed
        offset: u32,
    },
    #[error("{path:?} ends inside its headers")]
    /// The optional header or section table runs off the end of the file
    TruncatedHeaders {
        /// The path of the image
        path: PathBuf,
    },
    #[error("{path:?} declares no sections")]
    /// The section table is empty
    EmptySectionTable {
        /// The path of the image
        path: PathBuf,
    },
    #[error("The spawn registration source {path:?} is missing")]
    /// The repo root does not contain the expected game sources
    MissingGameSource {
        /// The source file that could not be found
        path: PathBuf,
    },
}

impl Error {
    /// Builds an [`Error::Io`] from a path and the underlying I/O error.
    pub fn io(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            kind: error.kind(),
        }
    }
}

/// Result type for manifest extraction
pub type Result<T> = std::result::Result<T, Error>;
