//! Crate-wide error taxonomy.
//!
//! Module-local errors ([`CryptoError`](crate::crypto::CryptoError),
//! [`DeltaError`](crate::delta::DeltaError)) convert into [`Error`] via
//! `#[from]`, so `?` works across component boundaries.  The recovery engine
//! catches per-target errors, logs them, and counts them; everything else
//! propagates.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Computed digest does not equal the expected digest.
    #[error("Authentication failure: expected {expected}, got {actual}")]
    AuthFailure { expected: String, actual: String },

    #[error("Path, digest, or snapshot not found: {0}")]
    NotFound(String),

    /// Underlying storage failed.  The digest (or path) is attached where known.
    #[error("I/O error on {subject}: {source}")]
    Io {
        subject: String,
        #[source]
        source: io::Error,
    },

    #[error("Remote catalog error: {0}")]
    Remote(String),

    #[error("Catalog schema version {found} does not match {want}")]
    Schema { found: u32, want: u32 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// User interrupt; unwinds cleanly and exits nonzero.
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Delta(#[from] crate::delta::DeltaError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error(transparent)]
    PlainIo(#[from] io::Error),
}

impl Error {
    /// Attach a digest or path to a bare I/O error.
    pub fn io(subject: impl Into<String>, source: io::Error) -> Self {
        Error::Io { subject: subject.into(), source }
    }

    /// Classify a read error from a regenerated stream: decrypt failures
    /// travel through `io::Error` and must surface as crypto errors.
    pub fn from_read(subject: impl Into<String>, source: io::Error) -> Self {
        match crate::crypto::CryptoError::from_io(&source) {
            Some(c) => Error::Crypto(c.clone()),
            None => Error::io(subject, source),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
