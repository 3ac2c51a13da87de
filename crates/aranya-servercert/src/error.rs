//! Errors returned while resolving a signer, issuing, or writing certificates.

use std::path::Path;

use thiserror::Error;

/// Errors that can occur while creating a server certificate.
#[derive(Error, Debug)]
pub enum ServerCertError {
    /// The request was rejected before any file was touched.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The signer certificate or key file does not exist.
    #[error("Signer material not found: '{path}'")]
    SignerNotFound {
        /// The missing file.
        path: String,
    },

    /// The signer certificate, key or serial counter could not be used.
    #[error("Invalid signer material '{path}': {reason}")]
    InvalidSignerMaterial {
        /// The offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The serial counter cannot be advanced any further.
    #[error("Serial counter '{path}' is exhausted")]
    SerialExhausted {
        /// Path to the counter file.
        path: String,
    },

    /// Key generation or certificate signing failed.
    #[error("Failed to sign certificate: {0}")]
    SigningFailed(#[from] rcgen::Error),

    /// Writing a certificate, key or counter file failed.
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        /// The file being written.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl ServerCertError {
    /// Creates a [`ServerCertError::SignerNotFound`] for `path`.
    pub fn signer_not_found(path: impl AsRef<Path>) -> Self {
        Self::SignerNotFound {
            path: path.as_ref().display().to_string(),
        }
    }

    /// Creates a [`ServerCertError::InvalidSignerMaterial`] for `path`.
    pub fn invalid_signer(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::InvalidSignerMaterial {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Creates a [`ServerCertError::SerialExhausted`] for `path`.
    pub fn serial_exhausted(path: impl AsRef<Path>) -> Self {
        Self::SerialExhausted {
            path: path.as_ref().display().to_string(),
        }
    }

    /// Creates a [`ServerCertError::WriteFailed`] for `path`.
    pub fn write_failed(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::WriteFailed {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Reports whether running the same operation again could succeed.
    ///
    /// Only I/O failures while writing are transient; everything else
    /// reproduces with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteFailed { .. })
    }
}

/// A request that was rejected up front.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No hostnames were given.
    #[error("at least one hostname must be provided")]
    EmptyHostnameSet,

    /// A hostname is neither a valid DNS name nor an IP literal.
    #[error("invalid hostname '{hostname}': {reason}")]
    InvalidHostname {
        /// The hostname as given.
        hostname: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The validity period is not a positive number of days.
    #[error("expire-days must be a positive number of days, got {0}")]
    InvalidExpireDays(i64),

    /// A required option is empty.
    #[error("{0} must be provided")]
    MissingOption(&'static str),
}

impl ValidationError {
    pub(crate) fn invalid_hostname(hostname: &str, reason: &'static str) -> Self {
        Self::InvalidHostname {
            hostname: hostname.to_string(),
            reason,
        }
    }
}
