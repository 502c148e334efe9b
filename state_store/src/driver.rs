//! Errors shared by every allocation state backend.

use std::time::Duration;

use data_model::ResourceVersion;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(
        "allocation state of node {node} was modified concurrently, expected version {expected}, found {found}"
    )]
    MismatchedVersion {
        node: String,
        expected: ResourceVersion,
        found: ResourceVersion,
    },

    #[error("failed to decode a stored record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("failed to encode a record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error("state store i/o on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state store {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl Error {
    /// Only version mismatches can be retried: re-reading the state and
    /// recomputing the decision may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(&self, Self::MismatchedVersion { .. })
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
