//! Persistence for the per-node AllocationState.
//!
//! The state is one object per node, addressed by node name, and is only ever
//! replaced through a compare-and-swap on its [`ResourceVersion`]. Backends
//! implement [`StateBackend`]; [`StateStore`] binds a backend to a node and
//! bounds every call with a timeout.

pub mod driver;
pub mod file;
pub mod in_memory;
pub mod prepared_claims;
pub mod serializer;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::{AllocationState, ResourceVersion, Versioned};
pub use driver::Error;
use tracing::debug;

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Reads the current state. A node that was never written reads as an
    /// empty state at [`ResourceVersion::initial`].
    async fn read(&self, node: &str) -> Result<Versioned<AllocationState>, Error>;

    /// Replaces the state if the stored version still equals `expected`, and
    /// returns the new version. Fails with [`Error::MismatchedVersion`]
    /// otherwise, leaving the stored state untouched.
    async fn write_if_version_matches(
        &self,
        node: &str,
        expected: ResourceVersion,
        state: &AllocationState,
    ) -> Result<ResourceVersion, Error>;
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    node: String,
    io_timeout: Duration,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>, node: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            backend,
            node: node.into(),
            io_timeout,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn read(&self) -> Result<Versioned<AllocationState>, Error> {
        let state = tokio::time::timeout(self.io_timeout, self.backend.read(&self.node))
            .await
            .map_err(|_| Error::Timeout {
                operation: "read",
                timeout: self.io_timeout,
            })??;
        debug!(node = %self.node, version = %state.version, "read allocation state");
        Ok(state)
    }

    pub async fn write(
        &self,
        expected: ResourceVersion,
        state: &AllocationState,
    ) -> Result<ResourceVersion, Error> {
        let version = tokio::time::timeout(
            self.io_timeout,
            self.backend
                .write_if_version_matches(&self.node, expected, state),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "write",
            timeout: self.io_timeout,
        })??;
        debug!(node = %self.node, version = %version, "wrote allocation state");
        Ok(version)
    }
}
