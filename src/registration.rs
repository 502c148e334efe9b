//! Plugin registration with the node agent.
//!
//! Once the socket is listening a small JSON file announces the driver name
//! and the socket endpoint in the registration directory. The file is removed
//! on shutdown so the node agent stops routing claims to a dead socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const SUPPORTED_VERSIONS: [&str; 1] = ["v1"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub endpoint: String,
    pub supported_versions: Vec<String>,
}

pub struct Registrar {
    path: PathBuf,
    registration: Registration,
}

impl Registrar {
    pub fn new(registration_dir: impl AsRef<Path>, driver_name: &str, endpoint: &str) -> Self {
        Self {
            path: registration_dir
                .as_ref()
                .join(format!("{driver_name}-reg.json")),
            registration: Registration {
                name: driver_name.to_string(),
                endpoint: endpoint.to_string(),
                supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn register(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create registration directory")?;
        }
        let serialized = serde_json::to_string_pretty(&self.registration)
            .context("failed to serialize registration")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        info!(path = %self.path.display(), endpoint = %self.registration.endpoint, "registered plugin");
        Ok(())
    }

    pub async fn deregister(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!(path = %self.path.display(), "removed plugin registration"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove plugin registration"),
        }
    }
}
