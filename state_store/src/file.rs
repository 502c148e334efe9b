//! AllocationState stored as one JSON file per node under a state directory.
//!
//! Writes go to a temporary sibling and are renamed into place, so a crash
//! never leaves a half-written record behind. Compare-and-swap is serialized
//! by an in-process lock; the directory is owned by a single agent per node.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use data_model::{AllocationState, ResourceVersion, Versioned};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    driver::Error,
    serializer::{JsonEncode, JsonEncoder},
    StateBackend,
};

pub struct JsonFileBackend {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileBackend {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;
        info!(path = %dir.display(), "using file allocation state backend");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, node: &str) -> PathBuf {
        let file_name: String = node
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("allocation-state-{file_name}.json"))
    }

    async fn load(&self, path: &Path) -> Result<Versioned<AllocationState>, Error> {
        match tokio::fs::read(path).await {
            Ok(bytes) => JsonEncoder::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Versioned::new(
                ResourceVersion::initial(),
                AllocationState::default(),
            )),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

#[async_trait]
impl StateBackend for JsonFileBackend {
    async fn read(&self, node: &str) -> Result<Versioned<AllocationState>, Error> {
        self.load(&self.path_for(node)).await
    }

    async fn write_if_version_matches(
        &self,
        node: &str,
        expected: ResourceVersion,
        state: &AllocationState,
    ) -> Result<ResourceVersion, Error> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(node);

        let found = self.load(&path).await?.version;
        if found != expected {
            return Err(Error::MismatchedVersion {
                node: node.to_string(),
                expected,
                found,
            });
        }

        let next = found.next();
        let bytes = JsonEncoder::encode(&Versioned::new(next, state))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::io(&path, e))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_gpu, state_with, FLEX140};
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_file_backend_persists_across_instances() {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path()).await.unwrap();
        let mut state = state_with(vec![mock_gpu("0000:03:00.0", FLEX140, 0)]);
        state.taint("0000-03-00-0-0x56c1", "ecc-errors");

        let v1 = backend
            .write_if_version_matches("node-1", ResourceVersion::initial(), &state)
            .await
            .unwrap();
        assert!(backend.path_for("node-1").exists());

        let reopened = JsonFileBackend::new(dir.path()).await.unwrap();
        let loaded = reopened.read("node-1").await.unwrap();
        assert_eq!(loaded.version, v1);
        assert_eq!(loaded.value, state);
    }

    #[tokio::test]
    async fn test_file_backend_rejects_stale_version() {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path()).await.unwrap();
        let state = AllocationState::default();
        backend
            .write_if_version_matches("node-1", ResourceVersion::initial(), &state)
            .await
            .unwrap();

        let err = backend
            .write_if_version_matches("node-1", ResourceVersion::initial(), &state)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_permanent_error() {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path()).await.unwrap();
        tokio::fs::write(backend.path_for("node-1"), b"{not json")
            .await
            .unwrap();
        let err = backend.read("node-1").await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_node_names_are_sanitized() {
        let backend = JsonFileBackend {
            dir: PathBuf::from("/state"),
            write_lock: Mutex::new(()),
        };
        assert_eq!(
            backend.path_for("node/1"),
            PathBuf::from("/state/allocation-state-node_1.json")
        );
    }
}
