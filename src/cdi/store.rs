//! Where CDI spec files live.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::spec::CdiSpec;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry i/o on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {path} is not a valid spec: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode spec {file}: {source}")]
    Encode {
        file: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        RegistryError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Spec files holding devices of `kind`, ordered by file name.
    async fn list(&self, kind: &str) -> Result<Vec<(String, CdiSpec)>, RegistryError>;

    /// Creates or replaces one spec file.
    async fn write(&self, file_name: &str, spec: &CdiSpec) -> Result<(), RegistryError>;
}

/// File name for a new spec of `kind`: `intel.com/gpu` becomes
/// `intel.com-gpu.json`.
pub fn default_file_name(kind: &str) -> String {
    format!("{}.json", kind.replace('/', "-"))
}

#[derive(Deserialize)]
struct SpecHeader {
    #[serde(default)]
    kind: String,
}

/// Spec files in a directory, e.g. `/etc/cdi`. Only `.json` files are read.
pub struct JsonDirRegistry {
    root: PathBuf,
}

impl JsonDirRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RegistryStore for JsonDirRegistry {
    async fn list(&self, kind: &str) -> Result<Vec<(String, CdiSpec)>, RegistryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.root.display(), "registry directory does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(RegistryError::io(&self.root, e)),
        };

        let mut specs = BTreeMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RegistryError::io(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| RegistryError::io(&path, e))?;
            // Other vendors share the directory. Their files are only read
            // far enough to see the kind.
            let header: SpecHeader = match serde_json::from_slice(&bytes) {
                Ok(header) => header,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable registry file");
                    continue;
                }
            };
            if header.kind != kind {
                continue;
            }
            let spec: CdiSpec =
                serde_json::from_slice(&bytes).map_err(|source| RegistryError::Decode {
                    path: path.display().to_string(),
                    source,
                })?;
            specs.insert(entry.file_name().to_string_lossy().into_owned(), spec);
        }
        Ok(specs.into_iter().collect())
    }

    async fn write(&self, file_name: &str, spec: &CdiSpec) -> Result<(), RegistryError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RegistryError::io(&self.root, e))?;
        let bytes = serde_json::to_vec_pretty(spec).map_err(|source| RegistryError::Encode {
            file: file_name.to_string(),
            source,
        })?;
        let path = self.root.join(file_name);
        let tmp = self.root.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| RegistryError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RegistryError::io(&path, e))?;
        info!(path = %path.display(), devices = spec.devices.len(), "wrote CDI spec");
        Ok(())
    }
}

/// Specs kept in memory. Counts writes and can be told to fail writes to
/// chosen files.
#[derive(Default)]
pub struct InMemoryRegistry {
    files: DashMap<String, CdiSpec>,
    writes: AtomicU64,
    failing: DashMap<String, ()>,
}

impl InMemoryRegistry {
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn insert(&self, file_name: &str, spec: CdiSpec) {
        self.files.insert(file_name.to_string(), spec);
    }

    pub fn get(&self, file_name: &str) -> Option<CdiSpec> {
        self.files.get(file_name).map(|s| s.value().clone())
    }

    pub fn file_names(&self) -> BTreeSet<String> {
        self.files.iter().map(|e| e.key().clone()).collect()
    }

    pub fn fail_writes_to(&self, file_name: &str) {
        self.failing.insert(file_name.to_string(), ());
    }

    pub fn heal(&self) {
        self.failing.clear();
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
    async fn list(&self, kind: &str) -> Result<Vec<(String, CdiSpec)>, RegistryError> {
        let specs: BTreeMap<String, CdiSpec> = self
            .files
            .iter()
            .filter(|e| e.value().kind == kind)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Ok(specs.into_iter().collect())
    }

    async fn write(&self, file_name: &str, spec: &CdiSpec) -> Result<(), RegistryError> {
        if self.failing.contains_key(file_name) {
            return Err(RegistryError::Io {
                path: file_name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only file"),
            });
        }
        self.files.insert(file_name.to_string(), spec.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_dir_registry_filters_by_kind() {
        let dir = tempdir().unwrap();
        let registry = JsonDirRegistry::new(dir.path().join("cdi"));
        assert!(registry.list("intel.com/gpu").await.unwrap().is_empty());

        registry
            .write("intel.com-gpu.json", &CdiSpec::new("intel.com/gpu", vec![]))
            .await
            .unwrap();
        registry
            .write("intel.com-qat.json", &CdiSpec::new("intel.com/qat", vec![]))
            .await
            .unwrap();
        std::fs::write(dir.path().join("cdi/notes.txt"), "not a spec").unwrap();

        let gpu = registry.list("intel.com/gpu").await.unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].0, "intel.com-gpu.json");
        assert_eq!(gpu[0].1.cdi_version, "0.6.0");
    }

    #[tokio::test]
    async fn test_dir_registry_skips_foreign_unreadable_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("vendor-other.json"), "{ not json").unwrap();
        std::fs::write(
            dir.path().join("vendor-odd.json"),
            r#"{"cdiVersion": "0.5.0", "kind": "vendor.com/odd", "devices": 7}"#,
        )
        .unwrap();
        let registry = JsonDirRegistry::new(dir.path());
        registry
            .write("intel.com-gpu.json", &CdiSpec::new("intel.com/gpu", vec![]))
            .await
            .unwrap();

        let gpu = registry.list("intel.com/gpu").await.unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].0, "intel.com-gpu.json");
    }

    #[tokio::test]
    async fn test_dir_registry_reports_corrupt_own_files() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("intel.com-gpu.json"),
            r#"{"cdiVersion": "0.6.0", "kind": "intel.com/gpu", "devices": 7}"#,
        )
        .unwrap();
        let registry = JsonDirRegistry::new(dir.path());
        assert!(matches!(
            registry.list("intel.com/gpu").await,
            Err(RegistryError::Decode { .. })
        ));
        assert!(registry.list("intel.com/qat").await.unwrap().is_empty());
    }

    #[test]
    fn test_default_file_name() {
        assert_eq!(default_file_name("intel.com/gaudi"), "intel.com-gaudi.json");
    }
}
