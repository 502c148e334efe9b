//! Node-local record of prepared claims.
//!
//! After a successful prepare the granted devices are written here, keyed by
//! claim id. A repeated prepare for the same claim returns the recorded
//! devices instead of allocating again, and unprepare drops the record.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use data_model::PreparedDevice;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedClaim {
    pub claim_id: String,
    pub devices: Vec<PreparedDevice>,
    /// Epoch milliseconds.
    pub prepared_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PreparedClaimsContents {
    claims: BTreeMap<String, PreparedClaim>,
}

pub struct PreparedClaimsFile {
    path: PathBuf,
    state: Mutex<PreparedClaimsContents>,
}

impl PreparedClaimsFile {
    /// Loads the file if present. A missing file starts empty; an unreadable
    /// one is reported rather than silently discarded, since losing it would
    /// forget which claims own devices.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let contents: PreparedClaimsContents = serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                info!(
                    path = %path.display(),
                    claims = contents.claims.len(),
                    "loaded prepared claims"
                );
                contents
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "prepared claims file does not exist, starting fresh");
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create prepared claims directory")?;
                }
                PreparedClaimsContents::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn save(&self, contents: &PreparedClaimsContents) -> Result<()> {
        let serialized =
            serde_json::to_string_pretty(contents).context("failed to serialize prepared claims")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized)
            .await
            .context("failed to write prepared claims file")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("failed to replace prepared claims file")?;
        Ok(())
    }

    pub async fn get(&self, claim_id: &str) -> Option<PreparedClaim> {
        self.state.lock().await.claims.get(claim_id).cloned()
    }

    pub async fn upsert(&self, claim: PreparedClaim) -> Result<()> {
        let mut state = self.state.lock().await;
        state.claims.insert(claim.claim_id.clone(), claim);
        self.save(&state).await
    }

    /// Returns the removed record, if any. Removing an unknown claim does not
    /// touch the file.
    pub async fn remove(&self, claim_id: &str) -> Result<Option<PreparedClaim>> {
        let mut state = self.state.lock().await;
        let removed = state.claims.remove(claim_id);
        if removed.is_some() {
            if let Err(e) = self.save(&state).await {
                warn!(claim_id, error = %e, "failed to persist claim removal");
                return Err(e);
            }
        }
        Ok(removed)
    }

    pub async fn get_all(&self) -> Vec<PreparedClaim> {
        self.state.lock().await.claims.values().cloned().collect()
    }
}
