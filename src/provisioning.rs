//! Creates and removes GPU virtual functions through sysfs.
//!
//! SR-IOV is configured once per GPU: all VFs come up together when their
//! count is written to `sriov_numvfs`, and can only be changed by removing
//! every VF again. When the kernel's fair split does not produce the wanted
//! sizes, each VF is given explicit quotas under the parent's `prelim_iov`
//! directory before the count is written.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use accel_utils::retry::{Backoff, RetryError, RetryPolicy};
use async_trait::async_trait;
use data_model::{AllocatedDevice, DeviceDescriptor};
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::{
    discovery::{
        gpu::{node_index, CARD_NODE, DRM_CLASS_DIR, GPU_DRIVERS},
        PCI_DRIVERS_DIR,
    },
    vf_sizing::{ProfileCatalog, VfProfile},
};

const MIB: u64 = 1024 * 1024;
const SETTLE_ATTEMPTS: u32 = 10;
const SETTLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("sysfs i/o on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("GPU {0} is not bound to a supported driver")]
    NoDriver(String),

    #[error("GPU {0} has no DRM card node")]
    NoCard(String),

    #[error("no tiles found under {0}")]
    NoTiles(String),

    #[error("unknown VF profile {0}")]
    UnknownProfile(String),

    #[error("planned VFs of {parent} do not form a contiguous set of indexes")]
    BadLayout { parent: String },

    #[error("VF {index} of {parent} did not come up")]
    NotReady { parent: String, index: u64 },

    #[error("VFs of {parent} are still present")]
    StillPresent { parent: String },

    #[error("kernel rejected VF setup on {parent}: {reason}")]
    Rejected { parent: String, reason: String },
}

impl ProvisionError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ProvisionError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn is_settling(&self) -> bool {
        matches!(
            self,
            ProvisionError::NotReady { .. } | ProvisionError::StillPresent { .. }
        )
    }
}

/// The full set of VFs to enable on one GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfLayout {
    pub parent: DeviceDescriptor,
    /// Profile of every VF, by VF index.
    pub profiles: Vec<String>,
    /// The kernel's own even split yields these VFs, no quotas are written.
    pub fair_share: bool,
}

impl VfLayout {
    /// Lays out the VFs planned on `parent`. When they all share one profile
    /// the GPU is filled with VFs of that profile, so what the claims leave
    /// over stays usable for later claims.
    pub fn plan(
        catalog: &ProfileCatalog,
        parent: &DeviceDescriptor,
        planned: &[&AllocatedDevice],
    ) -> Result<Self, ProvisionError> {
        let bad_layout = || ProvisionError::BadLayout {
            parent: parent.uid.clone(),
        };
        let by_index: Vec<&AllocatedDevice> = planned
            .iter()
            .copied()
            .sorted_by_key(|d| d.planned_vf_index)
            .collect();
        let contiguous = by_index
            .iter()
            .enumerate()
            .all(|(i, d)| d.planned_vf_index == Some(i as u64));
        if by_index.is_empty() || !contiguous {
            return Err(bad_layout());
        }

        let profiles = by_index
            .iter()
            .map(|d| d.profile.clone().ok_or_else(bad_layout))
            .collect::<Result<Vec<String>, _>>()?;

        if profiles.iter().all_equal() {
            let name = &profiles[0];
            let profile = catalog
                .profile(name)
                .ok_or_else(|| ProvisionError::UnknownProfile(name.clone()))?;
            if profile.num_vfs <= parent.max_virtual_functions && profile.num_vfs >= profiles.len() as u64 {
                let memories: Vec<u64> = by_index.iter().map(|d| d.memory_mib).collect();
                let fair_share = catalog.max_fair_vfs(&parent.model, &memories).ok() == Some(profile.num_vfs);
                return Ok(Self {
                    parent: parent.clone(),
                    profiles: vec![name.clone(); profile.num_vfs as usize],
                    fair_share,
                });
            }
        }

        Ok(Self {
            parent: parent.clone(),
            profiles,
            fair_share: false,
        })
    }

    pub fn num_vfs(&self) -> u64 {
        self.profiles.len() as u64
    }
}

#[async_trait]
pub trait VfProvisioner: Send + Sync {
    /// Enables the VFs of `layout` and waits until each has a card node.
    /// On failure no VF is left behind.
    async fn create(&self, layout: &VfLayout) -> Result<(), ProvisionError>;

    /// Disables every VF of `parent` and drops any manual quotas.
    async fn remove_all(&self, parent: &DeviceDescriptor) -> Result<(), ProvisionError>;
}

/// Talks to the kernel through a sysfs tree rooted at `root`.
pub struct SysfsProvisioner {
    root: PathBuf,
    catalog: Arc<ProfileCatalog>,
    settle: RetryPolicy,
}

impl SysfsProvisioner {
    pub fn new(root: impl Into<PathBuf>, catalog: Arc<ProfileCatalog>) -> Self {
        Self {
            root: root.into(),
            catalog,
            settle: RetryPolicy::new(SETTLE_ATTEMPTS - 1, Backoff::Fixed(SETTLE_INTERVAL)),
        }
    }

    /// How long to wait for VFs to appear or go away.
    pub fn with_settle_policy(mut self, settle: RetryPolicy) -> Self {
        self.settle = settle;
        self
    }

    async fn function_dir(&self, address: &str) -> Result<PathBuf, ProvisionError> {
        for driver in GPU_DRIVERS {
            let dir = self.root.join(PCI_DRIVERS_DIR).join(driver).join(address);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                return Ok(dir);
            }
        }
        Err(ProvisionError::NoDriver(address.to_string()))
    }

    fn iov_dir(&self, parent: &DeviceDescriptor) -> Result<PathBuf, ProvisionError> {
        let card = parent
            .card_index
            .ok_or_else(|| ProvisionError::NoCard(parent.uid.clone()))?;
        Ok(self
            .root
            .join(DRM_CLASS_DIR)
            .join(format!("card{card}"))
            .join("prelim_iov"))
    }

    async fn write_quotas(&self, layout: &VfLayout) -> Result<(), ProvisionError> {
        let iov_dir = self.iov_dir(&layout.parent)?;
        for (index, name) in layout.profiles.iter().enumerate() {
            let profile = self
                .catalog
                .profile(name)
                .ok_or_else(|| ProvisionError::UnknownProfile(name.clone()))?;
            // prelim_iov numbers VFs from 1.
            let vf_dir = iov_dir.join(format!("vf{}", index + 1));
            let tiles = tile_dirs(&vf_dir).await?;
            let split = tiles.len() as u64;
            for (attribute, value) in quota_attributes(profile, layout.parent.ecc_enabled, split) {
                for tile in &tiles {
                    write_attribute(&tile.join(attribute), value).await?;
                }
            }
            debug!(parent = %layout.parent.uid, vf = index, profile = %name, "VF quotas written");
        }
        Ok(())
    }

    async fn wait_for_vfs(&self, parent: &DeviceDescriptor, function_dir: &Path, num_vfs: u64) -> Result<(), ProvisionError> {
        self.settle
            .run(
                "wait for VFs",
                |_attempt| async move {
                    for index in 0..num_vfs {
                        let drm = function_dir.join(format!("virtfn{index}")).join("drm");
                        if !has_card_node(&drm).await {
                            return Err(ProvisionError::NotReady {
                                parent: parent.uid.clone(),
                                index,
                            });
                        }
                    }
                    Ok(())
                },
                ProvisionError::is_settling,
            )
            .await
            .map_err(RetryError::into_inner)
    }

    async fn wait_until_no_vfs(&self, parent: &DeviceDescriptor, function_dir: &Path) -> Result<(), ProvisionError> {
        self.settle
            .run(
                "wait for VFs to go away",
                |_attempt| async move {
                    if virtfn_links(function_dir).await?.is_empty() {
                        Ok(())
                    } else {
                        Err(ProvisionError::StillPresent {
                            parent: parent.uid.clone(),
                        })
                    }
                },
                ProvisionError::is_settling,
            )
            .await
            .map_err(RetryError::into_inner)
    }

    /// Zeroes manual quotas and hands VF sizing back to the kernel. Nothing
    /// to do while auto provisioning is still on.
    async fn reset_quotas(&self, parent: &DeviceDescriptor) -> Result<(), ProvisionError> {
        let iov_dir = self.iov_dir(parent)?;
        let auto_file = iov_dir.join("pf").join("auto_provisioning");
        match tokio::fs::read_to_string(&auto_file).await {
            Ok(value) if value.trim() == "1" => return Ok(()),
            Ok(_) => {}
            Err(e) => warn!(path = %auto_file.display(), error = %e, "cannot read auto provisioning flag"),
        }

        let mut entries = match tokio::fs::read_dir(&iov_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ProvisionError::io(&iov_dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProvisionError::io(&iov_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("vf") {
                continue;
            }
            for tile in tile_dirs(&entry.path()).await? {
                for attribute in VF_ATTRIBUTES {
                    let path = tile.join(attribute);
                    match tokio::fs::write(&path, "0").await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(ProvisionError::io(&path, e)),
                    }
                }
            }
        }
        tokio::fs::write(&auto_file, "1")
            .await
            .map_err(|e| ProvisionError::io(&auto_file, e))?;
        debug!(parent = %parent.uid, "manual VF quotas removed");
        Ok(())
    }
}

#[async_trait]
impl VfProvisioner for SysfsProvisioner {
    async fn create(&self, layout: &VfLayout) -> Result<(), ProvisionError> {
        let parent = &layout.parent;
        let function_dir = self.function_dir(&parent.bus_address).await?;

        if !layout.fair_share {
            if let Err(e) = self.write_quotas(layout).await {
                if let Err(cleanup) = self.reset_quotas(parent).await {
                    warn!(parent = %parent.uid, error = %cleanup, "failed to undo VF quotas");
                }
                return Err(e);
            }
        }

        let num_vfs_file = function_dir.join("sriov_numvfs");
        write_attribute(&num_vfs_file, layout.num_vfs()).await?;

        if let Err(e) = self.wait_for_vfs(parent, &function_dir, layout.num_vfs()).await {
            warn!(parent = %parent.uid, error = %e, "VFs did not come up, removing them");
            if let Err(cleanup) = self.remove_all(parent).await {
                warn!(parent = %parent.uid, error = %cleanup, "failed to remove VFs");
            }
            return Err(e);
        }

        info!(
            parent = %parent.uid,
            num_vfs = layout.num_vfs(),
            fair_share = layout.fair_share,
            "VFs created"
        );
        Ok(())
    }

    async fn remove_all(&self, parent: &DeviceDescriptor) -> Result<(), ProvisionError> {
        let function_dir = self.function_dir(&parent.bus_address).await?;
        write_attribute(&function_dir.join("sriov_numvfs"), 0).await?;
        self.wait_until_no_vfs(parent, &function_dir).await?;
        self.reset_quotas(parent).await?;
        info!(parent = %parent.uid, "VFs removed");
        Ok(())
    }
}

const VF_ATTRIBUTES: [&str; 6] = [
    "contexts_quota",
    "doorbells_quota",
    "exec_quantum_ms",
    "ggtt_quota",
    "lmem_quota",
    "preempt_timeout_us",
];

/// Values written for one VF on each of `tiles` tiles. Doorbells, GGTT and
/// local memory are shared out between the tiles.
fn quota_attributes(profile: &VfProfile, ecc_enabled: bool, tiles: u64) -> [(&'static str, u64); 6] {
    let tiles = tiles.max(1);
    [
        ("contexts_quota", profile.contexts_quota),
        ("doorbells_quota", profile.doorbells_quota / tiles),
        ("exec_quantum_ms", profile.exec_quantum_ms),
        ("ggtt_quota", profile.ggtt_quota / tiles),
        ("lmem_quota", profile.quota_mib(ecc_enabled) * MIB / tiles),
        ("preempt_timeout_us", profile.preempt_timeout_us),
    ]
}

async fn write_attribute(path: &Path, value: u64) -> Result<(), ProvisionError> {
    tokio::fs::write(path, value.to_string())
        .await
        .map_err(|e| ProvisionError::io(path, e))
}

/// `gt*` directories of one VF, sorted.
async fn tile_dirs(vf_dir: &Path) -> Result<Vec<PathBuf>, ProvisionError> {
    let no_tiles = || ProvisionError::NoTiles(vf_dir.display().to_string());
    let mut entries = tokio::fs::read_dir(vf_dir).await.map_err(|_| no_tiles())?;
    let mut tiles = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ProvisionError::io(vf_dir, e))?
    {
        if entry.file_name().to_string_lossy().starts_with("gt") {
            tiles.push(entry.path());
        }
    }
    if tiles.is_empty() {
        return Err(no_tiles());
    }
    tiles.sort();
    Ok(tiles)
}

async fn has_card_node(drm_dir: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(drm_dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if node_index(&CARD_NODE, &entry.file_name().to_string_lossy()).is_some() {
            return true;
        }
    }
    false
}

async fn virtfn_links(function_dir: &Path) -> Result<Vec<String>, ProvisionError> {
    let mut entries = tokio::fs::read_dir(function_dir)
        .await
        .map_err(|e| ProvisionError::io(function_dir, e))?;
    let mut links = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ProvisionError::io(function_dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("virtfn") {
            links.push(name);
        }
    }
    Ok(links)
}
