//! A device tree on disk for exercising discovery end to end.

use std::{
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use data_model::{
    templates::DeviceTemplate,
    uid::address_from_uid,
    DeviceDescriptor,
    DeviceFamily,
    DeviceKind,
};
use tempfile::TempDir;

use crate::{
    discovery::{
        gaudi::GAUDI_DRIVER,
        gpu::{DRM_CLASS_DIR, GPU_DRIVERS},
        qat::{PCI_DEVICES_DIR, QAT_DRIVER},
        sysfs::FsSysfs,
        PCI_DRIVERS_DIR,
    },
    provisioning::{ProvisionError, VfLayout, VfProvisioner},
    vf_sizing::ProfileCatalog,
};

const MIB: u64 = 1024 * 1024;

/// Lays out the parts of a sysfs tree that discovery reads, in a temporary
/// directory that is removed on drop.
pub struct FakeSysfs {
    dir: TempDir,
}

impl FakeSysfs {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("failed to create fake sysfs root")?,
        })
    }

    /// Builds a tree holding every device of a template.
    pub fn from_template(template: &DeviceTemplate) -> Result<Self> {
        let sysfs = Self::new()?;
        // Parents first so VFs can link to them.
        let mut devices: Vec<_> = template.slots.values().collect();
        devices.sort_by_key(|d| d.kind == DeviceKind::VirtualFunction);

        for (position, device) in devices.into_iter().enumerate() {
            let position = position as u64;
            match (device.family, device.kind) {
                (DeviceFamily::Gpu, DeviceKind::Physical) => sysfs.add_gpu(
                    &device.bus_address,
                    &device.model,
                    device.card_index.unwrap_or(position),
                    device.memory_mib,
                    device.max_virtual_functions,
                )?,
                (DeviceFamily::Gpu, DeviceKind::VirtualFunction) => {
                    let parent = parent_address(device.parent_uid.as_deref())?;
                    sysfs.add_gpu_vf(
                        &parent,
                        &device.bus_address,
                        &device.model,
                        device.virtual_function_index,
                        device.card_index.unwrap_or(position),
                        device.memory_mib,
                    )?
                }
                (DeviceFamily::Gaudi, _) => sysfs.add_gaudi(
                    &device.bus_address,
                    &device.model,
                    device.accel_index.unwrap_or(position),
                )?,
                (DeviceFamily::Qat, DeviceKind::Physical) => {
                    sysfs.add_qat_pf(&device.bus_address, &device.model, device.max_virtual_functions)?
                }
                (DeviceFamily::Qat, DeviceKind::VirtualFunction) => {
                    let parent = parent_address(device.parent_uid.as_deref())?;
                    sysfs.add_qat_vf(
                        &parent,
                        &device.bus_address,
                        &device.model,
                        device.virtual_function_index,
                        device.iommu_group.unwrap_or(position),
                    )?
                }
                (family, kind) => bail!("cannot lay out a {family} device of kind {kind}"),
            }
        }
        Ok(sysfs)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn repository(&self) -> Arc<FsSysfs> {
        Arc::new(FsSysfs::new(self.root()))
    }

    pub fn add_gpu(
        &self,
        address: &str,
        model: &str,
        card_index: u64,
        memory_mib: u64,
        total_vfs: u64,
    ) -> Result<()> {
        let device = self.gpu_dir(address);
        self.write(&device.join("device"), model)?;
        self.write(&device.join("sriov_totalvfs"), &total_vfs.to_string())?;
        self.write(&device.join("sriov_numvfs"), "0")?;
        self.write(&device.join("sriov_drivers_autoprobe"), "1")?;
        self.add_drm_nodes(&device, card_index, memory_mib)
    }

    pub fn add_gpu_vf(
        &self,
        parent_address: &str,
        address: &str,
        model: &str,
        vf_index: u64,
        card_index: u64,
        memory_mib: u64,
    ) -> Result<()> {
        let parent = self.gpu_dir(parent_address);
        let device = self.gpu_dir(address);
        self.write(&device.join("device"), model)?;
        self.link(&device.join("physfn"), &format!("../{parent_address}"))?;
        self.link(&parent.join(format!("virtfn{vf_index}")), &format!("../{address}"))?;

        let num_vfs = std::fs::read_dir(self.abs(&parent))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("virtfn"))
            .count();
        self.write(&parent.join("sriov_numvfs"), &num_vfs.to_string())?;
        self.add_drm_nodes(&device, card_index, memory_mib)
    }

    pub fn add_gaudi(&self, address: &str, model: &str, accel_index: u64) -> Result<()> {
        let device = Path::new(PCI_DRIVERS_DIR).join(GAUDI_DRIVER).join(address);
        self.write(&device.join("device"), model)?;
        self.write(
            &Path::new("devices/virtual/accel")
                .join(format!("accel{accel_index}"))
                .join("device/pci_addr"),
            address,
        )
    }

    pub fn add_qat_pf(&self, address: &str, model: &str, total_vfs: u64) -> Result<()> {
        let device = Path::new(PCI_DRIVERS_DIR).join(QAT_DRIVER).join(address);
        self.write(&device.join("device"), model)?;
        self.write(&device.join("sriov_totalvfs"), &total_vfs.to_string())?;
        std::fs::create_dir_all(self.abs(&Path::new(PCI_DEVICES_DIR).join(address)))?;
        Ok(())
    }

    pub fn add_qat_vf(
        &self,
        pf_address: &str,
        address: &str,
        model: &str,
        vf_index: u64,
        iommu_group: u64,
    ) -> Result<()> {
        let devices = Path::new(PCI_DEVICES_DIR);
        let vf = devices.join(address);
        self.write(&vf.join("device"), model)?;
        self.link(
            &vf.join("iommu_group"),
            &format!("../../../../kernel/iommu_groups/{iommu_group}"),
        )?;
        self.link(
            &devices.join(pf_address).join(format!("virtfn{vf_index}")),
            &format!("../{address}"),
        )
    }

    /// Removes every VF of a GPU along with its DRM class entry.
    pub fn remove_gpu_vfs(&self, parent_address: &str) -> Result<()> {
        let parent = self.gpu_dir(parent_address);
        for entry in std::fs::read_dir(self.abs(&parent))? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with("virtfn") {
                continue;
            }
            let target = std::fs::read_link(entry.path())?;
            let address = target
                .file_name()
                .context("VF link has no target name")?
                .to_string_lossy()
                .into_owned();
            let device = self.abs(&self.gpu_dir(&address));
            for node in std::fs::read_dir(device.join("drm"))? {
                let name = node?.file_name();
                if name.to_string_lossy().starts_with("card") {
                    let class_dir = self.abs(&Path::new(DRM_CLASS_DIR).join(&name));
                    if class_dir.exists() {
                        std::fs::remove_dir_all(class_dir)?;
                    }
                }
            }
            std::fs::remove_dir_all(device)?;
            std::fs::remove_file(entry.path())?;
        }
        self.write(&parent.join("sriov_numvfs"), "0")
    }

    /// Adds a tile directory to the `prelim_iov` entry of one VF.
    pub fn add_vf_tile(&self, card_index: u64, drm_vf: u64, tile: &str) -> Result<()> {
        let dir = Path::new(DRM_CLASS_DIR)
            .join(format!("card{card_index}"))
            .join("prelim_iov")
            .join(format!("vf{drm_vf}"))
            .join(tile);
        std::fs::create_dir_all(self.abs(&dir))?;
        Ok(())
    }

    /// Unbinds a device from its driver, as if it was hot-unplugged.
    pub fn remove_device(&self, driver: &str, address: &str) -> Result<()> {
        let path = self.abs(&Path::new(PCI_DRIVERS_DIR).join(driver).join(address));
        std::fs::remove_dir_all(&path).with_context(|| format!("failed to remove {}", path.display()))
    }

    /// Overwrites one file of the tree, e.g. to corrupt it.
    pub fn write(&self, relative: &Path, contents: &str) -> Result<()> {
        let path = self.abs(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))
    }

    fn add_drm_nodes(&self, device: &Path, card_index: u64, memory_mib: u64) -> Result<()> {
        let drm = self.abs(&device.join("drm"));
        std::fs::create_dir_all(drm.join(format!("card{card_index}")))?;
        std::fs::create_dir_all(drm.join(format!("renderD{}", card_index + 128)))?;
        if memory_mib > 0 {
            self.write(
                &Path::new("class/drm")
                    .join(format!("card{card_index}"))
                    .join("lmem_total_bytes"),
                &(memory_mib * MIB).to_string(),
            )?;
        }
        Ok(())
    }

    fn link(&self, relative: &Path, target: &str) -> Result<()> {
        let path = self.abs(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        symlink(target, &path).with_context(|| format!("failed to link {}", path.display()))
    }

    fn gpu_dir(&self, address: &str) -> PathBuf {
        Path::new(PCI_DRIVERS_DIR).join(GPU_DRIVERS[0]).join(address)
    }

    fn abs(&self, relative: &Path) -> PathBuf {
        self.dir.path().join(relative)
    }
}

/// Stands in for the GPU driver: VFs show up in the fake tree as soon as
/// they are asked for, sized after their profile.
pub struct FakeKernel {
    sysfs: Arc<FakeSysfs>,
    catalog: Arc<ProfileCatalog>,
    next_card: AtomicU64,
    reject: AtomicBool,
    created: AtomicU64,
}

impl FakeKernel {
    pub fn new(sysfs: Arc<FakeSysfs>, catalog: Arc<ProfileCatalog>) -> Self {
        Self {
            sysfs,
            catalog,
            next_card: AtomicU64::new(64),
            reject: AtomicBool::new(false),
            created: AtomicU64::new(0),
        }
    }

    pub fn sysfs(&self) -> &Arc<FakeSysfs> {
        &self.sysfs
    }

    /// Makes VF creation fail until called again with false.
    pub fn reject_creation(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Number of VF sets created so far.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    fn rejected(parent: &DeviceDescriptor, reason: impl std::fmt::Display) -> ProvisionError {
        ProvisionError::Rejected {
            parent: parent.uid.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl VfProvisioner for FakeKernel {
    async fn create(&self, layout: &VfLayout) -> Result<(), ProvisionError> {
        let parent = &layout.parent;
        if self.reject.load(Ordering::SeqCst) {
            return Err(Self::rejected(parent, "sriov_numvfs write refused"));
        }
        for (index, name) in layout.profiles.iter().enumerate() {
            let index = index as u64;
            let memory_mib = self
                .catalog
                .profile(name)
                .map(|p| p.quota_mib(parent.ecc_enabled))
                .unwrap_or_default();
            let address = vf_address(&parent.bus_address, index).map_err(|e| Self::rejected(parent, e))?;
            let card = self.next_card.fetch_add(1, Ordering::SeqCst);
            self.sysfs
                .add_gpu_vf(&parent.bus_address, &address, &parent.model, index, card, memory_mib)
                .map_err(|e| Self::rejected(parent, e))?;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_all(&self, parent: &DeviceDescriptor) -> Result<(), ProvisionError> {
        self.sysfs
            .remove_gpu_vfs(&parent.bus_address)
            .map_err(|e| Self::rejected(parent, e))
    }
}

/// Bus address of VF `index`: functions follow the parent's, eight per slot.
fn vf_address(parent_address: &str, index: u64) -> Result<String> {
    let (prefix, rest) = parent_address
        .rsplit_once(':')
        .context("bus address has no device part")?;
    let (slot, _) = rest.split_once('.').context("bus address has no function")?;
    let slot = u64::from_str_radix(slot, 16).context("malformed device number")?;
    let function = index + 1;
    Ok(format!("{prefix}:{:02x}.{}", slot + function / 8, function % 8))
}

fn parent_address(parent_uid: Option<&str>) -> Result<String> {
    let parent_uid = parent_uid.context("virtual function has no parent")?;
    address_from_uid(parent_uid)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::DeviceKind;

    use super::*;
    use crate::{
        discovery::{models::ModelNames, DiscoveryEngine, NamingStyle},
        vf_sizing::builtin_catalog,
    };

    #[test]
    fn test_vf_addresses() {
        assert_eq!(vf_address("0000:03:00.0", 0).unwrap(), "0000:03:00.1");
        assert_eq!(vf_address("0000:03:00.0", 6).unwrap(), "0000:03:00.7");
        assert_eq!(vf_address("0000:03:00.0", 7).unwrap(), "0000:03:01.0");
        assert!(vf_address("garbage", 0).is_err());
    }

    #[tokio::test]
    async fn test_fake_kernel_creates_discoverable_vfs() {
        let sysfs = Arc::new(FakeSysfs::new().unwrap());
        sysfs.add_gpu("0000:03:00.0", "0x56c0", 0, 16384, 16).unwrap();
        let catalog = Arc::new(builtin_catalog());
        let kernel = FakeKernel::new(sysfs.clone(), catalog.clone());
        let engine = DiscoveryEngine::new(
            sysfs.repository(),
            Arc::new(ModelNames::builtin()),
            catalog,
            Duration::from_secs(5),
        );
        let parent = engine.discover(NamingStyle::Machine).await.unwrap()["0000-03-00-0-0x56c0"].clone();

        let layout = VfLayout {
            parent: parent.clone(),
            profiles: vec!["flex170_m2".to_string(); 2],
            fair_share: true,
        };
        kernel.create(&layout).await.unwrap();
        let snapshot = engine.discover(NamingStyle::Machine).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        let vf = &snapshot["0000-03-00-2-0x56c0"];
        assert_eq!(vf.virtual_function_index, 1);
        assert_eq!(vf.memory_mib, 7680);
        assert_eq!(vf.compute_share_milli, 500);
        assert_eq!(vf.virtual_function_profile.as_deref(), Some("flex170_m2"));
        assert_eq!(vf.card_index, Some(65));

        kernel.remove_all(&parent).await.unwrap();
        let snapshot = engine.discover(NamingStyle::Machine).await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_template_round_trips_through_discovery() {
        let template = DeviceTemplate::parse(
            r#"{
                "card0": {"busAddress": "0000:03:00.0", "model": "0x56c0", "memoryMib": 16384,
                          "maxVirtualFunctions": 16, "cardIndex": 0},
                "card1": {"busAddress": "0000:03:00.1", "model": "0x56c0", "kind": "virtual-function",
                          "parentUid": "0000-03-00-0-0x56c0", "virtualFunctionIndex": 0,
                          "memoryMib": 8192, "cardIndex": 1},
                "accel0": {"busAddress": "0000:1a:00.0", "model": "0x1020", "family": "gaudi", "accelIndex": 0}
            }"#,
        )
        .unwrap();
        let sysfs = FakeSysfs::from_template(&template).unwrap();
        let engine = DiscoveryEngine::new(
            sysfs.repository(),
            Arc::new(ModelNames::builtin()),
            Arc::new(builtin_catalog()),
            Duration::from_secs(5),
        );

        let snapshot = engine.discover(NamingStyle::Machine).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        let vf = &snapshot["0000-03-00-1-0x56c0"];
        assert_eq!(vf.kind, DeviceKind::VirtualFunction);
        assert_eq!(vf.parent_uid.as_deref(), Some("0000-03-00-0-0x56c0"));
        assert_eq!(vf.memory_mib, 8192);
        assert_eq!(vf.compute_share_milli, 1000);
        assert_eq!(snapshot["0000-1a-00-0-0x1020"].accel_index, Some(0));
    }
}
