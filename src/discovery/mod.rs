//! Accelerator discovery from a kernel device tree.
//!
//! A pass walks the PCI driver directories of every supported accelerator
//! class and returns a [`DiscoverySnapshot`]. Discovery only reads: a device
//! whose attributes cannot be read or make no sense is reported as an
//! [`Anomaly`] and left out, and never fails the pass for the other devices.

pub mod gaudi;
pub mod gpu;
pub mod models;
pub mod qat;
pub mod sysfs;

use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};

use data_model::{DeviceDescriptor, DeviceFamily, DeviceKind, DiscoverySnapshot};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{info, warn};

use self::{models::ModelNames, sysfs::SysfsRepository};
use crate::{errors::AllocatorError, vf_sizing::ProfileCatalog};

pub const PCI_DRIVERS_DIR: &str = "bus/pci/drivers";

/// How the returned snapshot is keyed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NamingStyle {
    /// `card<N>` for GPUs and `accel<N>` for Gaudi devices.
    Classic,
    /// The device UID.
    #[default]
    Machine,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("skipping device {address}: {reason}")]
pub struct Anomaly {
    pub address: String,
    pub reason: String,
}

/// Devices and anomalies collected by one pass, in walk order.
#[derive(Debug, Default)]
pub struct Scan {
    pub devices: Vec<DeviceDescriptor>,
    pub anomalies: Vec<Anomaly>,
}

impl Scan {
    fn record(&mut self, address: &str, result: Result<DeviceDescriptor, String>) {
        match result {
            Ok(device) => self.devices.push(device),
            Err(reason) => {
                warn!(address, reason = %reason, "discovery anomaly, skipping device");
                self.anomalies.push(Anomaly {
                    address: address.to_string(),
                    reason,
                });
            }
        }
    }

    /// Drops virtual functions whose parent was not found in this pass.
    fn drop_orphans(&mut self) {
        let physical: BTreeSet<String> = self
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Physical)
            .map(|d| d.uid.clone())
            .collect();

        let (kept, orphans): (Vec<_>, Vec<_>) = std::mem::take(&mut self.devices)
            .into_iter()
            .partition(|d| match &d.parent_uid {
                Some(parent) => physical.contains(parent),
                None => d.kind != DeviceKind::VirtualFunction,
            });
        self.devices = kept;
        for orphan in orphans {
            let reason = match &orphan.parent_uid {
                Some(parent) => format!("parent function {parent} was not discovered"),
                None => "virtual function without a parent".to_string(),
            };
            self.record(&orphan.bus_address, Err(reason));
        }
    }
}

pub(crate) struct DiscoveryContext<'a> {
    pub sysfs: &'a dyn SysfsRepository,
    pub models: &'a ModelNames,
    pub catalog: &'a ProfileCatalog,
}

/// Reads and validates the hardware model id of the device at `device_dir`.
pub(crate) fn read_model(ctx: &DiscoveryContext<'_>, device_dir: &Path) -> Result<String, String> {
    let model = ctx
        .sysfs
        .read_trimmed(&device_dir.join("device"))
        .map_err(|e| format!("cannot read model id: {e}"))?
        .to_lowercase();
    let valid = model
        .strip_prefix("0x")
        .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(format!("malformed model id {model:?}"));
    }
    Ok(model)
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    sysfs: Arc<dyn SysfsRepository>,
    models: Arc<ModelNames>,
    catalog: Arc<ProfileCatalog>,
    timeout: Duration,
}

impl DiscoveryEngine {
    pub fn new(
        sysfs: Arc<dyn SysfsRepository>,
        models: Arc<ModelNames>,
        catalog: Arc<ProfileCatalog>,
        timeout: Duration,
    ) -> Self {
        Self {
            sysfs,
            models,
            catalog,
            timeout,
        }
    }

    /// Walks every accelerator class once.
    pub fn scan(&self) -> Scan {
        let ctx = DiscoveryContext {
            sysfs: self.sysfs.as_ref(),
            models: &self.models,
            catalog: &self.catalog,
        };
        let mut scan = Scan::default();
        gpu::discover(&ctx, &mut scan);
        gaudi::discover(&ctx, &mut scan);
        qat::discover(&ctx, &mut scan);
        scan.drop_orphans();
        scan
    }

    /// Runs a pass off the async runtime, bounded by the discovery timeout.
    pub async fn discover(&self, naming_style: NamingStyle) -> Result<DiscoverySnapshot, AllocatorError> {
        let engine = self.clone();
        let pass = tokio::task::spawn_blocking(move || engine.scan());
        let scan = tokio::time::timeout(self.timeout, pass)
            .await
            .map_err(|_| {
                AllocatorError::Environment(format!(
                    "discovery did not finish within {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| AllocatorError::Environment(format!("discovery task failed: {e}")))?;

        info!(
            devices = scan.devices.len(),
            anomalies = scan.anomalies.len(),
            "discovery pass finished"
        );
        Ok(snapshot(scan.devices, naming_style))
    }
}

/// Keys devices by UID, or by their legacy device node name.
pub fn snapshot(devices: Vec<DeviceDescriptor>, naming_style: NamingStyle) -> DiscoverySnapshot {
    devices
        .into_iter()
        .map(|device| (snapshot_key(&device, naming_style), device))
        .collect()
}

fn snapshot_key(device: &DeviceDescriptor, naming_style: NamingStyle) -> String {
    if naming_style == NamingStyle::Machine {
        return device.uid.clone();
    }
    match (device.family, device.card_index, device.accel_index) {
        (DeviceFamily::Gpu, Some(card), _) => format!("card{card}"),
        (DeviceFamily::Gaudi, _, Some(accel)) => format!("accel{accel}"),
        _ => device.uid.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::sysfs::InMemorySysfs, vf_sizing::builtin_catalog};

    fn engine(sysfs: InMemorySysfs) -> DiscoveryEngine {
        DiscoveryEngine::new(
            Arc::new(sysfs),
            Arc::new(ModelNames::builtin()),
            Arc::new(builtin_catalog()),
            Duration::from_secs(5),
        )
    }

    fn gpu(sysfs: InMemorySysfs, address: &str, card: u64) -> InMemorySysfs {
        let dir = format!("bus/pci/drivers/i915/{address}");
        sysfs
            .file(format!("{dir}/device"), "0x56c1")
            .file(format!("{dir}/sriov_totalvfs"), "12")
            .dir(format!("{dir}/drm/card{card}"))
    }

    #[tokio::test]
    async fn test_one_unreadable_model_id_keeps_the_other_device() {
        let sysfs = gpu(InMemorySysfs::new(), "0000:03:00.0", 0);
        let sysfs = gpu(sysfs, "0000:04:00.0", 1).unreadable("bus/pci/drivers/i915/0000:04:00.0/device");

        let snapshot = engine(sysfs).discover(NamingStyle::Machine).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("0000-03-00-0-0x56c1"));
    }

    #[tokio::test]
    async fn test_classic_naming() {
        let sysfs = gpu(InMemorySysfs::new(), "0000:03:00.0", 2)
            .file("bus/pci/drivers/habanalabs/0000:19:00.0/device", "0x1020")
            .file("devices/virtual/accel/accel5/device/pci_addr", "0000:19:00.0");

        let snapshot = engine(sysfs).discover(NamingStyle::Classic).await.unwrap();
        let keys: Vec<&str> = snapshot.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["accel5", "card2"]);
        assert_eq!(snapshot["card2"].uid, "0000-03-00-0-0x56c1");
    }

    #[test]
    fn test_orphan_vfs_are_dropped() {
        let sysfs = gpu(InMemorySysfs::new(), "0000:03:00.0", 0)
            .link("bus/pci/drivers/i915/0000:03:00.0/virtfn0", "../0000:03:00.1")
            .file("bus/pci/drivers/i915/0000:03:00.1/device", "0x56c1")
            .link("bus/pci/drivers/i915/0000:03:00.1/physfn", "../0000:03:00.0")
            .dir("bus/pci/drivers/i915/0000:03:00.1/drm/card1")
            .unreadable("bus/pci/drivers/i915/0000:03:00.0/device");

        let scan = engine(sysfs).scan();
        assert!(scan.devices.is_empty());
        let skipped: Vec<&str> = scan.anomalies.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(skipped, vec!["0000:03:00.0", "0000:03:00.1"]);
    }

    #[test]
    fn test_malformed_model_ids() {
        struct Case {
            contents: &'static str,
            valid: bool,
        }
        let cases = [
            Case { contents: "0x56C0\n", valid: true },
            Case { contents: "0x", valid: false },
            Case { contents: "56c0", valid: false },
            Case { contents: "0xzz", valid: false },
        ];
        for case in cases {
            let sysfs = InMemorySysfs::new().file("dev/device", case.contents);
            let models = ModelNames::builtin();
            let catalog = builtin_catalog();
            let ctx = DiscoveryContext {
                sysfs: &sysfs,
                models: &models,
                catalog: &catalog,
            };
            assert_eq!(
                read_model(&ctx, Path::new("dev")).is_ok(),
                case.valid,
                "{:?}",
                case.contents
            );
        }
    }
}
