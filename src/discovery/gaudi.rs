//! Gaudi discovery under the `habanalabs` PCI driver.
//!
//! The accel index of a device is not visible from its PCI directory; it is
//! found by matching `devices/virtual/accel/accelN/device/pci_addr` against
//! the bus address.

use std::{collections::BTreeMap, path::Path, sync::LazyLock};

use data_model::{
    uid::{is_bus_address, uid_from_address},
    DeviceDescriptor,
    DeviceDescriptorBuilder,
    DeviceFamily,
    DeviceKind,
};
use regex::Regex;
use tracing::{debug, warn};

use super::{gpu::node_index, DiscoveryContext, Scan, PCI_DRIVERS_DIR};

pub const GAUDI_DRIVER: &str = "habanalabs";

const ACCEL_CLASS_DIR: &str = "devices/virtual/accel";

pub static ACCEL_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^accel(\d+)$").expect("valid accel pattern"));

pub(super) fn discover(ctx: &DiscoveryContext<'_>, scan: &mut Scan) {
    let driver_dir = Path::new(PCI_DRIVERS_DIR).join(GAUDI_DRIVER);
    let entries = match ctx.sysfs.list_dir(&driver_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "no Gaudi devices on this host");
            return;
        }
    };

    let accel_indexes = accel_indexes(ctx);
    for address in entries.iter().filter(|e| is_bus_address(e)) {
        let result = probe(ctx, &driver_dir, address, accel_indexes.get(address).copied());
        scan.record(address, result);
    }
}

/// Maps bus address to accel index. Accel entries that cannot be read are
/// skipped; the device they belong to is then reported as an anomaly.
fn accel_indexes(ctx: &DiscoveryContext<'_>) -> BTreeMap<String, u64> {
    let mut indexes = BTreeMap::new();
    let Ok(entries) = ctx.sysfs.list_dir(Path::new(ACCEL_CLASS_DIR)) else {
        return indexes;
    };
    for name in entries {
        let Some(index) = node_index(&ACCEL_NODE, &name) else {
            continue;
        };
        let pci_addr = Path::new(ACCEL_CLASS_DIR)
            .join(&name)
            .join("device/pci_addr");
        match ctx.sysfs.read_trimmed(&pci_addr) {
            Ok(address) => {
                indexes.insert(address, index);
            }
            Err(e) => warn!(accel = %name, error = %e, "cannot read accel device address"),
        }
    }
    indexes
}

fn probe(
    ctx: &DiscoveryContext<'_>,
    driver_dir: &Path,
    address: &str,
    accel_index: Option<u64>,
) -> Result<DeviceDescriptor, String> {
    let model = super::read_model(ctx, &driver_dir.join(address))?;
    let accel_index = accel_index.ok_or_else(|| "no accel device node".to_string())?;

    DeviceDescriptorBuilder::default()
        .uid(uid_from_address(address, &model))
        .bus_address(address)
        .model(model.clone())
        .model_name(ctx.models.name_of(&model))
        .family_name(ctx.models.family_name_of(&model))
        .family(DeviceFamily::Gaudi)
        .kind(DeviceKind::Physical)
        .accel_index(Some(accel_index))
        .build()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discovery::{models::ModelNames, sysfs::InMemorySysfs},
        vf_sizing::builtin_catalog,
    };

    #[test]
    fn test_gaudi_devices_need_an_accel_node() {
        let sysfs = InMemorySysfs::new()
            .file("bus/pci/drivers/habanalabs/0000:19:00.0/device", "0x1020\n")
            .file("bus/pci/drivers/habanalabs/0000:1a:00.0/device", "0x1030\n")
            .file("bus/pci/drivers/habanalabs/0000:1b:00.0/device", "0x1020\n")
            .file("devices/virtual/accel/accel0/device/pci_addr", "0000:19:00.0\n")
            .file("devices/virtual/accel/accel3/device/pci_addr", "0000:1a:00.0\n")
            .unreadable("devices/virtual/accel/accel4/device/pci_addr")
            .dir("bus/pci/drivers/habanalabs/module");

        let models = ModelNames::builtin();
        let catalog = builtin_catalog();
        let ctx = DiscoveryContext {
            sysfs: &sysfs,
            models: &models,
            catalog: &catalog,
        };
        let mut scan = Scan::default();
        discover(&ctx, &mut scan);

        let found: Vec<(&str, Option<u64>, &str)> = scan
            .devices
            .iter()
            .map(|d| (d.uid.as_str(), d.accel_index, d.model_name.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("0000-19-00-0-0x1020", Some(0), "Gaudi2"),
                ("0000-1a-00-0-0x1030", Some(3), "Gaudi3"),
            ]
        );
        assert_eq!(scan.anomalies.len(), 1);
        assert_eq!(scan.anomalies[0].address, "0000:1b:00.0");
        assert!(scan.devices.iter().all(|d| d.family == DeviceFamily::Gaudi));
    }
}
