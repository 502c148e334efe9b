//! QAT discovery. Physical functions are bound to the `4xxx` driver; only
//! their virtual functions, reached through the `virtfn*` links, are handed
//! to workloads through VFIO.

use std::path::{Path, PathBuf};

use data_model::{
    uid::{is_bus_address, uid_from_address},
    DeviceDescriptor,
    DeviceDescriptorBuilder,
    DeviceFamily,
    DeviceKind,
};
use tracing::debug;

use super::{DiscoveryContext, Scan, PCI_DRIVERS_DIR};

pub const QAT_DRIVER: &str = "4xxx";

pub const PCI_DEVICES_DIR: &str = "bus/pci/devices";

pub(super) fn discover(ctx: &DiscoveryContext<'_>, scan: &mut Scan) {
    let driver_dir = Path::new(PCI_DRIVERS_DIR).join(QAT_DRIVER);
    let entries = match ctx.sysfs.list_dir(&driver_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "no QAT devices on this host");
            return;
        }
    };

    for pf_address in entries.iter().filter(|e| is_bus_address(e)) {
        let pf = probe_pf(ctx, &driver_dir, pf_address);
        let Ok(pf) = pf else {
            scan.record(pf_address, pf);
            continue;
        };
        let pf_dir = Path::new(PCI_DEVICES_DIR).join(pf_address);
        for (vf_index, vf_address) in virtual_functions(ctx, &pf_dir) {
            let vf = probe_vf(ctx, &pf, &vf_address, vf_index);
            scan.record(&vf_address, vf);
        }
        scan.record(pf_address, Ok(pf));
    }
}

fn probe_pf(
    ctx: &DiscoveryContext<'_>,
    driver_dir: &Path,
    address: &str,
) -> Result<DeviceDescriptor, String> {
    let device_dir = driver_dir.join(address);
    let model = super::read_model(ctx, &device_dir)?;
    let total_vfs = ctx
        .sysfs
        .read_u64(&device_dir.join("sriov_totalvfs"))
        .map_err(|e| format!("cannot read SR-IOV capacity: {e}"))?;

    DeviceDescriptorBuilder::default()
        .uid(uid_from_address(address, &model))
        .bus_address(address)
        .model(model.clone())
        .model_name(ctx.models.name_of(&model))
        .family_name(ctx.models.family_name_of(&model))
        .family(DeviceFamily::Qat)
        .kind(DeviceKind::Physical)
        .max_virtual_functions(total_vfs)
        .build()
        .map_err(|e| e.to_string())
}

/// `(index, bus address)` of every VF link of a physical function.
fn virtual_functions(ctx: &DiscoveryContext<'_>, pf_dir: &Path) -> Vec<(u64, String)> {
    let Ok(entries) = ctx.sysfs.list_dir(pf_dir) else {
        return Vec::new();
    };
    let mut vfs: Vec<(u64, String)> = entries
        .iter()
        .filter_map(|name| {
            let index = name.strip_prefix("virtfn")?.parse().ok()?;
            let target = ctx.sysfs.read_link(&pf_dir.join(name)).ok()?;
            let address = target.file_name()?.to_string_lossy().into_owned();
            is_bus_address(&address).then_some((index, address))
        })
        .collect();
    vfs.sort();
    vfs
}

fn probe_vf(
    ctx: &DiscoveryContext<'_>,
    pf: &DeviceDescriptor,
    address: &str,
    vf_index: u64,
) -> Result<DeviceDescriptor, String> {
    let vf_dir = PathBuf::from(PCI_DEVICES_DIR).join(address);
    let model = super::read_model(ctx, &vf_dir)?;
    let group = ctx
        .sysfs
        .read_link(&vf_dir.join("iommu_group"))
        .map_err(|e| format!("no IOMMU group: {e}"))?;
    let iommu_group: u64 = group
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| format!("malformed IOMMU group link {}", group.display()))?;

    DeviceDescriptorBuilder::default()
        .uid(uid_from_address(address, &model))
        .bus_address(address)
        .model(model.clone())
        .model_name(ctx.models.name_of(&model))
        .family_name(ctx.models.family_name_of(&model))
        .family(DeviceFamily::Qat)
        .kind(DeviceKind::VirtualFunction)
        .parent_uid(Some(pf.uid.clone()))
        .virtual_function_index(vf_index)
        .iommu_group(Some(iommu_group))
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
    fn test_qat_virtual_functions() {
        let sysfs = InMemorySysfs::new()
            .file("bus/pci/drivers/4xxx/0000:6b:00.0/device", "0x4940")
            .file("bus/pci/drivers/4xxx/0000:6b:00.0/sriov_totalvfs", "16")
            .link("bus/pci/devices/0000:6b:00.0/virtfn0", "../0000:6b:00.1")
            .link("bus/pci/devices/0000:6b:00.0/virtfn1", "../0000:6b:00.2")
            .link("bus/pci/devices/0000:6b:00.0/virtfn2", "../0000:6b:00.3")
            .file("bus/pci/devices/0000:6b:00.1/device", "0x4941")
            .link(
                "bus/pci/devices/0000:6b:00.1/iommu_group",
                "../../../kernel/iommu_groups/211",
            )
            .file("bus/pci/devices/0000:6b:00.2/device", "0x4941")
            .link(
                "bus/pci/devices/0000:6b:00.2/iommu_group",
                "../../../kernel/iommu_groups/212",
            )
            .file("bus/pci/devices/0000:6b:00.3/device", "0x4941");

        let models = ModelNames::builtin();
        let catalog = builtin_catalog();
        let ctx = DiscoveryContext {
            sysfs: &sysfs,
            models: &models,
            catalog: &catalog,
        };
        let mut scan = Scan::default();
        discover(&ctx, &mut scan);

        let pf = scan.devices.iter().find(|d| d.kind == DeviceKind::Physical).unwrap();
        assert_eq!(pf.uid, "0000-6b-00-0-0x4940");
        assert_eq!(pf.max_virtual_functions, 16);

        let vfs: Vec<(&str, Option<u64>, u64)> = scan
            .devices
            .iter()
            .filter(|d| d.is_virtual_function())
            .map(|d| (d.uid.as_str(), d.iommu_group, d.virtual_function_index))
            .collect();
        assert_eq!(
            vfs,
            vec![
                ("0000-6b-00-1-0x4941", Some(211), 0),
                ("0000-6b-00-2-0x4941", Some(212), 1),
            ]
        );
        assert!(scan
            .devices
            .iter()
            .filter(|d| d.is_virtual_function())
            .all(|d| d.parent_uid.as_deref() == Some("0000-6b-00-0-0x4940")));

        assert_eq!(scan.anomalies.len(), 1);
        assert_eq!(scan.anomalies[0].address, "0000:6b:00.3");
    }
}
