//! GPU discovery under the `i915` and `xe` PCI drivers.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use data_model::{
    uid::{is_bus_address, uid_from_address},
    DeviceDescriptor,
    DeviceDescriptorBuilder,
    DeviceFamily,
    DeviceKind,
    FULL_COMPUTE_SHARE_MILLI,
};
use regex::Regex;
use tracing::debug;

use super::{DiscoveryContext, Scan, PCI_DRIVERS_DIR};

pub const GPU_DRIVERS: [&str; 2] = ["i915", "xe"];

pub const DRM_CLASS_DIR: &str = "class/drm";
const MIB: u64 = 1024 * 1024;

pub static CARD_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^card(\d+)$").expect("valid card pattern"));
pub static RENDER_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^renderD(\d+)$").expect("valid render pattern"));

pub(super) fn discover(ctx: &DiscoveryContext<'_>, scan: &mut Scan) {
    for driver in GPU_DRIVERS {
        let driver_dir = Path::new(PCI_DRIVERS_DIR).join(driver);
        let entries = match ctx.sysfs.list_dir(&driver_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(driver, error = %e, "no devices bound to driver");
                continue;
            }
        };
        for address in entries.iter().filter(|e| is_bus_address(e)) {
            scan.record(address, probe(ctx, &driver_dir, address));
        }
    }
}

fn probe(
    ctx: &DiscoveryContext<'_>,
    driver_dir: &Path,
    address: &str,
) -> Result<DeviceDescriptor, String> {
    let device_dir = driver_dir.join(address);
    let model = super::read_model(ctx, &device_dir)?;
    let uid = uid_from_address(address, &model);

    let (card_index, render_index) = drm_indexes(ctx, &device_dir)?;
    let memory_mib = local_memory_mib(ctx, card_index);

    let mut builder = DeviceDescriptorBuilder::default();
    builder
        .uid(uid.clone())
        .bus_address(address)
        .model(model.clone())
        .model_name(ctx.models.name_of(&model))
        .family_name(ctx.models.family_name_of(&model))
        .family(DeviceFamily::Gpu)
        .memory_mib(memory_mib)
        .card_index(Some(card_index))
        .render_index(render_index);

    if ctx.sysfs.exists(&device_dir.join("sriov_totalvfs")) {
        let total_vfs = ctx
            .sysfs
            .read_u64(&device_dir.join("sriov_totalvfs"))
            .map_err(|e| format!("cannot read SR-IOV capacity: {e}"))?;
        let max_vfs = if autoprobe_enabled(ctx, &device_dir) {
            total_vfs
        } else {
            debug!(uid = %uid, total_vfs, "driver autoprobe disabled, not offering VFs");
            0
        };
        builder
            .kind(DeviceKind::Physical)
            .max_virtual_functions(max_vfs)
            .ecc_enabled(ecc_enabled(ctx, &model, memory_mib));
    } else if let Ok(physfn) = ctx.sysfs.read_link(&device_dir.join("physfn")) {
        let parent_address = link_basename(&physfn)
            .ok_or_else(|| format!("physfn link {} has no target name", physfn.display()))?;
        let vf_index = vf_index(ctx, &driver_dir.join(&parent_address), address)?;
        builder
            .kind(DeviceKind::VirtualFunction)
            .parent_uid(Some(uid_from_address(&parent_address, &model)))
            .virtual_function_index(vf_index)
            .compute_share_milli(vf_compute_share(ctx, &driver_dir.join(&parent_address)))
            .virtual_function_profile(applied_profile(ctx, &model, memory_mib));
    } else {
        return Err("neither sriov_totalvfs nor physfn present".to_string());
    }

    builder.build().map_err(|e| e.to_string())
}

/// Card and render node indexes from the device's `drm` directory. The render
/// node is optional; a device without a card node cannot be exposed.
fn drm_indexes(ctx: &DiscoveryContext<'_>, device_dir: &Path) -> Result<(u64, Option<u64>), String> {
    let drm = ctx
        .sysfs
        .list_dir(&device_dir.join("drm"))
        .map_err(|e| format!("cannot list drm directory: {e}"))?;

    let mut card = None;
    let mut render = None;
    for name in &drm {
        if let Some(index) = node_index(&CARD_NODE, name) {
            card = Some(index);
        } else if let Some(index) = node_index(&RENDER_NODE, name) {
            render = Some(index);
        }
    }
    let card = card.ok_or_else(|| "no card node in drm directory".to_string())?;
    Ok((card, render))
}

pub fn node_index(pattern: &Regex, name: &str) -> Option<u64> {
    pattern.captures(name)?.get(1)?.as_str().parse().ok()
}

fn local_memory_mib(ctx: &DiscoveryContext<'_>, card_index: u64) -> u64 {
    let path = PathBuf::from(DRM_CLASS_DIR)
        .join(format!("card{card_index}"))
        .join("lmem_total_bytes");
    match ctx.sysfs.read_u64(&path) {
        Ok(bytes) => bytes / MIB,
        Err(e) => {
            debug!(card_index, error = %e, "no local memory, assuming shared memory device");
            0
        }
    }
}

fn autoprobe_enabled(ctx: &DiscoveryContext<'_>, device_dir: &Path) -> bool {
    match ctx
        .sysfs
        .read_trimmed(&device_dir.join("sriov_drivers_autoprobe"))
    {
        Ok(value) => value != "0",
        Err(_) => false,
    }
}

/// ECC reserves part of local memory, so the driver reports less memory than
/// the largest ECC-off VF quota. Max series parts always run with ECC.
fn ecc_enabled(ctx: &DiscoveryContext<'_>, model: &str, memory_mib: u64) -> bool {
    let short_of_quota = ctx
        .catalog
        .max_quota_mib(model, false)
        .is_some_and(|quota| quota > memory_mib);
    short_of_quota || ctx.models.name_of(model).starts_with("max")
}

fn link_basename(target: &Path) -> Option<String> {
    Some(target.file_name()?.to_string_lossy().into_owned())
}

fn vf_index(ctx: &DiscoveryContext<'_>, parent_dir: &Path, address: &str) -> Result<u64, String> {
    let entries = ctx
        .sysfs
        .list_dir(parent_dir)
        .map_err(|e| format!("cannot list parent function: {e}"))?;
    for name in entries.iter().filter(|n| n.starts_with("virtfn")) {
        let Ok(target) = ctx.sysfs.read_link(&parent_dir.join(name)) else {
            continue;
        };
        if link_basename(&target).as_deref() != Some(address) {
            continue;
        }
        return name["virtfn".len()..]
            .parse()
            .map_err(|_| format!("malformed VF link {name}"));
    }
    Err("parent function has no link to this VF".to_string())
}

/// VFs split the parent's compute evenly between the enabled VFs.
fn vf_compute_share(ctx: &DiscoveryContext<'_>, parent_dir: &Path) -> u64 {
    match ctx.sysfs.read_u64(&parent_dir.join("sriov_numvfs")) {
        Ok(num_vfs) if num_vfs > 0 => FULL_COMPUTE_SHARE_MILLI / num_vfs,
        _ => FULL_COMPUTE_SHARE_MILLI,
    }
}

/// The catalog profile whose memory quota matches what the VF was given.
fn applied_profile(ctx: &DiscoveryContext<'_>, model: &str, memory_mib: u64) -> Option<String> {
    if memory_mib == 0 {
        return None;
    }
    ctx.catalog
        .catalog_for(model)?
        .into_iter()
        .find(|p| p.memory_quota_mib == memory_mib || p.memory_quota_ecc_mib == Some(memory_mib))
        .map(|p| p.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discovery::{models::ModelNames, sysfs::InMemorySysfs},
        vf_sizing::builtin_catalog,
    };

    const DRIVER: &str = "bus/pci/drivers/i915";

    fn pf(sysfs: InMemorySysfs, address: &str, model: &str, card: u64, memory_mib: u64) -> InMemorySysfs {
        let dir = format!("{DRIVER}/{address}");
        sysfs
            .file(format!("{dir}/device"), format!("{model}\n"))
            .file(format!("{dir}/sriov_totalvfs"), "16\n")
            .file(format!("{dir}/sriov_drivers_autoprobe"), "1\n")
            .dir(format!("{dir}/drm/card{card}"))
            .dir(format!("{dir}/drm/renderD{}", 128 + card))
            .file(
                format!("class/drm/card{card}/lmem_total_bytes"),
                (memory_mib * MIB).to_string(),
            )
    }

    fn scan(sysfs: &InMemorySysfs) -> Scan {
        let models = ModelNames::builtin();
        let catalog = builtin_catalog();
        let ctx = DiscoveryContext {
            sysfs,
            models: &models,
            catalog: &catalog,
        };
        let mut scan = Scan::default();
        discover(&ctx, &mut scan);
        scan
    }

    #[test]
    fn test_physical_gpu() {
        let sysfs = pf(InMemorySysfs::new(), "0000:03:00.0", "0x56c0", 0, 16384);
        let scan = scan(&sysfs);
        assert!(scan.anomalies.is_empty());
        let gpu = &scan.devices[0];
        assert_eq!(gpu.uid, "0000-03-00-0-0x56c0");
        assert_eq!(gpu.model_name, "flex170");
        assert_eq!(gpu.family_name, "Data Center Flex");
        assert_eq!(gpu.kind, DeviceKind::Physical);
        assert_eq!(gpu.memory_mib, 16384);
        assert_eq!(gpu.max_virtual_functions, 16);
        assert_eq!(gpu.card_index, Some(0));
        assert_eq!(gpu.render_index, Some(128));
        assert!(!gpu.ecc_enabled);
        assert!(gpu.healthy);
    }

    #[test]
    fn test_autoprobe_disabled_hides_vfs() {
        let sysfs = pf(InMemorySysfs::new(), "0000:03:00.0", "0x56c0", 0, 16384)
            .file(format!("{DRIVER}/0000:03:00.0/sriov_drivers_autoprobe"), "0\n");
        let scan = scan(&sysfs);
        assert_eq!(scan.devices[0].max_virtual_functions, 0);
        assert_eq!(scan.devices[0].kind, DeviceKind::Physical);
    }

    #[test]
    fn test_ecc_detected_from_reduced_memory() {
        let sysfs = pf(InMemorySysfs::new(), "0000:03:00.0", "0x56c0", 0, 14248);
        assert!(scan(&sysfs).devices[0].ecc_enabled);
    }

    #[test]
    fn test_virtual_function() {
        let sysfs = pf(InMemorySysfs::new(), "0000:03:00.0", "0x56c0", 0, 16384)
            .file(format!("{DRIVER}/0000:03:00.0/sriov_numvfs"), "2\n")
            .link(format!("{DRIVER}/0000:03:00.0/virtfn0"), "../0000:03:00.1")
            .file(format!("{DRIVER}/0000:03:00.1/device"), "0x56c0\n")
            .link(format!("{DRIVER}/0000:03:00.1/physfn"), "../0000:03:00.0")
            .dir(format!("{DRIVER}/0000:03:00.1/drm/card1"))
            .dir(format!("{DRIVER}/0000:03:00.1/drm/renderD129"))
            .file("class/drm/card1/lmem_total_bytes", (7680 * MIB).to_string());

        let scan = scan(&sysfs);
        assert!(scan.anomalies.is_empty());
        let vf = scan
            .devices
            .iter()
            .find(|d| d.uid == "0000-03-00-1-0x56c0")
            .unwrap();
        assert_eq!(vf.kind, DeviceKind::VirtualFunction);
        assert_eq!(vf.parent_uid.as_deref(), Some("0000-03-00-0-0x56c0"));
        assert_eq!(vf.virtual_function_index, 0);
        assert_eq!(vf.compute_share_milli, 500);
        assert_eq!(vf.memory_mib, 7680);
        assert_eq!(vf.virtual_function_profile.as_deref(), Some("flex170_m2"));
        assert_eq!(vf.max_virtual_functions, 0);
    }

    #[test]
    fn test_faulty_devices_are_skipped() {
        struct Case {
            name: &'static str,
            add_bad_device: fn(InMemorySysfs) -> InMemorySysfs,
        }
        let cases = [
            Case {
                name: "unreadable model id",
                add_bad_device: |s| {
                    pf(s, "0000:04:00.0", "0x56c0", 1, 16384)
                        .unreadable("bus/pci/drivers/i915/0000:04:00.0/device")
                },
            },
            Case {
                name: "garbage SR-IOV capacity",
                add_bad_device: |s| {
                    pf(s, "0000:04:00.0", "0x56c0", 1, 16384)
                        .file("bus/pci/drivers/i915/0000:04:00.0/sriov_totalvfs", "many")
                },
            },
            Case {
                name: "neither PF nor VF",
                add_bad_device: |s| {
                    s.file("bus/pci/drivers/i915/0000:04:00.0/device", "0x56c0")
                        .dir("bus/pci/drivers/i915/0000:04:00.0/drm/card1")
                },
            },
            Case {
                name: "VF without a matching virtfn link",
                add_bad_device: |s| {
                    s.file("bus/pci/drivers/i915/0000:04:00.0/device", "0x56c0")
                        .link("bus/pci/drivers/i915/0000:04:00.0/physfn", "../0000:03:00.0")
                        .dir("bus/pci/drivers/i915/0000:04:00.0/drm/card1")
                },
            },
            Case {
                name: "no drm directory",
                add_bad_device: |s| {
                    s.file("bus/pci/drivers/i915/0000:04:00.0/device", "0x56c0")
                        .file("bus/pci/drivers/i915/0000:04:00.0/sriov_totalvfs", "16")
                },
            },
        ];

        for case in cases {
            let good = pf(InMemorySysfs::new(), "0000:03:00.0", "0x56c0", 0, 16384);
            let sysfs = (case.add_bad_device)(good);
            let scan = scan(&sysfs);
            assert_eq!(scan.devices.len(), 1, "{}", case.name);
            assert_eq!(scan.devices[0].bus_address, "0000:03:00.0", "{}", case.name);
            assert_eq!(scan.anomalies.len(), 1, "{}", case.name);
            assert_eq!(scan.anomalies[0].address, "0000:04:00.0", "{}", case.name);
        }
    }

    #[test]
    fn test_missing_local_memory_means_shared_memory() {
        let sysfs = InMemorySysfs::new()
            .file(format!("{DRIVER}/0000:00:02.0/device"), "0x4680")
            .file(format!("{DRIVER}/0000:00:02.0/sriov_totalvfs"), "0")
            .dir(format!("{DRIVER}/0000:00:02.0/drm/card0"));
        let scan = scan(&sysfs);
        let gpu = &scan.devices[0];
        assert_eq!(gpu.memory_mib, 0);
        assert_eq!(gpu.render_index, None);
        assert_eq!(gpu.model_name, "Unknown");
        assert!(!gpu.ecc_enabled);
    }
}
