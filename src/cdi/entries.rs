//! Registry entries for each accelerator family.

use std::path::Path;

use data_model::{DeviceDescriptor, DeviceFamily};

use super::spec::{CdiDevice, ContainerEdits, DeviceNode, Mount};

pub const GPU_KIND: &str = "intel.com/gpu";
pub const GAUDI_KIND: &str = "intel.com/gaudi";
pub const QAT_KIND: &str = "intel.com/qat";

const CHAR_DEVICE: &str = "c";

pub fn kind_for(family: DeviceFamily) -> &'static str {
    match family {
        DeviceFamily::Gpu => GPU_KIND,
        DeviceFamily::Gaudi => GAUDI_KIND,
        DeviceFamily::Qat => QAT_KIND,
    }
}

/// Fully qualified device name handed to the container runtime.
pub fn qualified_name(device: &DeviceDescriptor) -> String {
    format!("{}={}", kind_for(device.family), device.uid)
}

/// Builds the entry exposing `device`. `dev_root` is the host's device
/// directory. Returns None for devices that have no device node to expose,
/// like QAT physical functions.
pub fn device_entry(device: &DeviceDescriptor, dev_root: &Path) -> Option<CdiDevice> {
    let container_edits = match device.family {
        DeviceFamily::Gpu => gpu_edits(device, dev_root)?,
        DeviceFamily::Gaudi => {
            let accel = device.accel_index?;
            ContainerEdits {
                device_nodes: vec![
                    char_node(dev_root, &format!("accel/accel{accel}")),
                    char_node(dev_root, &format!("accel/accel_controlD{accel}")),
                ],
                ..Default::default()
            }
        }
        DeviceFamily::Qat => {
            let group = device.iommu_group?;
            ContainerEdits {
                device_nodes: vec![
                    char_node(dev_root, &format!("vfio/{group}")),
                    char_node(dev_root, "vfio/vfio"),
                ],
                ..Default::default()
            }
        }
    };
    Some(CdiDevice {
        name: device.uid.clone(),
        container_edits,
    })
}

fn gpu_edits(device: &DeviceDescriptor, dev_root: &Path) -> Option<ContainerEdits> {
    let card = device.card_index?;
    let mut device_nodes = vec![char_node(dev_root, &format!("dri/card{card}"))];
    if let Some(render) = device.render_index {
        device_nodes.push(char_node(dev_root, &format!("dri/renderD{render}")));
    }

    let mut mounts = Vec::new();
    for suffix in ["card", "render"] {
        let relative = format!("dri/by-path/pci-{}-{suffix}", device.bus_address);
        let host_path = dev_root.join(&relative);
        if host_path.exists() {
            mounts.push(Mount {
                host_path: host_path.display().to_string(),
                container_path: format!("/dev/{relative}"),
                mount_type: Some("none".to_string()),
                options: vec!["bind".to_string(), "rw".to_string()],
            });
        }
    }

    Some(ContainerEdits {
        device_nodes,
        mounts,
        ..Default::default()
    })
}

fn char_node(dev_root: &Path, relative: &str) -> DeviceNode {
    DeviceNode {
        path: format!("/dev/{relative}"),
        host_path: Some(dev_root.join(relative).display().to_string()),
        node_type: Some(CHAR_DEVICE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_gaudi, mock_gpu, mock_qat_vf, FLEX170};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_gpu_entry() {
        let dev = tempdir().unwrap();
        std::fs::create_dir_all(dev.path().join("dri/by-path")).unwrap();
        std::fs::write(dev.path().join("dri/by-path/pci-0000:03:00.0-card"), "").unwrap();

        let gpu = mock_gpu("0000:03:00.0", FLEX170, 1);
        let entry = device_entry(&gpu, dev.path()).unwrap();
        assert_eq!(entry.name, "0000-03-00-0-0x56c0");
        let paths: Vec<&str> = entry
            .container_edits
            .device_nodes
            .iter()
            .map(|n| n.path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/dri/card1", "/dev/dri/renderD129"]);
        assert_eq!(
            entry.container_edits.device_nodes[0].host_path,
            Some(dev.path().join("dri/card1").display().to_string())
        );
        assert_eq!(entry.container_edits.mounts.len(), 1);
        assert_eq!(
            entry.container_edits.mounts[0].container_path,
            "/dev/dri/by-path/pci-0000:03:00.0-card"
        );
        assert_eq!(qualified_name(&gpu), "intel.com/gpu=0000-03-00-0-0x56c0");
    }

    #[test]
    fn test_gaudi_and_qat_entries() {
        let dev = Path::new("/dev");
        let gaudi = device_entry(&mock_gaudi("0000:19:00.0", 2), dev).unwrap();
        let paths: Vec<&str> = gaudi
            .container_edits
            .device_nodes
            .iter()
            .map(|n| n.path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/accel/accel2", "/dev/accel/accel_controlD2"]);

        let vf = mock_qat_vf("0000:6b:00.1", 211);
        let qat = device_entry(&vf, dev).unwrap();
        assert_eq!(qat.container_edits.device_nodes[0].path, "/dev/vfio/211");
        assert_eq!(qat.container_edits.device_nodes[1].path, "/dev/vfio/vfio");
        assert_eq!(qualified_name(&vf), "intel.com/qat=0000-6b-00-1-0x4941");

        let mut pf = vf.clone();
        pf.iommu_group = None;
        assert!(device_entry(&pf, dev).is_none());
    }
}
