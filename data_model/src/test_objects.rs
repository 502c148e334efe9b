pub mod tests {
    use crate::{
        uid::{planned_vf_uid, uid_from_address},
        AllocatedDevice,
        AllocationState,
        DeviceDescriptor,
        DeviceDescriptorBuilder,
        DeviceFamily,
        DeviceKind,
        DiscoverySnapshot,
    };

    pub const FLEX170: &str = "0x56c0";
    pub const FLEX140: &str = "0x56c1";
    pub const MAX1550: &str = "0x0bd5";
    pub const GAUDI2: &str = "0x1020";
    pub const QAT_4XXX_VF: &str = "0x4941";

    pub fn mock_gpu(bus_address: &str, model: &str, card_index: u64) -> DeviceDescriptor {
        let memory_mib: u64 = match model {
            FLEX170 => 16384,
            FLEX140 => 6144,
            MAX1550 => 65536,
            _ => 0,
        };
        DeviceDescriptorBuilder::default()
            .uid(uid_from_address(bus_address, model))
            .bus_address(bus_address)
            .model(model)
            .kind(DeviceKind::Physical)
            .memory_mib(memory_mib)
            .max_virtual_functions(if memory_mib > 0 { 16u64 } else { 0u64 })
            .card_index(Some(card_index))
            .render_index(Some(128 + card_index))
            .build()
            .unwrap()
    }

    /// A virtual function on `parent`. Bus function numbers follow the index.
    pub fn mock_vf(parent: &DeviceDescriptor, vf_index: u64, card_index: u64) -> DeviceDescriptor {
        let bus_address = format!("{}{}", &parent.bus_address[..11], vf_index.min(7));
        DeviceDescriptorBuilder::default()
            .uid(uid_from_address(&bus_address, &parent.model))
            .bus_address(bus_address)
            .model(parent.model.clone())
            .kind(DeviceKind::VirtualFunction)
            .parent_uid(Some(parent.uid.clone()))
            .memory_mib(parent.memory_mib / 2)
            .compute_share_milli(500u64)
            .virtual_function_index(vf_index - 1)
            .card_index(Some(card_index))
            .render_index(Some(128 + card_index))
            .build()
            .unwrap()
    }

    pub fn mock_gaudi(bus_address: &str, accel_index: u64) -> DeviceDescriptor {
        DeviceDescriptorBuilder::default()
            .uid(uid_from_address(bus_address, GAUDI2))
            .bus_address(bus_address)
            .model(GAUDI2)
            .family(DeviceFamily::Gaudi)
            .accel_index(Some(accel_index))
            .build()
            .unwrap()
    }

    pub fn mock_qat_vf(bus_address: &str, iommu_group: u64) -> DeviceDescriptor {
        DeviceDescriptorBuilder::default()
            .uid(uid_from_address(bus_address, QAT_4XXX_VF))
            .bus_address(bus_address)
            .model(QAT_4XXX_VF)
            .family(DeviceFamily::Qat)
            .kind(DeviceKind::VirtualFunction)
            .iommu_group(Some(iommu_group))
            .build()
            .unwrap()
    }

    pub fn allocated_from(device: &DeviceDescriptor, memory_mib: u64) -> AllocatedDevice {
        AllocatedDevice {
            uid: device.uid.clone(),
            kind: device.kind,
            parent_uid: device.parent_uid.clone(),
            memory_mib,
            compute_share_milli: 0,
            profile: None,
            planned_vf_index: None,
        }
    }

    /// A VF to be created on `parent` at `vf_index`.
    pub fn planned_vf(parent: &DeviceDescriptor, vf_index: u64, memory_mib: u64, profile: &str) -> AllocatedDevice {
        AllocatedDevice {
            uid: planned_vf_uid(&parent.uid, vf_index),
            kind: DeviceKind::VirtualFunction,
            parent_uid: Some(parent.uid.clone()),
            memory_mib,
            compute_share_milli: 0,
            profile: Some(profile.to_string()),
            planned_vf_index: Some(vf_index),
        }
    }

    pub fn snapshot_of(devices: Vec<DeviceDescriptor>) -> DiscoverySnapshot {
        devices.into_iter().map(|d| (d.uid.clone(), d)).collect()
    }

    pub fn state_with(devices: Vec<DeviceDescriptor>) -> AllocationState {
        AllocationState {
            allocatable_devices: snapshot_of(devices),
            ..Default::default()
        }
    }
}
