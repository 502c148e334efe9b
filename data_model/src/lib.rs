pub mod clocks;
pub mod templates;
pub mod test_objects;
pub mod uid;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub use crate::clocks::{ResourceVersion, Versioned};

/// Upper bound of a device's compute share, in milli-units.
pub const FULL_COMPUTE_SHARE_MILLI: u64 = 1000;

/// Largest number of units a single claim may request: ten cards with 64
/// virtual functions each.
pub const MAX_CLAIM_COUNT: u64 = 640;

/// Largest per-device memory request (1 TiB).
pub const MAX_CLAIM_MEMORY_MIB: u64 = 1_048_576;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceKind {
    #[default]
    Physical,
    VirtualFunction,
    #[serde(other)]
    Unknown,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceFamily {
    #[default]
    Gpu,
    Gaudi,
    Qat,
}

/// One physical or virtual accelerator unit as seen by a discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into))]
pub struct DeviceDescriptor {
    pub uid: String,
    pub bus_address: String,
    pub model: String,
    #[builder(default)]
    #[serde(default)]
    pub model_name: String,
    #[builder(default)]
    #[serde(default)]
    pub family_name: String,
    #[builder(default)]
    #[serde(default)]
    pub family: DeviceFamily,
    #[builder(default)]
    #[serde(default)]
    pub kind: DeviceKind,
    /// Set iff `kind` is [`DeviceKind::VirtualFunction`].
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uid: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub memory_mib: u64,
    #[builder(default = "FULL_COMPUTE_SHARE_MILLI")]
    #[serde(default = "full_compute_share")]
    pub compute_share_milli: u64,
    #[builder(default)]
    #[serde(default)]
    pub max_virtual_functions: u64,
    #[builder(default)]
    #[serde(default)]
    pub virtual_function_index: u64,
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_function_profile: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub ecc_enabled: bool,
    #[builder(default = "true")]
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_index: Option<u64>,
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_index: Option<u64>,
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_index: Option<u64>,
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iommu_group: Option<u64>,
}

fn full_compute_share() -> u64 {
    FULL_COMPUTE_SHARE_MILLI
}

fn default_healthy() -> bool {
    true
}

impl DeviceDescriptor {
    pub fn is_virtual_function(&self) -> bool {
        self.kind == DeviceKind::VirtualFunction
    }

    /// Whether SR-IOV is enabled and virtual functions can be carved out.
    pub fn supports_virtual_functions(&self) -> bool {
        self.kind == DeviceKind::Physical && self.max_virtual_functions > 0
    }
}

/// Snapshot of devices produced by one discovery pass, keyed by UID or by
/// the legacy card name.
pub type DiscoverySnapshot = BTreeMap<String, DeviceDescriptor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RequestedDeviceType {
    #[serde(alias = "gpu")]
    Physical,
    #[serde(alias = "vf")]
    VirtualFunction,
    #[default]
    Any,
}

impl RequestedDeviceType {
    pub fn accepts(&self, kind: DeviceKind) -> bool {
        match self {
            RequestedDeviceType::Physical => kind == DeviceKind::Physical,
            RequestedDeviceType::VirtualFunction => kind == DeviceKind::VirtualFunction,
            RequestedDeviceType::Any => kind != DeviceKind::Unknown,
        }
    }
}

/// A workload's request for accelerator units, routed to this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into))]
pub struct ClaimRequest {
    pub claim_id: String,
    #[builder(default = "1")]
    #[serde(default = "default_count")]
    pub count: u64,
    #[builder(default)]
    #[serde(default)]
    pub device_type: RequestedDeviceType,
    #[builder(default)]
    #[serde(default)]
    pub family: DeviceFamily,
    /// Per-device memory request. Zero means no memory constraint.
    #[builder(default)]
    #[serde(default)]
    pub memory_mib: u64,
    /// Per-device compute request. Zero means no compute constraint.
    #[builder(default)]
    #[serde(default)]
    pub compute_share_milli: u64,
    #[builder(default)]
    #[serde(default)]
    pub shareable: bool,
}

fn default_count() -> u64 {
    1
}

impl ClaimRequest {
    pub fn validate(&self) -> Result<()> {
        if self.claim_id.trim().is_empty() {
            bail!("claim id must not be empty");
        }
        if self.count == 0 || self.count > MAX_CLAIM_COUNT {
            bail!(
                "claim {} requests {} devices, must be between 1 and {}",
                self.claim_id,
                self.count,
                MAX_CLAIM_COUNT
            );
        }
        if self.memory_mib > MAX_CLAIM_MEMORY_MIB {
            bail!(
                "claim {} requests {} MiB per device, maximum is {}",
                self.claim_id,
                self.memory_mib,
                MAX_CLAIM_MEMORY_MIB
            );
        }
        if self.compute_share_milli > FULL_COMPUTE_SHARE_MILLI {
            bail!(
                "claim {} requests {} millicores per device, maximum is {}",
                self.claim_id,
                self.compute_share_milli,
                FULL_COMPUTE_SHARE_MILLI
            );
        }
        Ok(())
    }
}

/// One device granted to a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedDevice {
    pub uid: String,
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uid: Option<String>,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub compute_share_milli: u64,
    /// VF sizing profile applied to this device, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Set while the device is a VF that still has to be created on its
    /// parent, at this VF index. `uid` is a placeholder until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_vf_index: Option<u64>,
}

impl AllocatedDevice {
    pub fn is_planned(&self) -> bool {
        self.planned_vf_index.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedClaim {
    pub devices: Vec<AllocatedDevice>,
    #[serde(default)]
    pub shareable: bool,
}

impl AllocatedClaim {
    pub fn uids(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|d| d.uid.as_str())
    }

    pub fn has_planned_devices(&self) -> bool {
        self.devices.iter().any(AllocatedDevice::is_planned)
    }
}

/// Reasons a device is excluded from new allocations. All of them must be
/// cleared before the device returns to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaintReasons {
    #[serde(default)]
    pub reasons: BTreeSet<String>,
}

/// What existing claims already hold on one device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Consumption {
    pub memory_mib: u64,
    pub compute_share_milli: u64,
    pub holders: BTreeSet<String>,
    /// At least one holder did not ask for a shareable claim.
    pub exclusive: bool,
    /// Allocated virtual functions whose parent is this device.
    pub allocated_children: u64,
    pub children_memory_mib: u64,
}

impl Consumption {
    pub fn is_free(&self) -> bool {
        self.holders.is_empty() && self.allocated_children == 0
    }
}

/// Outcome of reconciling the allocatable mirror with a discovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Devices gone from hardware but still held by a claim.
    pub preserved: Vec<String>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.preserved.is_empty()
    }
}

/// The authoritative per-node allocation record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationState {
    #[serde(default)]
    pub allocatable_devices: BTreeMap<String, DeviceDescriptor>,
    #[serde(default)]
    pub allocated_claims: BTreeMap<String, AllocatedClaim>,
    #[serde(default)]
    pub tainted_devices: BTreeMap<String, TaintReasons>,
}

impl AllocationState {
    pub fn is_tainted(&self, uid: &str) -> bool {
        self.tainted_devices
            .get(uid)
            .is_some_and(|t| !t.reasons.is_empty())
    }

    /// Adds a taint reason. Returns false when the reason was already present.
    pub fn taint(&mut self, uid: &str, reason: &str) -> bool {
        self.tainted_devices
            .entry(uid.to_string())
            .or_default()
            .reasons
            .insert(reason.to_string())
    }

    /// Removes a taint reason, dropping the entry once no reason is left.
    /// Returns false when the reason was not present.
    pub fn untaint(&mut self, uid: &str, reason: &str) -> bool {
        let Some(taint) = self.tainted_devices.get_mut(uid) else {
            return false;
        };
        let removed = taint.reasons.remove(reason);
        if taint.reasons.is_empty() {
            self.tainted_devices.remove(uid);
        }
        removed
    }

    /// Resources held on `uid` by every claim except `excluding_claim`.
    pub fn consumption(&self, uid: &str, excluding_claim: Option<&str>) -> Consumption {
        let mut consumption = Consumption::default();
        for (claim_id, claim) in &self.allocated_claims {
            if Some(claim_id.as_str()) == excluding_claim {
                continue;
            }
            for device in &claim.devices {
                if device.uid == uid {
                    consumption.memory_mib += device.memory_mib;
                    consumption.compute_share_milli += device.compute_share_milli;
                    consumption.holders.insert(claim_id.clone());
                    consumption.exclusive |= !claim.shareable;
                }
                if device.parent_uid.as_deref() == Some(uid) {
                    consumption.allocated_children += 1;
                    consumption.children_memory_mib += device.memory_mib;
                }
            }
        }
        consumption
    }

    pub fn is_allocated(&self, uid: &str) -> bool {
        self.allocated_claims
            .values()
            .any(|claim| claim.uids().any(|u| u == uid))
    }

    pub fn release(&mut self, claim_id: &str) -> Option<AllocatedClaim> {
        self.allocated_claims.remove(claim_id)
    }

    /// Swaps planned VFs for the allocatable VFs that now sit at their parent
    /// and index. Returns the placeholder UIDs that were resolved; planned
    /// VFs with no match are left as they are.
    pub fn resolve_planned_vfs(&mut self) -> Vec<String> {
        let mut resolved = Vec::new();
        for claim in self.allocated_claims.values_mut() {
            for device in claim.devices.iter_mut() {
                let Some(index) = device.planned_vf_index else {
                    continue;
                };
                let created = self.allocatable_devices.values().find(|d| {
                    d.is_virtual_function() &&
                        d.parent_uid == device.parent_uid &&
                        d.virtual_function_index == index
                });
                let Some(created) = created else {
                    continue;
                };
                resolved.push(std::mem::replace(&mut device.uid, created.uid.clone()));
                device.memory_mib = created.memory_mib;
                device.compute_share_milli = created.compute_share_milli;
                if created.virtual_function_profile.is_some() {
                    device.profile = created.virtual_function_profile.clone();
                }
                device.planned_vf_index = None;
            }
        }
        resolved
    }

    /// Allocatable VFs of `parent_uid`.
    pub fn virtual_functions_of<'a>(&'a self, parent_uid: &'a str) -> impl Iterator<Item = &'a DeviceDescriptor> {
        self.allocatable_devices
            .values()
            .filter(move |d| d.is_virtual_function() && d.parent_uid.as_deref() == Some(parent_uid))
    }

    /// Replaces the allocatable mirror with `snapshot`. Devices that vanished
    /// from hardware but are still held by a claim are kept, marked unhealthy,
    /// until the claim is released.
    pub fn reconcile_allocatable(&mut self, snapshot: &DiscoverySnapshot) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut next: BTreeMap<String, DeviceDescriptor> = BTreeMap::new();

        for device in snapshot.values() {
            if !self.allocatable_devices.contains_key(&device.uid) {
                outcome.added.push(device.uid.clone());
            }
            next.insert(device.uid.clone(), device.clone());
        }

        for (uid, device) in &self.allocatable_devices {
            if next.contains_key(uid) {
                continue;
            }
            if self.is_allocated(uid) {
                let mut orphan = device.clone();
                orphan.healthy = false;
                next.insert(uid.clone(), orphan);
                outcome.preserved.push(uid.clone());
            } else {
                outcome.removed.push(uid.clone());
            }
        }

        self.allocatable_devices = next;
        outcome
    }
}

/// A device handle returned to the node agent after a successful prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDevice {
    pub uid: String,
    pub kind: DeviceKind,
    pub family: DeviceFamily,
    /// Fully qualified exposure registry name, e.g. `intel.com/gpu=<uid>`.
    pub cdi_device: String,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub compute_share_milli: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}
