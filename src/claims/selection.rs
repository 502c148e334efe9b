//! Picks devices for a claim from an AllocationState.
//!
//! Selection is a pure function of the state, the request and the policy,
//! so re-running it on an unchanged state yields the same devices.

use std::{cmp::Reverse, collections::BTreeSet};

use data_model::{
    uid::planned_vf_uid,
    AllocatedDevice,
    AllocationState,
    ClaimRequest,
    Consumption,
    DeviceDescriptor,
    DeviceFamily,
    DeviceKind,
    RequestedDeviceType,
};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, trace};

use crate::{errors::AllocatorError, vf_sizing::ProfileCatalog};

/// Order in which otherwise equal candidates are tried.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AllocationPolicy {
    /// Ascending UID.
    #[default]
    None,
    /// Most remaining resource first, spreading claims over devices.
    Balanced,
    /// Least remaining resource first, filling devices up.
    Packed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PolicyResource {
    #[default]
    Memory,
    Millicores,
}

pub struct Selector<'a> {
    pub catalog: &'a ProfileCatalog,
    pub policy: AllocationPolicy,
    pub resource: PolicyResource,
    /// Plan new VFs on SR-IOV capable GPUs when the existing VFs fall short.
    pub carve_vfs: bool,
}

struct Candidate<'a> {
    device: &'a DeviceDescriptor,
    remaining_memory_mib: u64,
    remaining_millicores: u64,
    profile: Option<String>,
}

impl Candidate<'_> {
    fn remaining(&self, resource: PolicyResource) -> u64 {
        match resource {
            PolicyResource::Memory => self.remaining_memory_mib,
            PolicyResource::Millicores => self.remaining_millicores,
        }
    }
}

enum Rejection {
    Unavailable,
    Sizing(AllocatorError),
}

impl Selector<'_> {
    /// Devices for `request`, or an error when fewer than `request.count`
    /// devices qualify. Never returns a partial allocation.
    pub fn select(
        &self,
        state: &AllocationState,
        request: &ClaimRequest,
    ) -> Result<Vec<AllocatedDevice>, AllocatorError> {
        let mut candidates = Vec::new();
        let mut sizing_error = None;
        for device in state.allocatable_devices.values() {
            match self.evaluate(state, request, device) {
                Ok(candidate) => candidates.push(candidate),
                Err(Rejection::Sizing(e)) => {
                    trace!(uid = %device.uid, error = %e, "no VF profile fits");
                    sizing_error.get_or_insert(e);
                }
                Err(Rejection::Unavailable) => {}
            }
        }

        self.order(&mut candidates);

        let mut chosen: Vec<&Candidate> = Vec::new();
        let mut chosen_uids = BTreeSet::new();
        for candidate in &candidates {
            if chosen.len() as u64 == request.count {
                break;
            }
            let device = candidate.device;
            let related_taken = match &device.parent_uid {
                Some(parent) => chosen_uids.contains(parent.as_str()),
                None => chosen
                    .iter()
                    .any(|c| c.device.parent_uid.as_deref() == Some(device.uid.as_str())),
            };
            if related_taken {
                continue;
            }
            chosen_uids.insert(device.uid.as_str());
            chosen.push(candidate);
        }

        let mut devices = chosen
            .into_iter()
            .map(|c| self.grant(request, c))
            .collect::<Vec<_>>();

        let missing = request.count - devices.len() as u64;
        if missing > 0 && self.carves_for(request) {
            let planned = self.plan_new_vfs(state, request, missing, &mut sizing_error);
            if planned.len() as u64 == missing {
                devices.extend(planned);
            }
        }

        if (devices.len() as u64) < request.count {
            if let (true, Some(e)) = (candidates.is_empty(), sizing_error) {
                return Err(e);
            }
            return Err(AllocatorError::InsufficientResources {
                claim_id: request.claim_id.clone(),
                requested: request.count,
                available: devices.len() as u64,
            });
        }

        debug!(
            claim_id = %request.claim_id,
            devices = ?devices.iter().map(|d| d.uid.as_str()).collect::<Vec<_>>(),
            "selected devices"
        );
        Ok(devices)
    }

    fn evaluate<'s>(
        &self,
        state: &'s AllocationState,
        request: &ClaimRequest,
        device: &'s DeviceDescriptor,
    ) -> Result<Candidate<'s>, Rejection> {
        if device.family != request.family ||
            !device.healthy ||
            !request.device_type.accepts(device.kind) ||
            state.is_tainted(&device.uid)
        {
            return Err(Rejection::Unavailable);
        }
        // QAT physical functions only host VFs.
        if device.family == DeviceFamily::Qat && device.kind == DeviceKind::Physical {
            return Err(Rejection::Unavailable);
        }

        let consumption = state.consumption(&device.uid, Some(&request.claim_id));
        if consumption.allocated_children > 0 {
            return Err(Rejection::Unavailable);
        }
        if let Some(parent) = &device.parent_uid {
            if state.is_tainted(parent) ||
                !state.consumption(parent, Some(&request.claim_id)).holders.is_empty()
            {
                return Err(Rejection::Unavailable);
            }
        }
        let profile = if device.is_virtual_function() && request.memory_mib > 0 {
            Some(self.vf_profile(state, request, device)?)
        } else {
            device.virtual_function_profile.clone()
        };
        if !self.shares_fit(request, device, &consumption) {
            return Err(Rejection::Unavailable);
        }

        Ok(Candidate {
            device,
            remaining_memory_mib: device.memory_mib.saturating_sub(consumption.memory_mib),
            remaining_millicores: device
                .compute_share_milli
                .saturating_sub(consumption.compute_share_milli),
            profile,
        })
    }

    /// Exclusive claims need a device nobody holds. Shareable claims can join
    /// other shareable holders while memory and compute remain.
    fn shares_fit(&self, request: &ClaimRequest, device: &DeviceDescriptor, consumption: &Consumption) -> bool {
        if !request.shareable {
            let memory_fits = request.memory_mib == 0 ||
                device.memory_mib == 0 ||
                device.memory_mib >= request.memory_mib;
            return consumption.holders.is_empty() && memory_fits;
        }
        if consumption.exclusive {
            return false;
        }
        let memory_left = device.memory_mib.saturating_sub(consumption.memory_mib);
        let compute_left = device
            .compute_share_milli
            .saturating_sub(consumption.compute_share_milli);
        let memory_fits =
            request.memory_mib == 0 || device.memory_mib == 0 || memory_left >= request.memory_mib;
        memory_fits && compute_left >= request.compute_share_milli
    }

    /// Confirms a VF profile can hold the request and names the profile the
    /// VF runs with.
    fn vf_profile(
        &self,
        state: &AllocationState,
        request: &ClaimRequest,
        device: &DeviceDescriptor,
    ) -> Result<String, Rejection> {
        let ecc_enabled = device
            .parent_uid
            .as_ref()
            .and_then(|p| state.allocatable_devices.get(p))
            .is_some_and(|parent| parent.ecc_enabled);
        let picked = self
            .catalog
            .pick_profile(&device.model, request.memory_mib, 0, ecc_enabled)
            .map_err(|e| Rejection::Sizing(e.into()))?;

        match &device.virtual_function_profile {
            Some(applied) => {
                let quota = self
                    .catalog
                    .profile(applied)
                    .map(|p| p.quota_mib(ecc_enabled))
                    .unwrap_or(device.memory_mib);
                if quota < request.memory_mib {
                    return Err(Rejection::Unavailable);
                }
                Ok(applied.clone())
            }
            None if device.memory_mib >= picked.granted_memory_mib => Ok(picked.name),
            None => Err(Rejection::Unavailable),
        }
    }

    fn carves_for(&self, request: &ClaimRequest) -> bool {
        self.carve_vfs &&
            request.family == DeviceFamily::Gpu &&
            request.device_type == RequestedDeviceType::VirtualFunction
    }

    /// A GPU can take new VFs while SR-IOV is still unconfigured on it and
    /// nothing holds it.
    fn can_host_new_vfs(&self, state: &AllocationState, device: &DeviceDescriptor) -> bool {
        device.family == DeviceFamily::Gpu &&
            device.supports_virtual_functions() &&
            device.healthy &&
            !state.is_tainted(&device.uid) &&
            state.consumption(&device.uid, None).is_free() &&
            state.virtual_functions_of(&device.uid).next().is_none()
    }

    /// VFs still to be created, `wanted` at most. Each host is filled in
    /// policy order until its VF slots or its memory run out.
    fn plan_new_vfs(
        &self,
        state: &AllocationState,
        request: &ClaimRequest,
        wanted: u64,
        sizing_error: &mut Option<AllocatorError>,
    ) -> Vec<AllocatedDevice> {
        let mut hosts: Vec<Candidate> = state
            .allocatable_devices
            .values()
            .filter(|d| self.can_host_new_vfs(state, d))
            .map(|device| Candidate {
                device,
                remaining_memory_mib: device.memory_mib,
                remaining_millicores: device.compute_share_milli,
                profile: None,
            })
            .collect();
        self.order(&mut hosts);

        let mut planned = Vec::new();
        for host in &hosts {
            let parent = host.device;
            let mut consumed_mib = 0;
            let mut vf_index = 0;
            while (planned.len() as u64) < wanted && vf_index < parent.max_virtual_functions {
                let picked = if request.memory_mib > 0 {
                    self.catalog
                        .pick_profile(&parent.model, request.memory_mib, consumed_mib, parent.ecc_enabled)
                } else {
                    self.catalog.vf_defaults(&parent.model, parent.ecc_enabled)
                };
                let picked = match picked {
                    Ok(picked) => picked,
                    Err(e) => {
                        if vf_index == 0 {
                            trace!(uid = %parent.uid, error = %e, "no VF profile fits a new VF");
                            sizing_error.get_or_insert(e.into());
                        }
                        break;
                    }
                };
                let slots = self
                    .catalog
                    .profile(&picked.name)
                    .map_or(parent.max_virtual_functions, |p| p.num_vfs);
                let memory_left = parent.memory_mib == 0 ||
                    consumed_mib + picked.granted_memory_mib <= parent.memory_mib;
                if vf_index >= slots || !memory_left {
                    break;
                }

                consumed_mib += picked.granted_memory_mib;
                planned.push(AllocatedDevice {
                    uid: planned_vf_uid(&parent.uid, vf_index),
                    kind: DeviceKind::VirtualFunction,
                    parent_uid: Some(parent.uid.clone()),
                    memory_mib: picked.granted_memory_mib,
                    compute_share_milli: picked.compute_share_milli,
                    profile: Some(picked.name),
                    planned_vf_index: Some(vf_index),
                });
                vf_index += 1;
            }
        }
        if !planned.is_empty() {
            debug!(
                claim_id = %request.claim_id,
                vfs = ?planned.iter().map(|d| d.uid.as_str()).collect::<Vec<_>>(),
                "planned new VFs"
            );
        }
        planned
    }

    fn order(&self, candidates: &mut [Candidate<'_>]) {
        let resource = self.resource;
        let policy = self.policy;
        candidates.sort_by_cached_key(|c| {
            let vf_first = if c.device.is_virtual_function() { 0u8 } else { 1u8 };
            // VFs: smallest fitting first.
            let vf_size = if c.device.is_virtual_function() {
                c.device.memory_mib
            } else {
                0
            };
            let remaining = c.remaining(resource);
            let policy_key = match policy {
                AllocationPolicy::None => (0, Reverse(0)),
                AllocationPolicy::Balanced => (0, Reverse(remaining)),
                AllocationPolicy::Packed => (remaining, Reverse(0)),
            };
            (vf_first, vf_size, policy_key, c.device.uid.clone())
        });
    }

    fn grant(&self, request: &ClaimRequest, candidate: &Candidate<'_>) -> AllocatedDevice {
        let device = candidate.device;
        let (memory_mib, compute_share_milli) = if request.shareable {
            (request.memory_mib, request.compute_share_milli)
        } else {
            (device.memory_mib, device.compute_share_milli)
        };
        AllocatedDevice {
            uid: device.uid.clone(),
            kind: device.kind,
            parent_uid: device.parent_uid.clone(),
            memory_mib,
            compute_share_milli,
            profile: candidate.profile.clone(),
            planned_vf_index: None,
        }
    }
}
