//! Virtual function sizing.
//!
//! A [`ProfileCatalog`] holds the named VF profiles of every supported model,
//! ordered by memory quota. It is built once at startup and only read
//! afterwards; every operation here is a pure function of the catalog and its
//! arguments.

pub mod profiles;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use self::profiles::builtin_catalog;

/// Profile used when VFs are split evenly by the driver itself.
pub const FAIR_SHARE_PROFILE: &str = "fairShare";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    #[error("no VF profile of device {model} can hold {requested_mib} MiB")]
    NoMatchingProfile { model: String, requested_mib: u64 },

    #[error("no VF profiles for device {model}")]
    NoProfilesForDevice { model: String },

    #[error("could not split device {model} fairly between {requests} VFs")]
    NoFairSplit { model: String, requests: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfProfile {
    pub name: String,
    pub memory_quota_mib: u64,
    /// Quota when ECC is enabled, if it differs from `memory_quota_mib`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_quota_ecc_mib: Option<u64>,
    pub compute_share_milli: u64,
    #[serde(default)]
    pub num_vfs: u64,
    #[serde(default)]
    pub contexts_quota: u64,
    #[serde(default)]
    pub doorbells_quota: u64,
    #[serde(default)]
    pub ggtt_quota: u64,
    #[serde(default)]
    pub exec_quantum_ms: u64,
    #[serde(default)]
    pub preempt_timeout_us: u64,
}

impl VfProfile {
    pub fn quota_mib(&self, ecc_enabled: bool) -> u64 {
        match (ecc_enabled, self.memory_quota_ecc_mib) {
            (true, Some(ecc)) => ecc,
            _ => self.memory_quota_mib,
        }
    }
}

/// Result of a successful profile pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedProfile {
    pub granted_memory_mib: u64,
    pub compute_share_milli: u64,
    pub name: String,
}

impl PickedProfile {
    fn from_profile(profile: &VfProfile, ecc_enabled: bool) -> Self {
        Self {
            granted_memory_mib: profile.quota_mib(ecc_enabled),
            compute_share_milli: profile.compute_share_milli,
            name: profile.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: BTreeMap<String, VfProfile>,
    /// Profile names per model id, smallest memory quota first.
    per_model: BTreeMap<String, Vec<String>>,
    /// Default VF memory per model id, overriding the catalog default.
    default_memory_overrides: BTreeMap<String, u64>,
}

impl ProfileCatalog {
    /// Builds a catalog. Each model's profile list is put in total order by
    /// memory quota, ties broken by name; unknown names are dropped.
    pub fn new(profiles: Vec<VfProfile>, per_model: BTreeMap<String, Vec<String>>) -> Self {
        let profiles: BTreeMap<String, VfProfile> =
            profiles.into_iter().map(|p| (p.name.clone(), p)).collect();

        let per_model = per_model
            .into_iter()
            .map(|(model, names)| {
                let mut known: Vec<String> = names
                    .into_iter()
                    .filter(|n| {
                        let exists = profiles.contains_key(n);
                        if !exists {
                            warn!(model = %model, profile = %n, "dropping undefined VF profile");
                        }
                        exists
                    })
                    .collect();
                known.sort_by(|a, b| {
                    let (pa, pb) = (&profiles[a], &profiles[b]);
                    pa.memory_quota_mib
                        .cmp(&pb.memory_quota_mib)
                        .then_with(|| a.cmp(b))
                });
                known.dedup();
                (model, known)
            })
            .collect();

        Self {
            profiles,
            per_model,
            default_memory_overrides: BTreeMap::new(),
        }
    }

    /// Replaces the per-model default VF memory. Keys are model ids.
    pub fn with_default_memory_overrides(mut self, overrides: BTreeMap<String, u64>) -> Self {
        self.default_memory_overrides = overrides;
        self
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.per_model.keys().map(String::as_str)
    }

    pub fn profile(&self, name: &str) -> Option<&VfProfile> {
        self.profiles.get(name)
    }

    /// The model's profiles, smallest first, or None for an unknown model.
    pub fn catalog_for(&self, model: &str) -> Option<Vec<&VfProfile>> {
        let names = self.per_model.get(model)?;
        Some(names.iter().filter_map(|n| self.profiles.get(n)).collect())
    }

    /// Largest VF memory quota of a model.
    pub fn max_quota_mib(&self, model: &str, ecc_enabled: bool) -> Option<u64> {
        self.catalog_for(model)?
            .iter()
            .map(|p| p.quota_mib(ecc_enabled))
            .max()
    }

    /// Picks the smallest profile whose quota holds `requested_mib`. When the
    /// device already has `already_consumed_mib` carved out, the profile must
    /// also fit in what is left of the device's VF budget (its largest quota).
    pub fn pick_profile(
        &self,
        model: &str,
        requested_mib: u64,
        already_consumed_mib: u64,
        ecc_enabled: bool,
    ) -> Result<PickedProfile, SizingError> {
        let no_match = || SizingError::NoMatchingProfile {
            model: model.to_string(),
            requested_mib,
        };
        let catalog = self.catalog_for(model).ok_or_else(no_match)?;
        let budget = self.max_quota_mib(model, ecc_enabled).unwrap_or_default();

        let picked = catalog.iter().find(|p| {
            let quota = p.quota_mib(ecc_enabled);
            quota >= requested_mib && quota.saturating_add(already_consumed_mib) <= budget
        });

        match picked {
            Some(profile) => {
                debug!(
                    model,
                    requested_mib,
                    already_consumed_mib,
                    ecc_enabled,
                    profile = %profile.name,
                    "picked VF profile"
                );
                Ok(PickedProfile::from_profile(profile, ecc_enabled))
            }
            None => Err(no_match()),
        }
    }

    /// How many VFs a fair split of the device yields while still holding
    /// every one of `requests` (MiB each). Requests that carry no memory
    /// size are satisfied by any split, one VF each.
    ///
    /// Walks the catalog from the largest profile down, skipping profiles
    /// with fewer VFs than requests, and stops at the first profile that
    /// cannot hold one of the requests. Performs no reservation.
    pub fn max_fair_vfs(&self, model: &str, requests: &[u64]) -> Result<u64, SizingError> {
        if requests.iter().all(|r| *r == 0) {
            return Ok(requests.len() as u64);
        }

        let catalog = self
            .catalog_for(model)
            .ok_or_else(|| SizingError::NoProfilesForDevice {
                model: model.to_string(),
            })?;
        let wanted = requests.len() as u64;
        let largest_request = requests.iter().copied().max().unwrap_or_default();

        let mut suitable: Option<&VfProfile> = None;
        for profile in catalog.iter().rev() {
            if profile.num_vfs < wanted {
                continue;
            }
            if largest_request > profile.memory_quota_mib {
                debug!(model, profile = %profile.name, "profile cannot hold every request");
                break;
            }
            suitable = Some(*profile);
        }

        suitable
            .map(|p| p.num_vfs)
            .ok_or_else(|| SizingError::NoFairSplit {
                model: model.to_string(),
                requests: requests.len(),
            })
    }

    /// True if `profile_name` belongs to the model's catalog, or is the fair
    /// share profile of a known model.
    pub fn device_profile_exists(&self, model: &str, profile_name: &str) -> bool {
        let Some(names) = self.per_model.get(model) else {
            return false;
        };
        profile_name == FAIR_SHARE_PROFILE || names.iter().any(|n| n == profile_name)
    }

    /// Compute share of a profile in milli-units, zero when unknown.
    pub fn profile_compute_share(&self, profile_name: &str) -> u64 {
        self.profiles
            .get(profile_name)
            .map(|p| p.compute_share_milli)
            .unwrap_or_default()
    }

    /// Whether `memory_mib` is a usable VF memory size on the model.
    pub fn sanitize_lmem_quota(&self, model: &str, ecc_enabled: bool, memory_mib: u64) -> bool {
        match self.max_quota_mib(model, ecc_enabled) {
            Some(max) => memory_mib > 0 && memory_mib <= max,
            None => false,
        }
    }

    /// Default VF of a model: the configured default memory size if one is
    /// set and valid, else the catalog's smallest profile.
    pub fn vf_defaults(&self, model: &str, ecc_enabled: bool) -> Result<PickedProfile, SizingError> {
        if let Some(memory_mib) = self.default_memory_overrides.get(model).copied() {
            if self.sanitize_lmem_quota(model, ecc_enabled, memory_mib) {
                return self.pick_profile(model, memory_mib, 0, ecc_enabled);
            }
            warn!(model, memory_mib, "ignoring misconfigured default VF memory");
        }

        let catalog = self
            .catalog_for(model)
            .ok_or_else(|| SizingError::NoProfilesForDevice {
                model: model.to_string(),
            })?;
        catalog
            .first()
            .map(|p| PickedProfile::from_profile(p, ecc_enabled))
            .ok_or_else(|| SizingError::NoProfilesForDevice {
                model: model.to_string(),
            })
    }
}
