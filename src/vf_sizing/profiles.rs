//! Built-in SR-IOV VF profiles for the supported GPU models.
//!
//! Quotas mirror the kernel driver's provisioning tables. The flex170 parts
//! reserve part of local memory for ECC, so their profiles carry a second,
//! smaller memory quota used when ECC is enabled.

use std::collections::BTreeMap;

use super::{ProfileCatalog, VfProfile};

/// name, ECC-off MiB, ECC-on MiB, numvfs, doorbells, ggtt bytes, exec quantum ms, preempt timeout us
type ProfileRow = (&'static str, u64, u64, u64, u64, u64, u64, u64);

const FLEX170: [ProfileRow; 6] = [
    ("flex170_m1", 15360, 13542, 1, 240, 4026531840, 64, 128000),
    ("flex170_m2", 7680, 6771, 2, 120, 2013265920, 32, 64000),
    ("flex170_m4", 3840, 3385, 4, 60, 1006632960, 16, 32000),
    ("flex170_m5", 3072, 2708, 5, 48, 805306368, 12, 24000),
    ("flex170_m8", 1920, 1692, 8, 30, 503316480, 8, 16000),
    ("flex170_m16", 960, 846, 16, 15, 251658240, 4, 8000),
];

const FLEX140: [ProfileRow; 4] = [
    ("flex140_m1", 5120, 5120, 1, 240, 4026531840, 64, 128000),
    ("flex140_m3", 1706, 1706, 3, 80, 1342177280, 22, 44000),
    ("flex140_m6", 852, 852, 6, 40, 671088640, 16, 32000),
    ("flex140_m12", 426, 426, 12, 20, 335544320, 8, 16000),
];

const MAX: [ProfileRow; 7] = [
    ("max_c1", 61440, 61440, 1, 240, 4026531840, 64, 128000),
    ("max_c2", 30720, 30720, 2, 120, 2013265920, 64, 128000),
    ("max_c4", 15360, 15360, 4, 60, 1006632960, 64, 128000),
    ("max_c8", 7680, 7680, 8, 30, 503316480, 32, 64000),
    ("max_c16", 3840, 3840, 16, 15, 251658240, 16, 32000),
    ("max_c32", 1920, 1920, 32, 7, 125829120, 8, 16000),
    ("max_c63", 974, 974, 32, 3, 63897600, 4, 8000),
];

const CONTEXTS_QUOTA: u64 = 1024;

const FLEX170_MODELS: [&str; 1] = ["0x56c0"];
const FLEX140_MODELS: [&str; 1] = ["0x56c1"];
const MAX_MODELS: [&str; 9] = [
    "0x0b69", "0x0bd0", "0x0bd5", "0x0bd6", "0x0bd7", "0x0bd8", "0x0bd9", "0x0bda", "0x0bdb",
];

fn profile_from_row(row: &ProfileRow) -> VfProfile {
    let (name, lmem_mib, lmem_ecc_mib, num_vfs, doorbells, ggtt, exec_quantum, preempt) = *row;
    VfProfile {
        name: name.to_string(),
        memory_quota_mib: lmem_mib,
        memory_quota_ecc_mib: (lmem_ecc_mib != lmem_mib).then_some(lmem_ecc_mib),
        compute_share_milli: data_model::FULL_COMPUTE_SHARE_MILLI / num_vfs,
        num_vfs,
        contexts_quota: CONTEXTS_QUOTA,
        doorbells_quota: doorbells,
        ggtt_quota: ggtt,
        exec_quantum_ms: exec_quantum,
        preempt_timeout_us: preempt,
    }
}

pub fn builtin_catalog() -> ProfileCatalog {
    let mut profiles = Vec::new();
    let mut per_model: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (rows, models) in [
        (&FLEX170[..], &FLEX170_MODELS[..]),
        (&FLEX140[..], &FLEX140_MODELS[..]),
        (&MAX[..], &MAX_MODELS[..]),
    ] {
        let names: Vec<String> = rows.iter().map(|r| r.0.to_string()).collect();
        profiles.extend(rows.iter().map(profile_from_row));
        for model in models {
            per_model.insert(model.to_string(), names.clone());
        }
    }

    ProfileCatalog::new(profiles, per_model)
}
