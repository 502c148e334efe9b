//! Device UIDs.
//!
//! A UID is the PCI bus address with its separators replaced by hyphens,
//! followed by the hardware model id: `0000:03:00.1` + `0x56c0` becomes
//! `0000-03-00-1-0x56c0`. The result only contains lowercase alphanumerics
//! and hyphens, so it can be used as an RFC1123 label.

use anyhow::{anyhow, bail, Result};

/// Length of the address part of a UID (`dddd-bb-ss-f`).
const ADDRESS_LEN: usize = 12;

pub fn uid_from_address(bus_address: &str, model: &str) -> String {
    format!("{}-{}", bus_address.replace([':', '.'], "-"), model)
}

/// Splits a UID back into its bus address and model id.
pub fn decode_uid(uid: &str) -> Result<(String, String)> {
    Ok((address_from_uid(uid)?, model_from_uid(uid)?))
}

pub fn address_from_uid(uid: &str) -> Result<String> {
    let encoded = uid
        .get(..ADDRESS_LEN)
        .ok_or_else(|| anyhow!("uid {uid} is too short to contain a bus address"))?;
    let parts: Vec<&str> = encoded.split('-').collect();
    let [domain, bus, slot, function] = parts.as_slice() else {
        bail!("uid {uid} does not start with a bus address");
    };
    let address = format!("{domain}:{bus}:{slot}.{function}");
    if !is_bus_address(&address) {
        bail!("uid {uid} does not start with a bus address");
    }
    Ok(address)
}

pub fn model_from_uid(uid: &str) -> Result<String> {
    match uid.get(ADDRESS_LEN..) {
        Some(rest) if rest.len() > 1 && rest.starts_with('-') => Ok(rest[1..].to_string()),
        _ => Err(anyhow!("uid {uid} has no model id")),
    }
}

/// UID of a virtual function's parent, given the parent's bus address. The
/// parent shares the model id with its virtual functions.
pub fn parent_uid(parent_bus_address: &str, vf_uid: &str) -> Result<String> {
    Ok(uid_from_address(parent_bus_address, &model_from_uid(vf_uid)?))
}

/// Placeholder UID of a virtual function that is still to be created on
/// `parent_uid`. It is replaced by the real UID once the VF shows up.
pub fn planned_vf_uid(parent_uid: &str, vf_index: u64) -> String {
    format!("{parent_uid}-vf{vf_index}")
}

/// Matches `dddd:bb:ss.f` with lowercase hex digits and a function in 0-7.
pub fn is_bus_address(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    if bytes.len() != ADDRESS_LEN {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b':',
        10 => *b == b'.',
        11 => (b'0'..=b'7').contains(b),
        _ => b.is_ascii_digit() || (b'a'..=b'f').contains(b),
    })
}

pub fn is_rfc1123_label(candidate: &str) -> bool {
    !candidate.is_empty() &&
        candidate.len() <= 63 &&
        !candidate.starts_with('-') &&
        !candidate.ends_with('-') &&
        candidate
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_round_trip() {
        struct Case {
            address: &'static str,
            model: &'static str,
            uid: &'static str,
        }

        let cases = [
            Case {
                address: "0000:00:01.0",
                model: "0x0000",
                uid: "0000-00-01-0-0x0000",
            },
            Case {
                address: "0000:b3:00.7",
                model: "0x56c0",
                uid: "0000-b3-00-7-0x56c0",
            },
            Case {
                address: "0001:4d:1f.3",
                model: "0x0bd5",
                uid: "0001-4d-1f-3-0x0bd5",
            },
        ];

        for case in cases {
            let uid = uid_from_address(case.address, case.model);
            assert_eq!(uid, case.uid);
            assert!(is_rfc1123_label(&uid));
            let (address, model) = decode_uid(&uid).unwrap();
            assert_eq!(address, case.address);
            assert_eq!(model, case.model);
        }
    }

    #[test]
    fn test_decode_rejects_malformed_uids() {
        assert!(address_from_uid("0000-00").is_err());
        assert!(address_from_uid("card0-0x56c0-xyz").is_err());
        assert!(model_from_uid("0000-00-01-0").is_err());
        assert!(model_from_uid("0000-00-01-0-").is_err());
    }

    #[test]
    fn test_parent_uid() {
        let parent = parent_uid("0000:03:00.0", "0000-03-00-1-0x56c0").unwrap();
        assert_eq!(parent, "0000-03-00-0-0x56c0");
    }

    #[test]
    fn test_planned_vf_uid_is_a_label() {
        let uid = planned_vf_uid("0000-03-00-0-0x56c0", 3);
        assert_eq!(uid, "0000-03-00-0-0x56c0-vf3");
        assert!(is_rfc1123_label(&uid));
        assert_eq!(address_from_uid(&uid).unwrap(), "0000:03:00.0");
    }

    #[test]
    fn test_bus_address_pattern() {
        assert!(is_bus_address("0000:03:00.0"));
        assert!(!is_bus_address("0000:03:00.8"));
        assert!(!is_bus_address("0000:03:0G.0"));
        assert!(!is_bus_address("0000:03:00.0x"));
        assert!(!is_bus_address("sriov_totalvfs"));
    }
}
