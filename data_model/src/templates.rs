//! Device templates describe a node's devices for fixtures: a JSON object
//! keyed by a human-readable slot name (`"card0"`, `"accel1"`), each value
//! holding DeviceDescriptor fields. A missing `uid` is derived from the bus
//! address and model.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{uid, DeviceDescriptor, DeviceKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateEntry {
    #[serde(default)]
    uid: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceTemplate {
    pub slots: BTreeMap<String, DeviceDescriptor>,
}

impl DeviceTemplate {
    pub fn parse(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, TemplateEntry> =
            serde_json::from_str(json).context("device template is not a JSON object")?;

        let mut slots = BTreeMap::new();
        for (slot, entry) in raw {
            let mut fields = entry.rest;
            let bus_address = fields
                .get("busAddress")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .with_context(|| format!("slot {slot} has no busAddress"))?;
            let model = fields
                .get("model")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .with_context(|| format!("slot {slot} has no model"))?;
            let uid = entry
                .uid
                .unwrap_or_else(|| uid::uid_from_address(&bus_address, &model));
            fields.insert("uid".to_string(), serde_json::Value::String(uid));

            let descriptor: DeviceDescriptor =
                serde_json::from_value(serde_json::Value::Object(fields))
                    .with_context(|| format!("slot {slot} has invalid device fields"))?;
            if descriptor.kind == DeviceKind::VirtualFunction && descriptor.parent_uid.is_none() {
                bail!("slot {slot} is a virtual function without a parentUid");
            }
            slots.insert(slot, descriptor);
        }
        Ok(Self { slots })
    }

    pub fn devices(&self) -> impl Iterator<Item = (&str, &DeviceDescriptor)> {
        self.slots.iter().map(|(slot, d)| (slot.as_str(), d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceFamily;

    #[test]
    fn test_parse_template() {
        let template = DeviceTemplate::parse(
            r#"{
                "card0": {"busAddress": "0000:03:00.0", "model": "0x56c0", "memoryMib": 16384, "maxVirtualFunctions": 16},
                "card1": {"busAddress": "0000:03:00.1", "model": "0x56c0", "kind": "virtual-function",
                          "parentUid": "0000-03-00-0-0x56c0", "virtualFunctionIndex": 0},
                "accel0": {"uid": "custom-uid", "busAddress": "0000:1a:00.0", "model": "0x1020", "family": "gaudi"}
            }"#,
        )
        .unwrap();

        assert_eq!(template.slots.len(), 3);
        let card0 = &template.slots["card0"];
        assert_eq!(card0.uid, "0000-03-00-0-0x56c0");
        assert_eq!(card0.compute_share_milli, 1000);
        assert!(card0.healthy);
        assert!(card0.supports_virtual_functions());

        assert!(template.slots["card1"].is_virtual_function());
        assert_eq!(template.slots["accel0"].uid, "custom-uid");
        assert_eq!(template.slots["accel0"].family, DeviceFamily::Gaudi);
    }

    #[test]
    fn test_template_rejects_orphan_vf() {
        let err = DeviceTemplate::parse(
            r#"{"card1": {"busAddress": "0000:03:00.1", "model": "0x56c0", "kind": "virtual-function"}}"#,
        );
        assert!(err.is_err());
        assert!(DeviceTemplate::parse(r#"{"card0": {"model": "0x56c0"}}"#).is_err());
    }
}
