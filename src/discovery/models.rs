//! Hardware model ids and their human-readable names.

use std::collections::BTreeMap;

use data_model::DeviceFamily;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub family_name: String,
    pub family: DeviceFamily,
}

/// Lookup table from model id (`0x56c0`) to its names. Built once at start-up
/// and passed to discovery.
#[derive(Debug, Clone, Default)]
pub struct ModelNames {
    models: BTreeMap<String, ModelInfo>,
}

const GPU_MODELS: [(&str, &str); 9] = [
    ("0x56c0", "flex170"),
    ("0x56c1", "flex140"),
    ("0x0b69", "max1550"),
    ("0x0bd0", "max1550"),
    ("0x0bd5", "max1550"),
    ("0x0bd6", "max1450"),
    ("0x0bd9", "max1100"),
    ("0x0bda", "max1100"),
    ("0x0bdb", "max1100"),
];

const GAUDI_MODELS: [(&str, &str); 9] = [
    ("0x1000", "Gaudi"),
    ("0x1001", "Gaudi"),
    ("0x1010", "Gaudi"),
    ("0x1011", "Gaudi"),
    ("0x1020", "Gaudi2"),
    ("0x1030", "Gaudi3"),
    ("0x1060", "Gaudi3"),
    ("0x1061", "Gaudi3"),
    ("0x1062", "Gaudi3"),
];

const QAT_MODELS: [(&str, &str); 6] = [
    ("0x4940", "4xxx"),
    ("0x4941", "4xxxvf"),
    ("0x4942", "401xx"),
    ("0x4943", "401xxvf"),
    ("0x4944", "402xx"),
    ("0x4945", "402xxvf"),
];

impl ModelNames {
    pub fn builtin() -> Self {
        let mut names = Self::default();
        for (id, name) in GPU_MODELS {
            let family_name = if name.starts_with("flex") {
                "Data Center Flex"
            } else {
                "Data Center Max"
            };
            names.insert(id, name, family_name, DeviceFamily::Gpu);
        }
        for (id, name) in GAUDI_MODELS {
            names.insert(id, name, "Gaudi", DeviceFamily::Gaudi);
        }
        for (id, name) in QAT_MODELS {
            names.insert(id, name, "QuickAssist", DeviceFamily::Qat);
        }
        names
    }

    pub fn insert(&mut self, id: &str, name: &str, family_name: &str, family: DeviceFamily) {
        self.models.insert(
            id.to_lowercase(),
            ModelInfo {
                name: name.to_string(),
                family_name: family_name.to_string(),
                family,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.get(&id.to_lowercase())
    }

    /// Model name, or "Unknown" for an id missing from the table.
    pub fn name_of(&self, id: &str) -> &str {
        self.get(id).map(|m| m.name.as_str()).unwrap_or("Unknown")
    }

    pub fn family_name_of(&self, id: &str) -> &str {
        self.get(id)
            .map(|m| m.family_name.as_str())
            .unwrap_or("Unknown")
    }

    /// Every model id carrying `name`. Several ids can share one name.
    pub fn ids_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.models
            .iter()
            .filter(move |(_, info)| info.name == name)
            .map(|(id, _)| id.as_str())
    }
}
