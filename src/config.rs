use std::{collections::BTreeMap, env, fmt::Debug, path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    claims::{
        selection::{AllocationPolicy, PolicyResource},
        HandlerSettings,
    },
    discovery::{models::ModelNames, NamingStyle},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    pub sysfs_root: String,
    pub dev_root: String,
    pub cdi_root: String,
    /// Holds the allocation state and the prepared claims record.
    pub state_dir: String,
    pub socket_path: String,
    pub registration_dir: String,
    pub driver_name: String,
    pub naming_style: NamingStyle,
    /// Seconds between rediscovery passes.
    pub discovery_interval: u64,
    /// Seconds a single discovery pass may take.
    pub discovery_timeout: u64,
    pub cleanup_registry: bool,
    pub allocation_policy: AllocationPolicy,
    pub allocation_policy_resource: PolicyResource,
    pub max_conflict_retries: u32,
    /// Seconds a prepare or unprepare may take before it gives up.
    pub request_timeout: u64,
    /// JSON object of model name to default VF memory in MiB.
    pub vf_memory_defaults_file: Option<String>,
    /// Create VFs on idle SR-IOV GPUs when a VF claim cannot be served
    /// by the existing ones.
    pub provision_vfs: bool,
    pub structured_logging: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            node_name: env::var("NODE_NAME").unwrap_or_else(|_| "localhost".to_string()),
            sysfs_root: "/sys".to_string(),
            dev_root: "/dev".to_string(),
            cdi_root: "/etc/cdi".to_string(),
            state_dir: "/var/lib/accel-allocator".to_string(),
            socket_path: "/var/lib/kubelet/plugins/accel.intel.com/plugin.sock".to_string(),
            registration_dir: "/var/lib/kubelet/plugins_registry".to_string(),
            driver_name: "accel.intel.com".to_string(),
            naming_style: NamingStyle::Machine,
            discovery_interval: 60,
            discovery_timeout: 10,
            cleanup_registry: true,
            allocation_policy: AllocationPolicy::None,
            allocation_policy_resource: PolicyResource::Memory,
            max_conflict_retries: 5,
            request_timeout: 30,
            vf_memory_defaults_file: None,
            provision_vfs: true,
            structured_logging: false,
        }
    }
}

impl AgentConfig {
    pub fn from_path(path: &str) -> Result<AgentConfig> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: AgentConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(anyhow::anyhow!("node name must not be empty"));
        }
        if self.driver_name.trim().is_empty() {
            return Err(anyhow::anyhow!("driver name must not be empty"));
        }
        for (name, value) in [
            ("discovery_interval", self.discovery_interval),
            ("discovery_timeout", self.discovery_timeout),
            ("request_timeout", self.request_timeout),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("{name} must be greater than zero"));
            }
        }
        for (name, path) in [
            ("sysfs_root", &self.sysfs_root),
            ("dev_root", &self.dev_root),
            ("cdi_root", &self.cdi_root),
            ("state_dir", &self.state_dir),
            ("socket_path", &self.socket_path),
            ("registration_dir", &self.registration_dir),
        ] {
            if !Path::new(path).is_absolute() {
                return Err(anyhow::anyhow!("{name} must be an absolute path: {path}"));
            }
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout)
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            policy: self.allocation_policy,
            resource: self.allocation_policy_resource,
            max_conflict_retries: self.max_conflict_retries,
            request_timeout: Duration::from_secs(self.request_timeout),
            ..Default::default()
        }
    }

    /// Reads the default VF memory file and keys it by model id. Names that
    /// match no known model are skipped.
    pub fn vf_memory_defaults(&self, models: &ModelNames) -> Result<BTreeMap<String, u64>> {
        let Some(path) = &self.vf_memory_defaults_file else {
            return Ok(BTreeMap::new());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read VF memory defaults {path}"))?;
        let by_name: BTreeMap<String, u64> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse VF memory defaults {path}"))?;

        let mut by_id = BTreeMap::new();
        for (name, memory_mib) in by_name {
            let ids: Vec<&str> = models.ids_named(&name).collect();
            if ids.is_empty() {
                warn!(model = %name, "unknown model in VF memory defaults");
            }
            for id in ids {
                by_id.insert(id.to_string(), memory_mib);
            }
        }
        Ok(by_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "node_name: worker-3\nnaming_style: classic\nallocation_policy: packed\nallocation_policy_resource: millicores\ncleanup_registry: false\nprovision_vfs: false\n",
        )
        .unwrap();

        let config = AgentConfig::from_path(path.to_str().unwrap()).unwrap();
        assert_eq!(config.node_name, "worker-3");
        assert_eq!(config.naming_style, NamingStyle::Classic);
        assert_eq!(config.allocation_policy, AllocationPolicy::Packed);
        assert_eq!(config.allocation_policy_resource, PolicyResource::Millicores);
        assert!(!config.cleanup_registry);
        assert!(!config.provision_vfs);
        assert!(AgentConfig::default().provision_vfs);
        assert_eq!(config.cdi_root, "/etc/cdi");
        assert_eq!(config.discovery_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate() {
        struct Case {
            name: &'static str,
            config: AgentConfig,
            valid: bool,
        }
        let cases = [
            Case {
                name: "defaults",
                config: AgentConfig {
                    node_name: "n".to_string(),
                    ..Default::default()
                },
                valid: true,
            },
            Case {
                name: "empty node name",
                config: AgentConfig {
                    node_name: " ".to_string(),
                    ..Default::default()
                },
                valid: false,
            },
            Case {
                name: "zero timeout",
                config: AgentConfig {
                    node_name: "n".to_string(),
                    request_timeout: 0,
                    ..Default::default()
                },
                valid: false,
            },
            Case {
                name: "relative path",
                config: AgentConfig {
                    node_name: "n".to_string(),
                    cdi_root: "etc/cdi".to_string(),
                    ..Default::default()
                },
                valid: false,
            },
        ];
        for case in cases {
            assert_eq!(case.config.validate().is_ok(), case.valid, "{}", case.name);
        }
    }

    #[test]
    fn test_vf_memory_defaults_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defaults.json");
        std::fs::write(&path, r#"{"flex170": 4096, "nonexistent": 1}"#).unwrap();
        let config = AgentConfig {
            vf_memory_defaults_file: Some(path.display().to_string()),
            ..Default::default()
        };

        let defaults = config.vf_memory_defaults(&ModelNames::builtin()).unwrap();
        assert_eq!(defaults.get("0x56c0"), Some(&4096));
        assert_eq!(defaults.len(), 1);
    }
}
