use std::time::Duration;

use anyhow::Result;
use data_model::GrabHints;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Machine name scoping every id this process allocates.
    #[serde(default = "default_machine")]
    pub machine: String,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub factory: FactoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Fleet-wide bound on concurrently outstanding clean builds. Absent
    /// means uncapped; dirty destruction is never subject to it.
    #[serde(default)]
    pub max_clean_vms: Option<u64>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Shell command that creates a sandbox VM. Must be configured together
    /// with `destroy_command`; with neither set, the process runs
    /// coordination only.
    #[serde(default)]
    pub create_command: Option<String>,
    #[serde(default)]
    pub destroy_command: Option<String>,
}

fn default_machine() -> String {
    "localhost".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            machine: default_machine(),
            structured_logging: false,
            factory: Default::default(),
        }
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            max_clean_vms: None,
            poll_interval_secs: default_poll_interval_secs(),
            create_command: None,
            destroy_command: None,
        }
    }
}

impl FleetConfig {
    pub fn from_path(path: &str) -> Result<FleetConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: FleetConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine.is_empty() {
            return Err(anyhow::anyhow!("machine name must not be empty"));
        }
        if self.factory.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!("poll interval must be at least one second"));
        }
        if self.factory.create_command.is_some() != self.factory.destroy_command.is_some() {
            return Err(anyhow::anyhow!(
                "create_command and destroy_command must be configured together"
            ));
        }
        Ok(())
    }

    pub fn grab_hints(&self) -> GrabHints {
        GrabHints {
            max_clean_vms: self.factory.max_clean_vms,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.factory.poll_interval_secs)
    }
}
