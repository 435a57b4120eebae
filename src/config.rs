use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::types::env::HealthSettings;

const ENV_PREFIX: &str = "KUBEVISOR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Settings of a bring-up. Layered: defaults, then an optional TOML file,
/// then `KUBEVISOR_*` environment variables; CLI flags are applied last by
/// the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub binary_root: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub port_base: u16,
    pub listen_address: IpAddr,
    pub service_address: IpAddr,
    pub dns_address: IpAddr,
    pub sudo_method: Option<String>,
    pub health_check_tries: u32,
    pub health_check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub stop_grace_period_ms: u64,
    pub print_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary_root: None,
            workdir: None,
            port_base: 7000,
            listen_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            service_address: IpAddr::V4(Ipv4Addr::new(127, 1, 1, 1)),
            dns_address: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            sudo_method: Some("sudo".to_string()),
            health_check_tries: 30,
            health_check_interval_ms: 1000,
            probe_timeout_ms: 2000,
            stop_grace_period_ms: 5000,
            print_output: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Reads `path` (when given) and then applies the environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields from `KUBEVISOR_<FIELD>` variables found by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("BINARY_ROOT") {
            self.binary_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("WORKDIR") {
            self.workdir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("SUDO_METHOD") {
            self.sudo_method = Some(v).filter(|s| !s.is_empty());
        }
        parse_into(&var, "PORT_BASE", &mut self.port_base)?;
        parse_into(&var, "LISTEN_ADDRESS", &mut self.listen_address)?;
        parse_into(&var, "SERVICE_ADDRESS", &mut self.service_address)?;
        parse_into(&var, "DNS_ADDRESS", &mut self.dns_address)?;
        parse_into(&var, "HEALTH_CHECK_TRIES", &mut self.health_check_tries)?;
        parse_into(&var, "HEALTH_CHECK_INTERVAL_MS", &mut self.health_check_interval_ms)?;
        parse_into(&var, "PROBE_TIMEOUT_MS", &mut self.probe_timeout_ms)?;
        parse_into(&var, "STOP_GRACE_PERIOD_MS", &mut self.stop_grace_period_ms)?;
        parse_into(&var, "PRINT_OUTPUT", &mut self.print_output)?;
        Ok(())
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            tries: self.health_check_tries,
            interval: Duration::from_millis(self.health_check_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

fn parse_into<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(value) = var(name) else {
        return Ok(());
    };
    *slot = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{}{}", ENV_PREFIX, name),
        value,
    })?;
    Ok(())
}
