//! Configuration loading and validation
//!
//! Configuration is a JSON file, by default `<XDG config dir>/config.json`.
//! Every field has a documented default, so a missing file is a valid
//! configuration; a malformed file or an invalid value is an error.

use crate::core::error::{Error, Result};
use crate::core::firewall::PortSpec;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Longest timeout accepted for a single external call
const MAX_TIMEOUT_SECS: u64 = 600;
/// Retries are bounded; a stuck store must not stall a cycle
const MAX_RETRIES: u32 = 3;
const MIN_INTERVAL_SECS: u64 = 60;

const OCI_AUTH_METHODS: [&str; 5] = [
    "api_key",
    "instance_principal",
    "resource_principal",
    "security_token",
    "instance_obo_user",
];

/// Complete portsync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Target security list (OCID); `None` skips the cloud store
    pub security_list_id: Option<String>,
    /// Ports that are always desired, regardless of discovery
    pub baseline_ports: Vec<PortSpec>,
    /// Caddy admin API `host:port`; `None` disables gateway discovery
    pub gateway_endpoint: Option<String>,
    pub discover_containers: bool,
    /// Dedicated iptables chain
    pub chain: String,
    /// Chain that jumps to `chain`
    pub parent_chain: String,
    /// Save iptables rules after changes
    pub persist: bool,
    /// Fallback rules file when `netfilter-persistent` is unavailable
    pub persist_path: PathBuf,
    /// Also keep egress rules in the security list
    pub sync_egress: bool,
    pub command_timeout_secs: u64,
    pub http_timeout_secs: u64,
    /// Extra attempts for a transient failure
    pub retries: u32,
    /// Scheduler interval
    pub interval_secs: u64,
    /// Path or name of the OCI CLI binary
    pub oci_cli: String,
    pub oci_profile: Option<String>,
    /// `--auth` method, e.g. `instance_principal`
    pub oci_auth: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            security_list_id: None,
            baseline_ports: vec![PortSpec::tcp(22), PortSpec::tcp(80), PortSpec::tcp(443)],
            gateway_endpoint: Some("127.0.0.1:2019".to_string()),
            discover_containers: true,
            chain: "PORTSYNC".to_string(),
            parent_chain: "INPUT".to_string(),
            persist: true,
            persist_path: PathBuf::from("/etc/iptables/rules.v4"),
            sync_egress: true,
            command_timeout_secs: 30,
            http_timeout_secs: 5,
            retries: 1,
            interval_secs: 600,
            oci_cli: "oci".to_string(),
            oci_profile: None,
            oci_auth: None,
        }
    }
}

impl Config {
    /// Checks every field; the first problem found is returned.
    pub fn validate(&self) -> Result<()> {
        use crate::validators::{validate_chain_name, validate_endpoint, validate_security_list_id};

        if let Some(id) = &self.security_list_id {
            validate_security_list_id(id).map_err(|e| Error::config("security_list_id", e))?;
        }
        if let Some(endpoint) = &self.gateway_endpoint {
            validate_endpoint(endpoint).map_err(|e| Error::config("gateway_endpoint", e))?;
        }
        validate_chain_name(&self.chain).map_err(|e| Error::config("chain", e))?;
        validate_chain_name(&self.parent_chain).map_err(|e| Error::config("parent_chain", e))?;
        if self.chain == self.parent_chain {
            return Err(Error::config("chain", "must differ from parent_chain"));
        }
        if !self.persist_path.is_absolute() {
            return Err(Error::config("persist_path", "must be an absolute path"));
        }
        for (field, value) in [
            ("command_timeout_secs", self.command_timeout_secs),
            ("http_timeout_secs", self.http_timeout_secs),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECS {
                return Err(Error::config(
                    field,
                    format!("must be between 1 and {MAX_TIMEOUT_SECS}"),
                ));
            }
        }
        if self.retries > MAX_RETRIES {
            return Err(Error::config(
                "retries",
                format!("at most {MAX_RETRIES} retries are allowed"),
            ));
        }
        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(Error::config(
                "interval_secs",
                format!("must be at least {MIN_INTERVAL_SECS}"),
            ));
        }
        if self.oci_cli.trim().is_empty() {
            return Err(Error::config("oci_cli", "cannot be empty"));
        }
        if let Some(profile) = &self.oci_profile
            && profile.trim().is_empty()
        {
            return Err(Error::config("oci_profile", "cannot be empty"));
        }
        if let Some(auth) = &self.oci_auth
            && !OCI_AUTH_METHODS.contains(&auth.as_str())
        {
            return Err(Error::config(
                "oci_auth",
                format!("must be one of {}", OCI_AUTH_METHODS.join(", ")),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// `<XDG config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads and validates the configuration.
///
/// `path` is an explicit location (`--config` / `PORTSYNC_CONFIG`), which
/// must exist. Without it the default location is used and a missing file
/// yields the defaults.
pub async fn load_config(path: Option<&Path>) -> Result<Config> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return Ok(Config::default()),
        },
    };

    let config = match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str::<Config>(&json)
            .map_err(|e| Error::config(path.display().to_string(), e.to_string()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            debug!("No config at {}, using defaults", path.display());
            Config::default()
        }
        Err(e) => {
            return Err(Error::config(path.display().to_string(), e.to_string()));
        }
    };

    config.validate()?;
    Ok(config)
}
