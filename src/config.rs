use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
    std::{net::IpAddr, path::Path, time::Duration},
};

use crate::defaults;
use crate::transport::BackendAddress;

/// Proxy configuration, loaded from a TOML file. Every field has a default,
/// so an empty file (or none at all) is a valid configuration with no
/// backends registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    #[serde(default = "defaults::address")]
    pub address: IpAddr,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Backends registered with the pool at startup.
    #[serde(default)]
    pub backends: Vec<BackendAddress>,
    #[serde(default = "defaults::max_idle_connections")]
    pub max_idle_connections: usize,
    #[serde(default = "defaults::max_allowed_error_count")]
    pub max_allowed_error_count: u32,
    #[serde(default = "defaults::interrupt_memory_limit_per_conn_bytes")]
    pub interrupt_memory_limit_per_conn_bytes: usize,
    #[serde(with = "humantime_serde", default = "defaults::handshake_timeout")]
    pub handshake_timeout: Duration,
}

impl Config {
    pub async fn load(config_path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let contents = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to read configuration from {:?}",
                    config_path.as_ref()
                )
            })?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: defaults::address(),
            port: defaults::port(),
            backends: Vec::new(),
            max_idle_connections: defaults::max_idle_connections(),
            max_allowed_error_count: defaults::max_allowed_error_count(),
            interrupt_memory_limit_per_conn_bytes:
                defaults::interrupt_memory_limit_per_conn_bytes(),
            handshake_timeout: defaults::handshake_timeout(),
        }
    }
}
