//! YAML configuration of the server.

use crate::Error;
use bastion_cache::Config as CacheConfig;
use bastion_hardening::{ping, validator};
use bastion_tunnel::Strength;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Server configuration, read from a YAML file.
///
/// Intervals are in seconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Root of the file storage holding certificates, binary hashes, and secret blobs.
    pub storage: PathBuf,

    /// Directory of the certificate material, relative to `storage`.
    #[serde(default = "default_certificates")]
    pub certificates: String,

    /// File holding persisted settings (the token key among them).
    pub settings: PathBuf,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_init_request_timeout")]
    pub init_request_timeout: u64,
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// `simple` or `strong`.
    #[serde(default = "default_tunnel_strength")]
    pub tunnel_strength: String,

    /// Default log level, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[serde(default)]
    pub json_logs: bool,
}

fn default_certificates() -> String {
    "certs".into()
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_init_request_timeout() -> u64 {
    60
}

fn default_liveness_interval() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    5
}

fn default_tunnel_strength() -> String {
    Strength::Strong.to_string()
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Parse a configuration and check that every value is usable.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the configuration at `path`.
    pub fn load(path: &PathBuf) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    fn validate(&self) -> Result<(), Error> {
        self.strength()?;
        for (name, value) in [
            ("refresh_interval", self.refresh_interval),
            ("init_request_timeout", self.init_request_timeout),
            ("liveness_interval", self.liveness_interval),
            ("ping_interval", self.ping_interval),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn strength(&self) -> Result<Strength, Error> {
        self.tunnel_strength
            .parse()
            .map_err(|err: String| Error::InvalidConfig(err))
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval),
            ..CacheConfig::recommended()
        }
    }

    pub fn validator(&self) -> Result<validator::Config, Error> {
        let interval = Duration::from_secs(self.ping_interval);
        Ok(validator::Config {
            init_request_timeout: Duration::from_secs(self.init_request_timeout),
            liveness_interval: Duration::from_secs(self.liveness_interval),
            tunnel_strength: self.strength()?,
            ping: ping::Config {
                interval,
                timeout: interval * 3,
            },
        })
    }
}
