//! Configuration file support for kubelan
//!
//! Loads the daemon configuration from a TOML file.
//! Default location: /etc/kubelan/config.toml

use crate::error::{KubelanError, Result};
use crate::types::{ServiceRef, WatchSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kubelan/config.toml";

/// Largest VXLAN network identifier (24 bits)
pub const MAX_VNI: u32 = (1 << 24) - 1;

/// MTU of the overlay interface: a fixed value or inferred from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "MtuRepr", into = "MtuRepr")]
pub enum MtuSetting {
    #[default]
    Auto,
    Fixed(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MtuRepr {
    Value(u32),
    Keyword(String),
}

impl TryFrom<MtuRepr> for MtuSetting {
    type Error = String;

    fn try_from(value: MtuRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            MtuRepr::Value(mtu) => Ok(Self::Fixed(mtu)),
            MtuRepr::Keyword(s) if s.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            MtuRepr::Keyword(s) => {
                Err(format!("Invalid MTU '{}', expected integer or \"auto\"", s))
            }
        }
    }
}

impl From<MtuSetting> for MtuRepr {
    fn from(value: MtuSetting) -> Self {
        match value {
            MtuSetting::Auto => MtuRepr::Keyword("auto".to_string()),
            MtuSetting::Fixed(mtu) => MtuRepr::Value(mtu),
        }
    }
}

impl fmt::Display for MtuSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MtuSetting::Auto => f.write_str("auto"),
            MtuSetting::Fixed(mtu) => write!(f, "{}", mtu),
        }
    }
}

/// VXLAN interface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VxlanConfig {
    /// Interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// MTU, or "auto" to derive it from the interface carrying `ip`
    #[serde(default)]
    pub mtu: MtuSetting,

    /// VXLAN network identifier
    #[serde(default = "default_vni")]
    pub vni: u32,

    /// UDP destination port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// External commands run on lifecycle events. The first element is the program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub up: Vec<String>,

    #[serde(default)]
    pub change: Vec<String>,
}

/// Complete kubelan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Local VTEP address; the default route's interface address when unset
    #[serde(default)]
    pub ip: Option<IpAddr>,

    /// Namespace applied to services listed without one
    #[serde(default)]
    pub namespace: Option<String>,

    /// Services whose endpoints become overlay peers
    #[serde(default)]
    pub services: Vec<ServiceRef>,

    /// Listen address for /health and /config
    #[serde(default = "default_http_address")]
    pub http_address: String,

    #[serde(default)]
    pub vxlan: VxlanConfig,

    #[serde(default)]
    pub hooks: HooksConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_address() -> String {
    "0.0.0.0:8181".to_string()
}

fn default_interface() -> String {
    "kubelan".to_string()
}

fn default_vni() -> u32 {
    6969
}

fn default_port() -> u16 {
    4789
}

impl Default for VxlanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            mtu: MtuSetting::default(),
            vni: default_vni(),
            port: default_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ip: None,
            namespace: None,
            services: Vec::new(),
            http_address: default_http_address(),
            vxlan: VxlanConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                KubelanError::config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(KubelanError::Io(e)),
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KubelanError::config(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.vxlan.interface.is_empty() {
            return Err(KubelanError::config("vxlan.interface must not be empty"));
        }

        // IFNAMSIZ includes the trailing NUL
        if self.vxlan.interface.len() > 15 {
            return Err(KubelanError::config(format!(
                "vxlan.interface '{}' is longer than 15 characters",
                self.vxlan.interface
            )));
        }

        if self.vxlan.vni > MAX_VNI {
            return Err(KubelanError::config(format!(
                "vxlan.vni {} exceeds 24 bits",
                self.vxlan.vni
            )));
        }

        if self.vxlan.port == 0 {
            return Err(KubelanError::config("vxlan.port must be > 0"));
        }

        if let MtuSetting::Fixed(0) = self.vxlan.mtu {
            return Err(KubelanError::config("vxlan.mtu must be > 0 or \"auto\""));
        }

        Ok(())
    }

    /// Fills in `ip` from the default route when it was not configured.
    pub fn resolve_source_ip(&mut self) -> Result<IpAddr> {
        if let Some(ip) = self.ip {
            return Ok(ip);
        }

        let ip = crate::netlink::RouteSocket::new()?
            .default_source()?
            .ok_or_else(|| {
                KubelanError::config("No IP address provided and failed to guess default")
            })?;

        info!(ip = %ip, "Using default route source address");
        self.ip = Some(ip);
        Ok(ip)
    }

    /// The watch-set derived from `services` and `namespace`.
    pub fn watch_set(&self) -> WatchSet {
        WatchSet::build(&self.services, self.namespace.as_deref())
    }
}
