//! Daemon Configuration
//!
//! Configuration is read from `<config_dir>/mconnect/mconnect.toml`. A missing
//! file means defaults; every section and key is optional.

use anyhow::{Context, Result};
use mconnect_protocol::ports::TCP_PORT_MIN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the configuration file
const CONFIG_FILE: &str = "mconnect.toml";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub main: MainConfig,

    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    pub network: NetworkConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// General settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MainConfig {
    /// Log at debug level
    pub debug: bool,

    /// Device ids allowed to connect, empty allows everyone
    pub devices: Vec<String>,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (computer, desktop, laptop, phone, tablet, tv)
    pub device_type: String,

    /// Device ID (derived from the hostname if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Discovery broadcast interval in seconds
    pub discovery_interval: u64,

    /// TCP port connections are accepted on
    pub tcp_port: u16,

    /// Also listen for announcements on the legacy discovery port
    pub listen_legacy_port: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Certificate directory
    pub cert_dir: PathBuf,
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("mconnect")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: hostname(),
            device_type: "computer".to_string(),
            device_id: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_interval: 5,
            tcp_port: TCP_PORT_MIN,
            listen_legacy_port: true,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            cert_dir: config_dir().join("certs"),
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    /// Load configuration from `path`, or from the default location
    ///
    /// A file that does not exist yields the defaults. A file that exists but
    /// cannot be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Device id announced to peers
    pub fn device_id(&self) -> String {
        self.device
            .device_id
            .clone()
            .unwrap_or_else(|| format!("mconnect-{}", hostname()))
    }

    /// Whether a peer may connect
    pub fn is_allowed(&self, device_id: &str) -> bool {
        self.main.devices.is_empty() || self.main.devices.iter().any(|id| id == device_id)
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    /// Get the certificate path for this device
    pub fn certificate_path(&self) -> PathBuf {
        self.paths.cert_dir.join("device.crt")
    }

    /// Get the private key path for this device
    pub fn private_key_path(&self) -> PathBuf {
        self.paths.cert_dir.join("device.key")
    }
}
