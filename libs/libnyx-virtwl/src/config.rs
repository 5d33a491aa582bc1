//! Virtwl configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::memory::PAGE_SIZE;
use crate::protocol::{SEND_MAX_ALLOCS, VFD_HOST_VFD_ID_BIT, VFD_XFER_SIZE};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtwlConfig {
    /// Ring transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Id and message limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Ring transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Size of each receive slot in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// How long a blocking submission waits for ring space (milliseconds)
    #[serde(default = "default_capacity_wait_ms")]
    pub capacity_wait_ms: u64,

    /// Run completion workers on their own threads
    #[serde(default = "default_true")]
    pub spawn_workers: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            capacity_wait_ms: default_capacity_wait_ms(),
            spawn_workers: true,
        }
    }
}

impl TransportConfig {
    pub fn capacity_wait(&self) -> Duration {
        Duration::from_millis(self.capacity_wait_ms)
    }
}

/// Id and message limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Exclusive upper bound of guest-assigned ids (range starts at 1)
    #[serde(default = "default_max_guest_vfds")]
    pub max_guest_vfds: u32,

    /// Most descriptors one send may carry
    #[serde(default = "default_send_max_vfds")]
    pub send_max_vfds: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_guest_vfds: default_max_guest_vfds(),
            send_max_vfds: default_send_max_vfds(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    PAGE_SIZE as usize
}

fn default_capacity_wait_ms() -> u64 {
    1000
}

fn default_max_guest_vfds() -> u32 {
    crate::protocol::MAX_ALLOC
}

fn default_send_max_vfds() -> usize {
    SEND_MAX_ALLOCS
}

impl VirtwlConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml_str(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer = self.transport.buffer_size;
        if buffer < VFD_XFER_SIZE {
            return Err(ConfigError::Invalid("buffer_size cannot hold a message header"));
        }
        if buffer as u64 % PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid("buffer_size must be a multiple of the page size"));
        }
        if self.limits.max_guest_vfds < 2 || self.limits.max_guest_vfds > VFD_HOST_VFD_ID_BIT {
            return Err(ConfigError::Invalid("max_guest_vfds must be in 2..=0x40000000"));
        }
        if self.limits.send_max_vfds == 0 || self.limits.send_max_vfds > SEND_MAX_ALLOCS {
            return Err(ConfigError::Invalid("send_max_vfds must be in 1..=28"));
        }
        Ok(())
    }
}
