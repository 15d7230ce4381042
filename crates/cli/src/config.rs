//! Configuration management for bulkcat
//!
//! Handles loading, parsing, and validation of the TOML configuration file.

use crate::usb::TransferTimeouts;
use anyhow::{Context, Result, anyhow};
use driver::DriverConfig;
use protocol::{
    DRAIN_TIMEOUT_MS, DeviceMatch, MAX_TRANSFER, PRODUCT_IDS, READ_MAX_LENGTH, READ_TIMEOUT_MS,
    VENDOR_ID, WRITES_IN_FLIGHT,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default limit on one outbound transfer (milliseconds)
const WRITE_TIMEOUT_MS: u64 = 5000;

/// bulkcat configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkcatConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub io: IoSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which device to bind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB Vendor ID to match
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: u16,

    /// USB Product IDs to match
    #[serde(default = "DeviceSettings::default_product_ids")]
    pub product_ids: Vec<u16>,

    /// Interface number to claim; the first vendor-class interface when unset
    #[serde(default)]
    pub interface: Option<u8>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_ids: Self::default_product_ids(),
            interface: None,
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> u16 {
        VENDOR_ID
    }

    fn default_product_ids() -> Vec<u16> {
        PRODUCT_IDS.to_vec()
    }
}

/// Bulk engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSettings {
    /// How long one read waits for data (milliseconds)
    #[serde(default = "IoSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// How long suspend/reset let writes finish before cancelling (milliseconds)
    #[serde(default = "IoSettings::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// How long one outbound transfer may take before it fails (milliseconds)
    #[serde(default = "IoSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Outbound transfers allowed in flight
    #[serde(default = "IoSettings::default_writes_in_flight")]
    pub writes_in_flight: usize,

    /// Largest chunk one write submits
    #[serde(default = "IoSettings::default_max_transfer")]
    pub max_transfer: usize,

    /// Size of the reusable inbound buffer
    #[serde(default = "IoSettings::default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: Self::default_read_timeout_ms(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            writes_in_flight: Self::default_writes_in_flight(),
            max_transfer: Self::default_max_transfer(),
            read_buffer_size: Self::default_read_buffer_size(),
        }
    }
}

impl IoSettings {
    fn default_read_timeout_ms() -> u64 {
        READ_TIMEOUT_MS
    }

    fn default_drain_timeout_ms() -> u64 {
        DRAIN_TIMEOUT_MS
    }

    fn default_write_timeout_ms() -> u64 {
        WRITE_TIMEOUT_MS
    }

    fn default_writes_in_flight() -> usize {
        WRITES_IN_FLIGHT
    }

    fn default_max_transfer() -> usize {
        MAX_TRANSFER
    }

    fn default_read_buffer_size() -> usize {
        READ_MAX_LENGTH
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "warn".to_string()
    }
}

impl BulkcatConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the per-user file and then the system-wide file are
    /// tried in turn.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/bulkcat/config.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BulkcatConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("bulkcat").join("config.toml")
        } else {
            PathBuf::from(".config/bulkcat/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.device.product_ids.is_empty() {
            return Err(anyhow!("device.product_ids must list at least one product"));
        }

        let io = &self.io;
        if io.read_timeout_ms == 0 {
            return Err(anyhow!("io.read_timeout_ms must be greater than 0"));
        }
        if io.write_timeout_ms == 0 {
            return Err(anyhow!("io.write_timeout_ms must be greater than 0"));
        }
        if !(1..=WRITES_IN_FLIGHT).contains(&io.writes_in_flight) {
            return Err(anyhow!(
                "io.writes_in_flight must be between 1 and {}, got {}",
                WRITES_IN_FLIGHT,
                io.writes_in_flight
            ));
        }
        if !(1..=READ_MAX_LENGTH).contains(&io.max_transfer) {
            return Err(anyhow!(
                "io.max_transfer must be between 1 and {}, got {}",
                READ_MAX_LENGTH,
                io.max_transfer
            ));
        }
        if !(1..=READ_MAX_LENGTH).contains(&io.read_buffer_size) {
            return Err(anyhow!(
                "io.read_buffer_size must be between 1 and {}, got {}",
                READ_MAX_LENGTH,
                io.read_buffer_size
            ));
        }

        Ok(())
    }

    /// Engine parameters for an attachment
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            read_timeout: Duration::from_millis(self.io.read_timeout_ms),
            drain_timeout: Duration::from_millis(self.io.drain_timeout_ms),
            writes_in_flight: self.io.writes_in_flight,
            read_buffer_size: self.io.read_buffer_size,
            max_transfer: self.io.max_transfer,
        }
    }

    /// How long the USB workers let one transfer block
    ///
    /// Inbound slices follow the read timeout so a slice only expires when
    /// the read itself has.
    pub fn transfer_timeouts(&self) -> TransferTimeouts {
        TransferTimeouts {
            inbound: Duration::from_millis(self.io.read_timeout_ms),
            outbound: Duration::from_millis(self.io.write_timeout_ms),
        }
    }

    /// Match table built from the `[device]` section
    pub fn device_match(&self) -> DeviceMatch {
        DeviceMatch {
            vendor_id: self.device.vendor_id,
            product_ids: self.device.product_ids.clone(),
            ..DeviceMatch::default()
        }
    }
}

/// Expand `~` in a user-supplied path
fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
