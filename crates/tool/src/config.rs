//! Tool configuration management

use anyhow::{Context, Result, anyhow};
use pipe::{PipeConfig, PipeOptions, PumpSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub pipe: PipeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Device to open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface number to claim
    #[serde(default)]
    pub interface: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x0c72, // PEAK-System
            product_id: 0x000c, // PCAN-USB
            interface: 0,
        }
    }
}

/// Pipe runtime sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeSettings {
    /// Bytes per half of the transfer double buffer
    #[serde(default = "PipeSettings::default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "PipeSettings::default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "PipeSettings::default_element_size")]
    pub element_size: usize,
    /// Deliver raw packets through the byte stream instead of the queue
    #[serde(default)]
    pub byte_stream: bool,
    /// Timeout of each bulk read in the read pump
    #[serde(default = "PipeSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            queue_capacity: Self::default_queue_capacity(),
            element_size: Self::default_element_size(),
            byte_stream: false,
            read_timeout_ms: Self::default_read_timeout_ms(),
        }
    }
}

impl PipeSettings {
    fn default_buffer_size() -> usize {
        512
    }

    fn default_queue_capacity() -> usize {
        1024
    }

    fn default_element_size() -> usize {
        64 // one full-speed bulk packet
    }

    fn default_read_timeout_ms() -> u64 {
        100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ToolConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/canusb/tool.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ToolConfig = toml::from_str(&content)
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
            config_dir.join("canusb").join("tool.toml")
        } else {
            PathBuf::from(".config/canusb/tool.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let pipe = &self.pipe;
        for (name, value) in [
            ("buffer_size", pipe.buffer_size),
            ("queue_capacity", pipe.queue_capacity),
            ("element_size", pipe.element_size),
        ] {
            if value == 0 {
                return Err(anyhow!("pipe.{} must not be zero", name));
            }
        }
        if pipe.element_size > pipe.buffer_size {
            return Err(anyhow!(
                "pipe.element_size ({}) exceeds pipe.buffer_size ({})",
                pipe.element_size,
                pipe.buffer_size
            ));
        }
        if pipe.read_timeout_ms == 0 {
            return Err(anyhow!("pipe.read_timeout_ms must not be zero"));
        }

        Ok(())
    }

    /// Runtime configuration for an inbound pipe
    pub fn pipe_config(&self) -> PipeConfig {
        let options = if self.pipe.byte_stream {
            PipeOptions::BYTE_STREAM
        } else {
            PipeOptions::RX_QUEUE
        };
        PipeConfig {
            buffer_size: self.pipe.buffer_size,
            queue_capacity: self.pipe.queue_capacity,
            element_size: self.pipe.element_size,
            options,
        }
    }

    /// Runtime configuration for an outbound pipe
    pub fn tx_pipe_config(&self) -> PipeConfig {
        PipeConfig {
            options: PipeOptions::TX_QUEUE,
            ..self.pipe_config()
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            read_timeout: Duration::from_millis(self.pipe.read_timeout_ms),
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ToolConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.device.interface, 0);
        assert!(!config.pipe.byte_stream);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
[device]
vendor_id = 0x1234
product_id = 0x5678
interface = 1

[pipe]
buffer_size = 1024
queue_capacity = 256
element_size = 16
byte_stream = true
read_timeout_ms = 50

[logging]
level = "debug"
"#,
        );

        let config = ToolConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.device.vendor_id, 0x1234);
        assert_eq!(config.device.product_id, 0x5678);
        assert_eq!(config.device.interface, 1);
        assert_eq!(config.pipe.queue_capacity, 256);
        assert_eq!(config.logging.level, "debug");

        let pipe_config = config.pipe_config();
        assert_eq!(pipe_config.options, PipeOptions::BYTE_STREAM);
        assert_eq!(pipe_config.element_size, 16);
        assert_eq!(
            config.pump_settings().read_timeout,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_tx_pipe_config() {
        let mut config = ToolConfig::default();
        config.pipe.byte_stream = true;
        let tx = config.tx_pipe_config();
        assert_eq!(tx.options, PipeOptions::TX_QUEUE);
        assert_eq!(tx.element_size, config.pipe.element_size);
        assert_eq!(tx.queue_capacity, config.pipe.queue_capacity);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let file = write_config(
            r#"
[pipe]
element_size = 8
"#,
        );

        let config = ToolConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.pipe.element_size, 8);
        assert_eq!(config.pipe.buffer_size, 512);
        assert_eq!(config.device.vendor_id, 0x0c72);
        assert_eq!(config.pipe_config().options, PipeOptions::RX_QUEUE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = write_config("[pipe]\nqueue_capacity = 0\n");
        assert!(ToolConfig::load(Some(zero.path().to_path_buf())).is_err());

        let oversized = write_config("[pipe]\nbuffer_size = 8\nelement_size = 16\n");
        assert!(ToolConfig::load(Some(oversized.path().to_path_buf())).is_err());

        let level = write_config("[logging]\nlevel = \"verbose\"\n");
        assert!(ToolConfig::load(Some(level.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ToolConfig::load(Some(dir.path().join("missing.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tool.toml");

        let mut config = ToolConfig::default();
        config.pipe.byte_stream = true;
        config.device.interface = 2;
        config.save(&path).unwrap();

        let loaded = ToolConfig::load(Some(path)).unwrap();
        assert!(loaded.pipe.byte_stream);
        assert_eq!(loaded.device.interface, 2);
    }

    #[test]
    fn test_expand_path_keeps_absolute() {
        let path = Path::new("/etc/canusb/tool.toml");
        assert_eq!(expand_path(path), PathBuf::from("/etc/canusb/tool.toml"));
    }
}
