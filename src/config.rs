use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BatchError;

/// Schema version this build understands.
pub const CONFIG_VERSION: &str = "1.0";

/// Root configuration structure with versioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Configuration schema version for compatibility tracking
    pub version: String,
    /// Input and staging locations
    pub storage: StorageConfig,
    /// Per-request limits and buffering ceilings
    #[serde(default)]
    pub batching: BatchSettings,
    /// Performance tuning parameters
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// File the settings were read from; `None` when running on defaults.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

/// Storage configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// NDJSON input (supports .ndjson and .ndjson.gz), or a directory of them.
    /// Can be relative to root or absolute
    pub input_path: Option<PathBuf>,
    /// Directory receiving staged batches and the run report
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

/// Limits applied while assembling batches.
///
/// `max_item_count` and `max_byte_size` mirror the remote API's per-request
/// limits. The two `max_buffered_*` ceilings bound memory across all open
/// partitions, independent of the per-request limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSettings {
    #[serde(default = "default_max_item_count")]
    pub max_item_count: usize,
    #[serde(default = "default_max_byte_size")]
    pub max_byte_size: u64,
    /// Key for items that declare no partition (or an empty one)
    #[serde(default)]
    pub default_partition_key: String,
    #[serde(default = "default_max_buffered_items")]
    pub max_buffered_items: usize,
    #[serde(default = "default_max_buffered_batches")]
    pub max_buffered_batches: usize,
    /// Top-level JSON field holding the partition key of NDJSON records
    #[serde(default)]
    pub partition_field: Option<String>,
}

/// Performance tuning configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Channel capacity between assembler and submitter (batches in flight)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Buffer size for reading input (bytes)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_output_path() -> PathBuf {
    PathBuf::from("data/staging")
}

fn default_max_item_count() -> usize {
    500
}

fn default_max_byte_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_buffered_items() -> usize {
    50_000
}

fn default_max_buffered_batches() -> usize {
    1_000
}

fn default_channel_capacity() -> usize {
    8
}

fn default_buffer_size() -> usize {
    256 * 1024 // 256KB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BatchSettings {
    /// Rejects limits that could never produce a batch.
    pub fn validate(&self) -> std::result::Result<(), BatchError> {
        if self.max_item_count == 0 {
            return Err(BatchError::InvalidConfig(
                "max_item_count must be greater than 0".to_string(),
            ));
        }
        if self.max_byte_size == 0 {
            return Err(BatchError::InvalidConfig(
                "max_byte_size must be greater than 0".to_string(),
            ));
        }
        if self.max_buffered_items == 0 {
            return Err(BatchError::InvalidConfig(
                "max_buffered_items must be greater than 0".to_string(),
            ));
        }
        if self.max_buffered_batches == 0 {
            return Err(BatchError::InvalidConfig(
                "max_buffered_batches must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Convenience constructor for the two per-request limits; the buffering
    /// ceilings keep their defaults.
    pub fn with_limits(max_item_count: usize, max_byte_size: u64) -> Self {
        Self {
            max_item_count,
            max_byte_size,
            ..Self::default()
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_item_count: default_max_item_count(),
            max_byte_size: default_max_byte_size(),
            default_partition_key: String::new(),
            max_buffered_items: default_max_buffered_items(),
            max_buffered_batches: default_max_buffered_batches(),
            partition_field: None,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file. Falls back to defaults if file is missing.
    /// Fails fast with clear error message if YAML parsing fails.
    pub fn load_from_yaml(config_path: Option<&Path>) -> Result<Self> {
        let path = if let Some(p) = config_path {
            p.to_path_buf()
        } else {
            PathBuf::from("config.yaml")
        };

        let config_str = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e).context(format!("Failed to read config file at {:?}", path)),
        };

        let mut settings: Settings = serde_yaml::from_str(&config_str).context(format!(
            "Failed to parse config.yaml at {:?}: invalid YAML structure",
            path
        ))?;
        settings.loaded_from = Some(path);

        Ok(settings)
    }

    /// Merge CLI arguments into settings, with CLI taking precedence
    pub fn merge_with_cli(
        mut self,
        cli_input: Option<PathBuf>,
        cli_output: Option<PathBuf>,
        cli_max_items: Option<usize>,
        cli_max_bytes: Option<u64>,
        cli_partition_field: Option<String>,
    ) -> Self {
        if let Some(input) = cli_input {
            self.storage.input_path = Some(input);
        }

        if let Some(output) = cli_output {
            self.storage.output_path = output;
        }

        if let Some(max_items) = cli_max_items {
            self.batching.max_item_count = max_items;
        }

        if let Some(max_bytes) = cli_max_bytes {
            self.batching.max_byte_size = max_bytes;
        }

        if let Some(field) = cli_partition_field {
            self.batching.partition_field = Some(field);
        }

        self
    }

    /// Resolve paths relative to the project root
    pub fn resolve_paths(&mut self, root: &Path) {
        self.storage.output_path = resolve_path(&self.storage.output_path, root);

        if let Some(ref mut input_path) = self.storage.input_path {
            *input_path = resolve_path(input_path, root);
        }
    }

    /// Get the input path; error if not set
    pub fn input_path(&self) -> Result<&Path> {
        self.storage
            .input_path
            .as_deref()
            .ok_or_else(|| anyhow!("input_path is required (set via --input or config.yaml)"))
    }

    /// Persist the effective settings so a run can be reproduced.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize settings")?;
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write config snapshot to {}", path.display()))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            storage: StorageConfig {
                input_path: None,
                output_path: default_output_path(),
            },
            batching: BatchSettings::default(),
            performance: PerformanceConfig::default(),
            logging: LoggingConfig::default(),
            loaded_from: None,
        }
    }
}

/// Resolve a path to be either relative to root or return as-is if absolute
fn resolve_path(path: &Path, root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_batch_settings_are_valid() {
        assert!(BatchSettings::default().validate().is_ok());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let zero_items = BatchSettings::with_limits(0, 100);
        assert!(matches!(
            zero_items.validate(),
            Err(BatchError::InvalidConfig(msg)) if msg.contains("max_item_count")
        ));

        let zero_bytes = BatchSettings::with_limits(10, 0);
        assert!(matches!(
            zero_bytes.validate(),
            Err(BatchError::InvalidConfig(msg)) if msg.contains("max_byte_size")
        ));

        let zero_buffer = BatchSettings {
            max_buffered_batches: 0,
            ..BatchSettings::default()
        };
        assert!(zero_buffer.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_section_defaults() {
        let yaml = r#"
version: "1.0"
storage:
  input_path: in.ndjson
batching:
  max_item_count: 20
  partition_field: table
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.batching.max_item_count, 20);
        assert_eq!(settings.batching.max_byte_size, default_max_byte_size());
        assert_eq!(settings.batching.partition_field.as_deref(), Some("table"));
        assert_eq!(settings.performance.channel_capacity, 8);
        assert_eq!(settings.logging.log_level, "info");
        assert_eq!(settings.storage.output_path, PathBuf::from("data/staging"));
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("bulk_batcher_missing_config.yaml");
        let _ = fs::remove_file(&path);

        let settings = Settings::load_from_yaml(Some(&path)).unwrap();
        assert!(settings.loaded_from.is_none());
        assert_eq!(settings.version, CONFIG_VERSION);
    }

    #[test]
    fn test_cli_overrides_take_precedence() {
        let settings = Settings::default().merge_with_cli(
            Some(PathBuf::from("in.ndjson")),
            None,
            Some(7),
            Some(4096),
            Some("suffix".to_string()),
        );

        assert_eq!(settings.storage.input_path, Some(PathBuf::from("in.ndjson")));
        assert_eq!(settings.batching.max_item_count, 7);
        assert_eq!(settings.batching.max_byte_size, 4096);
        assert_eq!(settings.batching.partition_field.as_deref(), Some("suffix"));
    }

    #[test]
    fn test_resolve_paths_keeps_absolute() {
        let mut settings = Settings::default();
        let absolute = std::env::temp_dir().join("staging");
        settings.storage.output_path = absolute.clone();
        settings.storage.input_path = Some(PathBuf::from("records.ndjson"));

        let root = PathBuf::from("/work");
        settings.resolve_paths(&root);

        assert_eq!(settings.storage.output_path, absolute);
        assert_eq!(
            settings.storage.input_path,
            Some(root.join("records.ndjson"))
        );
    }
}
