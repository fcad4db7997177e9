//! Configuration system using Figment
//!
//! Strongly-typed configuration for sessions, protocol timing and the static
//! firmware catalog. Configuration is loaded from:
//! 1. `config/tsp_firmware.toml` (base configuration)
//! 2. Environment variables (prefixed with `TSP_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! TSP_APPLICATION__LOG_LEVEL=debug
//! TSP_SESSION__ADDRESS=192.168.0.50:5025
//! TSP_PROTOCOL__TIMEOUT_POLICY=return_failure
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tsp_firmware::config::TspConfig;
//!
//! let config = TspConfig::load()?;
//! println!("Scripts in catalog: {}", config.scripts.len());
//! # Ok::<(), tsp_firmware::config::ConfigError>(())
//! ```

use crate::error_recovery::RetryPolicy;
use crate::firmware::TimeoutPolicy;
use crate::script::{DeployFileFormat, FirmwareScript};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TspConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Transport and session timing
    #[serde(default)]
    pub session: SessionConfig,
    /// Script protocol timing and policies
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Static firmware catalog
    #[serde(default)]
    pub scripts: Vec<ScriptDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Folder that relative script folders are resolved against
    #[serde(default)]
    pub firmware_root: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "tsp_deploy".to_string(),
            log_level: "info".to_string(),
            firmware_root: None,
            json_logs: false,
        }
    }
}

/// Transport and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Raw-socket address of the controller instrument (host:port)
    #[serde(default = "default_address")]
    pub address: String,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per read/write timeout in milliseconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    /// Delay after each write before the next read, in milliseconds
    #[serde(default = "default_read_after_write_delay")]
    pub read_after_write_delay_ms: u64,
    /// Delay between status byte polls, in milliseconds
    #[serde(default = "default_status_read_delay")]
    pub status_read_delay_ms: u64,
    /// Retry policy for unparsable query replies
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            read_after_write_delay_ms: default_read_after_write_delay(),
            status_read_delay_ms: default_status_read_delay(),
            retry: RetryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Session timing with every delay set to zero, for simulators.
    pub fn immediate() -> Self {
        Self {
            read_after_write_delay_ms: 0,
            status_read_delay_ms: 1,
            retry: RetryConfig {
                max_attempts: 2,
                backoff_ms: 0,
            },
            ..Self::default()
        }
    }

    /// Read-after-write delay as a [`Duration`].
    pub fn read_after_write_delay(&self) -> Duration {
        Duration::from_millis(self.read_after_write_delay_ms)
    }

    /// Status read delay as a [`Duration`].
    pub fn status_read_delay(&self) -> Duration {
        Duration::from_millis(self.status_read_delay_ms)
    }

    /// I/O timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Retry settings, converted into a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts for a query
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(value: RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: value.max_attempts.max(1),
            backoff_delay: Duration::from_millis(value.backoff_ms),
        }
    }
}

/// Script protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Wait for the `endscript` completion sentinel, in milliseconds
    #[serde(default = "default_load_completion_timeout")]
    pub load_completion_timeout_ms: u64,
    /// Wait for an uploaded script name to resolve on the remote node
    #[serde(default = "default_upload_verify_timeout")]
    pub upload_verify_timeout_ms: u64,
    /// Wait for `*OPC` driven service requests
    #[serde(default = "default_operation_completion_timeout")]
    pub operation_completion_timeout_ms: u64,
    /// Delay between lines of a binary loader payload
    #[serde(default = "default_loader_line_delay")]
    pub loader_line_delay_ms: u64,
    /// Time granted to a boot script run after a batch save
    #[serde(default = "default_boot_script_grace")]
    pub boot_script_grace_ms: u64,
    /// What to do when a bounded poll expires
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    /// Namespace whose presence means the upload helper is resident
    #[serde(default = "default_support_namespace")]
    pub support_namespace: String,
    /// Fully qualified name of the resident upload helper
    #[serde(default = "default_upload_helper")]
    pub upload_helper: String,
    /// Warn when a node data queue holds stale items before a transfer
    #[serde(default = "default_true")]
    pub warn_on_stale_data_queue: bool,
    /// Allow replacing an existing `.trimmed.tsp` debug copy
    #[serde(default)]
    pub overwrite_trimmed: bool,
    /// Keep leading indentation when streaming script lines
    #[serde(default)]
    pub retain_outline: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            load_completion_timeout_ms: default_load_completion_timeout(),
            upload_verify_timeout_ms: default_upload_verify_timeout(),
            operation_completion_timeout_ms: default_operation_completion_timeout(),
            loader_line_delay_ms: default_loader_line_delay(),
            boot_script_grace_ms: default_boot_script_grace(),
            timeout_policy: TimeoutPolicy::default(),
            support_namespace: default_support_namespace(),
            upload_helper: default_upload_helper(),
            warn_on_stale_data_queue: true,
            overwrite_trimmed: false,
            retain_outline: false,
        }
    }
}

impl ProtocolConfig {
    /// Protocol timing suitable for the in-process simulator.
    pub fn immediate() -> Self {
        Self {
            load_completion_timeout_ms: 200,
            upload_verify_timeout_ms: 50,
            operation_completion_timeout_ms: 200,
            loader_line_delay_ms: 0,
            boot_script_grace_ms: 0,
            ..Self::default()
        }
    }

    /// `endscript` completion timeout.
    pub fn load_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.load_completion_timeout_ms)
    }

    /// Upload verification timeout.
    pub fn upload_verify_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_verify_timeout_ms)
    }

    /// Operation completion timeout.
    pub fn operation_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_completion_timeout_ms)
    }

    /// Loader inter-line delay.
    pub fn loader_line_delay(&self) -> Duration {
        Duration::from_millis(self.loader_line_delay_ms)
    }

    /// Boot script grace period.
    pub fn boot_script_grace(&self) -> Duration {
        Duration::from_millis(self.boot_script_grace_ms)
    }
}

/// A firmware catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Script name as created on the instrument
    pub name: String,
    /// Source file name, e.g. `core.tsp`
    pub file_name: String,
    /// Folder holding the source file
    #[serde(default)]
    pub folder_path: PathBuf,
    /// Name of the embedded or release resource the file is built from
    #[serde(default)]
    pub resource_file_name: Option<String>,
    /// Whether this script runs at power up
    #[serde(default)]
    pub is_boot_script: bool,
    /// Convert to byte code before saving
    #[serde(default)]
    pub convert_to_byte_code: bool,
    /// Deploy format flags (`binary`, `compressed`)
    #[serde(default)]
    pub deploy_formats: Vec<String>,
    /// Namespace the script defines when run
    #[serde(default)]
    pub top_namespace: Option<String>,
    /// Nodes the script is deployed to; empty means controller only
    #[serde(default)]
    pub nodes: Vec<u32>,
}

impl ScriptDefinition {
    /// Builds the [`FirmwareScript`] described by this entry.
    pub fn to_script(&self, firmware_root: Option<&Path>) -> FirmwareScript {
        let folder = match firmware_root {
            Some(root) if self.folder_path.is_relative() => root.join(&self.folder_path),
            _ => self.folder_path.clone(),
        };
        let mut script = FirmwareScript::new(&self.name, &self.file_name, folder);
        script.resource_file_name = self
            .resource_file_name
            .clone()
            .unwrap_or_else(|| self.file_name.clone());
        script.is_boot_script = self.is_boot_script;
        script.convert_to_byte_code = self.convert_to_byte_code;
        script.deploy_file_format = DeployFileFormat::from_names(&self.deploy_formats);
        script.top_namespace = self.top_namespace.clone().unwrap_or_default();
        script
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_address() -> String {
    "192.168.0.50:5025".to_string()
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_read_after_write_delay() -> u64 {
    2
}

fn default_status_read_delay() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    50
}

fn default_load_completion_timeout() -> u64 {
    3000
}

fn default_upload_verify_timeout() -> u64 {
    1000
}

fn default_operation_completion_timeout() -> u64 {
    10000
}

fn default_loader_line_delay() -> u64 {
    20
}

fn default_boot_script_grace() -> u64 {
    2000
}

fn default_support_namespace() -> String {
    "isr".to_string()
}

fn default_upload_helper() -> String {
    "isr.script.uploadScript".to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl TspConfig {
    /// Load configuration from `config/tsp_firmware.toml` and the environment
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/tsp_firmware.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing files are tolerated: defaults and environment variables still
    /// apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(TspConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TSP_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the text is invalid.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(TspConfig::default()))
            .merge(Toml::string(text))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Script names are present and unique
    /// - At most one boot script is declared
    /// - Protocol timeouts are non-zero
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.protocol.load_completion_timeout_ms == 0
            || self.protocol.upload_verify_timeout_ms == 0
            || self.protocol.operation_completion_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "Protocol timeouts must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for script in &self.scripts {
            if script.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Script definition with empty name".to_string(),
                ));
            }
            if script.file_name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Script '{}': 'file_name' cannot be empty",
                    script.name
                )));
            }
            if !names.insert(script.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate script name: '{}'",
                    script.name
                )));
            }
        }

        let boot_scripts = self.scripts.iter().filter(|s| s.is_boot_script).count();
        if boot_scripts > 1 {
            return Err(ConfigError::ValidationError(format!(
                "At most one boot script may be declared, found {boot_scripts}"
            )));
        }

        Ok(())
    }

    /// Builds every catalog script, resolving folders against the firmware root.
    pub fn firmware_scripts(&self) -> Vec<FirmwareScript> {
        let root = self.application.firmware_root.as_deref();
        self.scripts.iter().map(|d| d.to_script(root)).collect()
    }

    /// Retry policy for session queries.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.session.retry.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "bench"
        log_level = "debug"

        [protocol]
        timeout_policy = "return_failure"
        support_namespace = "isr"

        [[scripts]]
        name = "isr_support"
        file_name = "isr_support.tsp"
        folder_path = "firmware"
        top_namespace = "isr"

        [[scripts]]
        name = "isr_boot"
        file_name = "isr_boot.tsp"
        is_boot_script = true
        convert_to_byte_code = true
        deploy_formats = ["binary", "compressed"]
    "#;

    #[test]
    fn test_config_parses_catalog() {
        let config = TspConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.protocol.timeout_policy, TimeoutPolicy::ReturnFailure);
        assert_eq!(config.protocol.load_completion_timeout_ms, 3000);
        assert_eq!(config.scripts.len(), 2);

        let scripts = config.firmware_scripts();
        assert_eq!(scripts[0].top_namespace, "isr");
        assert!(scripts[1].is_boot_script);
        assert!(scripts[1].deploy_file_format.contains(DeployFileFormat::COMPRESSED));
        assert!(scripts[1].deploy_file_format.contains(DeployFileFormat::BINARY));
    }

    #[test]
    fn test_defaults_without_file() {
        let config = TspConfig::from_toml_str("").unwrap();
        assert_eq!(config.session.address, "192.168.0.50:5025");
        assert_eq!(config.protocol.upload_verify_timeout_ms, 1000);
        assert_eq!(config.protocol.timeout_policy, TimeoutPolicy::RaiseTimeoutError);
    }

    #[test]
    fn test_invalid_log_level() {
        let result = TspConfig::from_toml_str(
            r#"
            [application]
            name = "bench"
            log_level = "loud"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_duplicate_script_names() {
        let result = TspConfig::from_toml_str(
            r#"
            [[scripts]]
            name = "a"
            file_name = "a.tsp"
            [[scripts]]
            name = "a"
            file_name = "b.tsp"
            "#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Duplicate script name"));
    }

    #[test]
    fn test_two_boot_scripts_rejected() {
        let result = TspConfig::from_toml_str(
            r#"
            [[scripts]]
            name = "a"
            file_name = "a.tsp"
            is_boot_script = true
            [[scripts]]
            name = "b"
            file_name = "b.tsp"
            is_boot_script = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_firmware_root_resolves_relative_folders() {
        let mut config = TspConfig::from_toml_str(SAMPLE).unwrap();
        config.application.firmware_root = Some(PathBuf::from("/opt/fw"));
        let scripts = config.firmware_scripts();
        assert_eq!(scripts[0].folder_path, PathBuf::from("/opt/fw/firmware"));
    }

    #[test]
    fn test_retry_policy_never_zero_attempts() {
        let mut config = TspConfig::default();
        config.session.retry.max_attempts = 0;
        assert_eq!(config.retry_policy().max_attempts, 1);
    }
}
