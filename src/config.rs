//! Configuration management for scope-broker.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ValidationConfig, DEFAULT_BOOKMARK_PREFIX};
use crate::cli::Args;
use crate::error::BrokerError;
use crate::output::DEFAULT_MAX_OUTPUT_BYTES;
use crate::resource::PermissionMode;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where bookmarks and credentials are kept.
    pub storage: StorageSection,
    /// Permission and access-session settings.
    pub access: AccessSection,
    /// Command execution settings.
    pub channel: ChannelSection,
    /// Credential vault settings.
    pub vault: VaultSection,
    /// Logging configuration.
    pub logging: LoggingSection,
    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Storage section. Unset paths mean in-memory storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// JSON file holding persisted bookmarks.
    pub bookmark_store: Option<PathBuf>,
    /// Private directory for the file vault.
    pub vault_dir: Option<PathBuf>,
}

/// Access section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSection {
    /// Longest an access session may stay open.
    pub max_duration_secs: u64,
    /// How permission requests are decided.
    pub permission_mode: PermissionMode,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            max_duration_secs: 3600,
            permission_mode: PermissionMode::default(),
        }
    }
}

/// Which execution context runs commands.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperMode {
    /// Run commands in this process.
    #[default]
    None,
    /// Start this executable in helper mode for each command.
    #[serde(rename = "self")]
    CurrentExe,
    /// Start the given helper program for each command.
    Path(PathBuf),
}

impl FromStr for HelperMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(ConfigError::InvalidValue("helper", s.to_string())),
            "none" => Ok(Self::None),
            "self" => Ok(Self::CurrentExe),
            path => Ok(Self::Path(PathBuf::from(path))),
        }
    }
}

/// Channel section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub helper: HelperMode,
    /// Timeout applied when a command does not specify one.
    pub default_timeout_secs: u64,
    /// Longest timeout a request may ask for.
    pub max_timeout_secs: u64,
    pub ping_timeout_ms: u64,
    /// Grace between asking a process to stop and killing it.
    pub kill_grace_ms: u64,
    /// Prefix of the bookmark variables passed to commands.
    pub bookmark_env_prefix: String,
    /// Captured output beyond this many bytes is dropped.
    pub max_output_bytes: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            helper: HelperMode::default(),
            default_timeout_secs: 300,
            max_timeout_secs: 24 * 60 * 60,
            ping_timeout_ms: 2000,
            kill_grace_ms: 250,
            bookmark_env_prefix: DEFAULT_BOOKMARK_PREFIX.to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Vault section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    /// Group configured for sharing with the helper at startup.
    pub sharing_group: Option<String>,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let mut config: Self = serde_json::from_str(&content).map_err(ConfigError::Json)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = env_value("SCOPE_BROKER_BOOKMARK_STORE") {
            self.storage.bookmark_store = Some(PathBuf::from(path));
        }

        if let Some(path) = env_value("SCOPE_BROKER_VAULT_DIR") {
            self.storage.vault_dir = Some(PathBuf::from(path));
        }

        if let Some(secs) = env_value("SCOPE_BROKER_MAX_DURATION") {
            self.access.max_duration_secs = secs
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SCOPE_BROKER_MAX_DURATION", secs))?;
        }

        if let Some(mode) = env_value("SCOPE_BROKER_PERMISSION_MODE") {
            self.access.permission_mode = mode
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SCOPE_BROKER_PERMISSION_MODE", mode))?;
        }

        if let Some(helper) = env_value("SCOPE_BROKER_HELPER") {
            self.channel.helper = helper.parse()?;
        }

        if let Some(group) = env_value("SCOPE_BROKER_SHARING_GROUP") {
            self.vault.sharing_group = Some(group);
        }

        if let Some(level) = env_value("SCOPE_BROKER_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = env_value("RUST_LOG") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(ref path) = args.bookmark_store {
            self.storage.bookmark_store = Some(path.clone());
        }

        if let Some(ref path) = args.vault_dir {
            self.storage.vault_dir = Some(path.clone());
        }

        if let Some(mode) = args.permission_mode {
            self.access.permission_mode = mode;
        }

        if let Some(ref helper) = args.helper {
            self.channel.helper = helper.clone();
        }

        if let Some(ref group) = args.sharing_group {
            self.vault.sharing_group = Some(group.clone());
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env()?;
        config.apply_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access.max_duration_secs == 0 {
            return Err(ConfigError::InvalidValue("max_duration_secs", "0".into()));
        }
        if self.channel.default_timeout_secs == 0
            || self.channel.default_timeout_secs > self.channel.max_timeout_secs
        {
            return Err(ConfigError::InvalidValue(
                "default_timeout_secs",
                self.channel.default_timeout_secs.to_string(),
            ));
        }
        let prefix = &self.channel.bookmark_env_prefix;
        if prefix.is_empty() || prefix.contains(['=', '\0']) {
            return Err(ConfigError::InvalidValue(
                "bookmark_env_prefix",
                prefix.clone(),
            ));
        }
        Ok(())
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.access.max_duration_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.default_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.channel.ping_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.channel.kill_grace_ms)
    }

    /// Request limits enforced by the command channel.
    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            max_timeout: Duration::from_secs(self.channel.max_timeout_secs),
            ..ValidationConfig::default()
        }
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// A setting has an unusable value.
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidValue(name, value) => write!(f, "invalid value for {}: '{}'", name, value),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for BrokerError {
    fn from(e: ConfigError) -> Self {
        BrokerError::Config(e.to_string())
    }
}
