//! Request validation before a command reaches an execution context.

use std::time::Duration;

use super::CommandRequest;
use crate::error::BrokerError;

/// Validation limits.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Maximum length of the program name or path.
    pub max_command_length: usize,
    /// Maximum number of arguments.
    pub max_arguments: usize,
    /// Maximum length of a single argument or environment value.
    pub max_value_length: usize,
    /// Longest timeout a request may ask for.
    pub max_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_command_length: 4096,
            max_arguments: 4096,
            max_value_length: 128 * 1024,
            max_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Request validator.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    config: ValidationConfig,
}

impl CommandValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate every field of `request`.
    pub fn validate(&self, request: &CommandRequest) -> Result<(), ValidationError> {
        self.validate_command(&request.command)?;
        self.validate_arguments(&request.arguments)?;
        for (key, value) in &request.environment {
            validate_env_name(key)?;
            self.validate_value(value)?;
        }
        for name in request.bookmarks.keys() {
            validate_bookmark_name(name)?;
        }
        self.validate_timeout(request.timeout)?;
        self.validate_working_dir(&request.working_directory.to_string_lossy())
    }

    /// Validate the program name.
    pub fn validate_command(&self, command: &str) -> Result<(), ValidationError> {
        if command.len() > self.config.max_command_length {
            return Err(ValidationError::CommandTooLong {
                length: command.len(),
                max: self.config.max_command_length,
            });
        }
        if command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }
        if command.contains('\0') {
            return Err(ValidationError::InvalidCharacter('\0'));
        }
        Ok(())
    }

    fn validate_arguments(&self, arguments: &[String]) -> Result<(), ValidationError> {
        if arguments.len() > self.config.max_arguments {
            return Err(ValidationError::TooManyArguments {
                count: arguments.len(),
                max: self.config.max_arguments,
            });
        }
        arguments.iter().try_for_each(|arg| self.validate_value(arg))
    }

    fn validate_value(&self, value: &str) -> Result<(), ValidationError> {
        if value.len() > self.config.max_value_length {
            return Err(ValidationError::ValueTooLong {
                length: value.len(),
                max: self.config.max_value_length,
            });
        }
        if value.contains('\0') {
            return Err(ValidationError::InvalidCharacter('\0'));
        }
        Ok(())
    }

    /// Validate a timeout value.
    pub fn validate_timeout(&self, timeout: Duration) -> Result<Duration, ValidationError> {
        if timeout.is_zero() {
            return Err(ValidationError::ZeroTimeout);
        }
        if timeout > self.config.max_timeout {
            return Err(ValidationError::TimeoutTooLong {
                value: timeout,
                max: self.config.max_timeout,
            });
        }
        Ok(timeout)
    }

    /// Validate working directory path.
    pub fn validate_working_dir(&self, path: &str) -> Result<(), ValidationError> {
        if path.contains('\0') {
            return Err(ValidationError::InvalidCharacter('\0'));
        }
        if !std::path::Path::new(path).is_absolute() {
            return Err(ValidationError::RelativeWorkingDir(path.to_string()));
        }
        if path.len() > 4096 {
            return Err(ValidationError::PathTooLong {
                length: path.len(),
                max: 4096,
            });
        }
        Ok(())
    }
}

fn validate_env_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(ValidationError::InvalidVariableName(name.to_string()));
    }
    Ok(())
}

/// Bookmark names become part of environment variable names.
fn validate_bookmark_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(ValidationError::InvalidBookmarkName(name.to_string()));
    }
    Ok(())
}

/// Validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Command exceeds maximum length.
    CommandTooLong { length: usize, max: usize },
    /// Command is empty.
    EmptyCommand,
    /// Too many arguments.
    TooManyArguments { count: usize, max: usize },
    /// An argument or environment value exceeds the maximum length.
    ValueTooLong { length: usize, max: usize },
    /// Input contains invalid character.
    InvalidCharacter(char),
    /// Environment variable name is unusable.
    InvalidVariableName(String),
    /// Bookmark name is not `[A-Za-z_][A-Za-z0-9_]*`.
    InvalidBookmarkName(String),
    /// Timeout of zero.
    ZeroTimeout,
    /// Timeout is too long.
    TimeoutTooLong { value: Duration, max: Duration },
    /// Working directory is not absolute.
    RelativeWorkingDir(String),
    /// Path is too long.
    PathTooLong { length: usize, max: usize },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandTooLong { length, max } => {
                write!(f, "Command too long: {} chars (max: {})", length, max)
            }
            Self::EmptyCommand => write!(f, "Command cannot be empty"),
            Self::TooManyArguments { count, max } => {
                write!(f, "Too many arguments: {} (max: {})", count, max)
            }
            Self::ValueTooLong { length, max } => {
                write!(f, "Value too long: {} bytes (max: {})", length, max)
            }
            Self::InvalidCharacter(c) => {
                write!(f, "Request contains invalid character: {:?}", c)
            }
            Self::InvalidVariableName(name) => {
                write!(f, "Invalid environment variable name: {:?}", name)
            }
            Self::InvalidBookmarkName(name) => write!(f, "Invalid bookmark name: {:?}", name),
            Self::ZeroTimeout => write!(f, "Timeout must be greater than zero"),
            Self::TimeoutTooLong { value, max } => write!(
                f,
                "Timeout too long: {:.3}s (max: {}s)",
                value.as_secs_f64(),
                max.as_secs()
            ),
            Self::RelativeWorkingDir(path) => {
                write!(f, "Working directory must be absolute: {}", path)
            }
            Self::PathTooLong { length, max } => {
                write!(f, "Path too long: {} chars (max: {})", length, max)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for BrokerError {
    fn from(e: ValidationError) -> Self {
        BrokerError::InvalidRequest(e.to_string())
    }
}
