//! Command result types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Exit code reported when the program could not be started.
pub const EXIT_SPAWN_FAILED: i32 = 127;
/// Exit code reported when the timeout killed the command.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code reported when the caller cancelled the command.
pub const EXIT_CANCELLED: i32 = 130;

/// Outcome of one command request. Always fully populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    /// Sanitized standard output.
    #[serde(default)]
    pub output: Option<String>,
    /// `"<Tag>: <message>"` when the command did not succeed.
    #[serde(default)]
    pub error_detail: Option<String>,
    pub exit_code: i32,
}

impl CommandResult {
    /// Result of a command that ran to completion.
    ///
    /// Non-zero exits become `ExecutionFailed` failures carrying `stderr`.
    pub fn completed(exit_code: i32, output: String, stderr: &str) -> Self {
        if exit_code == 0 {
            return Self {
                success: true,
                output: Some(output),
                error_detail: None,
                exit_code,
            };
        }

        let detail = match stderr.trim() {
            "" => "no error output".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self::failure(
            &CommandError::ExecutionFailed { exit_code, detail },
            Some(output),
            exit_code,
        )
    }

    /// Failed result tagged with `error`.
    pub fn failure(error: &CommandError, output: Option<String>, exit_code: i32) -> Self {
        Self {
            success: false,
            output,
            error_detail: Some(error.tagged_detail()),
            exit_code,
        }
    }

    /// The command was killed after exceeding `timeout`.
    pub fn timed_out(timeout: Duration, output: Option<String>) -> Self {
        Self::failure(&CommandError::TimeoutFailure(timeout), output, EXIT_TIMED_OUT)
    }

    /// The caller cancelled the command.
    pub fn cancelled(output: Option<String>) -> Self {
        Self::failure(&CommandError::Cancelled, output, EXIT_CANCELLED)
    }

    /// The program could not be started.
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::failure(
            &CommandError::ExecutionFailed {
                exit_code: EXIT_SPAWN_FAILED,
                detail: reason.into(),
            },
            None,
            EXIT_SPAWN_FAILED,
        )
    }

    /// Tag of the failure (`"TimeoutFailure"`, `"Cancelled"`, ...).
    pub fn failure_tag(&self) -> Option<&str> {
        self.error_detail
            .as_deref()
            .and_then(|detail| detail.split_once(": "))
            .map(|(tag, _)| tag)
    }

    pub fn is_timeout(&self) -> bool {
        self.failure_tag() == Some("TimeoutFailure")
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure_tag() == Some("Cancelled")
    }

    /// Get output as string, trimmed.
    pub fn output_trimmed(&self) -> &str {
        self.output.as_deref().unwrap_or_default().trim()
    }

    /// Get output lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.output.as_deref().unwrap_or_default().lines()
    }
}
