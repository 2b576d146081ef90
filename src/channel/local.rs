//! In-process command channel.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::exec::{Runner, DEFAULT_KILL_GRACE};
use super::{
    BookmarkEnvironment, CancelHandle, CommandChannel, CommandRequest, CommandResult,
    CommandValidator,
};
use crate::output::OutputSanitizer;
use crate::Result;

/// Runs commands as direct children of this process.
///
/// Isolation comes from a scrubbed environment and a dedicated process
/// group per command, which is killed as a whole on timeout or cancel.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    runner: Runner,
    environment: BookmarkEnvironment,
    validator: CommandValidator,
}

impl LocalChannel {
    pub fn new(environment: BookmarkEnvironment) -> Self {
        Self {
            runner: Runner::new(OutputSanitizer::default(), DEFAULT_KILL_GRACE),
            environment,
            validator: CommandValidator::default(),
        }
    }

    pub fn with_validator(mut self, validator: CommandValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Set the output cap and the kill grace period.
    pub fn with_limits(mut self, max_output_bytes: usize, kill_grace: Duration) -> Self {
        self.runner = Runner::new(OutputSanitizer::new(max_output_bytes), kill_grace);
        self
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn execute_cancellable(
        &self,
        request: CommandRequest,
        cancel: &CancelHandle,
    ) -> Result<CommandResult> {
        self.validator.validate(&request)?;
        let env = self.environment.compose(&request);
        debug!(context = %request.session_context, vars = env.len(), "executing locally");
        Ok(self.runner.run(&request, env, cancel).await)
    }

    async fn ping(&self) -> bool {
        true
    }
}
