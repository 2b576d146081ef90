//! Privileged command execution.
//!
//! A [`CommandChannel`] runs one [`CommandRequest`] in an isolated context
//! and reports a [`CommandResult`]. Ordinary command failure (non-zero exit,
//! timeout, cancellation) is a result, never an error; `Err` is reserved for
//! requests that fail validation and for an unreachable context.
//!
//! Two channels are provided:
//! - [`LocalChannel`]: spawns the command directly with a scrubbed
//!   environment and its own process group.
//! - [`HelperChannel`]: starts a fresh helper process per request and speaks
//!   the JSON-lines protocol in [`protocol`] over its stdio.

mod client;
mod environment;
mod exec;
mod helper;
mod local;
pub mod protocol;
mod request;
mod result;
mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

pub use client::{HelperChannel, HelperOptions, DEFAULT_PING_TIMEOUT};
pub use environment::{BookmarkEnvironment, DEFAULT_BOOKMARK_PREFIX};
pub use helper::{serve, serve_stdio};
pub use local::LocalChannel;
pub use request::{CommandRequest, SessionContext, DEFAULT_TIMEOUT};
pub use result::{CommandResult, EXIT_CANCELLED, EXIT_SPAWN_FAILED, EXIT_TIMED_OUT};
pub use validation::{CommandValidator, ValidationConfig, ValidationError};

use crate::Result;

/// Executes privileged commands in an isolated context.
///
/// Each call performs exactly the work of one request; the channel never
/// retries.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run `request` to completion, timeout or failure.
    async fn execute(&self, request: CommandRequest) -> Result<CommandResult> {
        self.execute_cancellable(request, &CancelHandle::new()).await
    }

    /// Like [`execute`](Self::execute), but stops early once `cancel` fires.
    async fn execute_cancellable(
        &self,
        request: CommandRequest,
        cancel: &CancelHandle,
    ) -> Result<CommandResult>;

    /// Cheap liveness probe. Returns within a short bound.
    async fn ping(&self) -> bool;
}

/// Caller-side cancellation token for an in-flight command.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
