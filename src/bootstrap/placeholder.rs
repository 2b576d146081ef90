//! Inert stand-ins used while the dependency graph is being built.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{error, warn};

use crate::channel::{CancelHandle, CommandChannel, CommandRequest, CommandResult};
use crate::error::BrokerError;
use crate::resource::{AccessBroker, Accessibility, BookmarkToken, ResolvedBookmark};
use crate::vault::{CredentialVault, Secret};
use crate::Result;

type DefectHook = Box<dyn Fn(&'static str) + Send + Sync>;

/// Tracks whether startup has finished and counts placeholder misuse.
#[derive(Default)]
pub struct BootstrapPhase {
    complete: AtomicBool,
    defects: AtomicUsize,
    hook: OnceLock<DefectHook>,
}

impl BootstrapPhase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startup finished; every later placeholder call is a defect.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Placeholder calls observed after startup completed.
    pub fn defect_count(&self) -> usize {
        self.defects.load(Ordering::SeqCst)
    }

    /// Install a callback fired for every post-startup placeholder call.
    ///
    /// Only one hook may be installed.
    pub fn on_defect(&self, hook: impl Fn(&'static str) + Send + Sync + 'static) -> Result<()> {
        self.hook
            .set(Box::new(hook))
            .map_err(|_| BrokerError::OperationUnavailable("defect hook already installed".into()))
    }

    fn record(&self, operation: &'static str) {
        if !self.is_complete() {
            warn!(
                defect = "initialization-order",
                operation, "placeholder invoked during bootstrap"
            );
            return;
        }

        self.defects.fetch_add(1, Ordering::SeqCst);
        error!(
            defect = "initialization-order",
            operation, "placeholder invoked after bootstrap completed"
        );
        if let Some(hook) = self.hook.get() {
            hook(operation);
        }
    }
}

impl fmt::Debug for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapPhase")
            .field("complete", &self.is_complete())
            .field("defects", &self.defect_count())
            .field("hook", &self.hook.get().is_some())
            .finish()
    }
}

/// Implements broker, channel and vault by refusing to do anything.
///
/// Operations return a safe negative (`false`, nothing found) or fail with
/// [`BrokerError::OperationUnavailable`]; every call is reported to the
/// [`BootstrapPhase`].
#[derive(Debug, Clone)]
pub struct Placeholder {
    phase: Arc<BootstrapPhase>,
}

impl Placeholder {
    pub fn new(phase: Arc<BootstrapPhase>) -> Self {
        Self { phase }
    }

    fn unavailable<T>(&self, operation: &'static str) -> Result<T> {
        self.phase.record(operation);
        Err(BrokerError::OperationUnavailable(format!(
            "{operation} called before initialization"
        )))
    }
}

impl AccessBroker for Placeholder {
    fn request_permission(&self, _path: &Path, _accessibility: Accessibility) -> Result<bool> {
        self.phase.record("request_permission");
        Ok(false)
    }

    fn create_bookmark(&self, _path: &Path) -> Result<BookmarkToken> {
        self.unavailable("create_bookmark")
    }

    fn resolve_bookmark(&self, _token: &BookmarkToken) -> Result<ResolvedBookmark> {
        self.unavailable("resolve_bookmark")
    }

    fn start_accessing(&self, _path: &Path) -> Result<bool> {
        self.phase.record("start_accessing");
        Ok(false)
    }

    fn stop_accessing(&self, _path: &Path) -> Result<()> {
        self.phase.record("stop_accessing");
        Ok(())
    }
}

#[async_trait]
impl CommandChannel for Placeholder {
    async fn execute_cancellable(
        &self,
        _request: CommandRequest,
        _cancel: &CancelHandle,
    ) -> Result<CommandResult> {
        self.unavailable("execute")
    }

    async fn ping(&self) -> bool {
        self.phase.record("ping");
        false
    }
}

impl CredentialVault for Placeholder {
    fn save(&self, _secret: &Secret, _key: &str, _group: Option<&str>) -> Result<()> {
        self.unavailable("save")
    }

    fn retrieve(&self, _key: &str, _group: Option<&str>) -> Result<Option<Secret>> {
        self.phase.record("retrieve");
        Ok(None)
    }

    fn delete(&self, _key: &str, _group: Option<&str>) -> Result<()> {
        self.unavailable("delete")
    }

    fn configure_sharing(&self, _group: &str) -> Result<()> {
        self.unavailable("configure_sharing")
    }

    fn validate_sharing(&self, _group: &str) -> bool {
        self.phase.record("validate_sharing");
        false
    }
}
