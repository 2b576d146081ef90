//! Permission prompting.
//!
//! The broker never decides on its own whether a resource may be accessed;
//! it asks a [`PermissionPrompt`]. Desktop front-ends implement the trait with
//! a file picker or consent dialog. The crate ships a filesystem-backed prompt
//! and a scriptable simulation for tests and headless runs.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::Accessibility;

/// Outcome of a permission prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied { reason: String },
}

impl PermissionDecision {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Source of user/OS consent for resource access.
///
/// Implementations may block (e.g. waiting on a dialog). The broker holds
/// only the lock of the resource being prompted for while calling them.
pub trait PermissionPrompt: Send + Sync {
    fn prompt(&self, path: &Path, accessibility: Accessibility) -> PermissionDecision;
}

/// Grants access whenever the OS would let this process perform it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemPrompt;

impl PermissionPrompt for FilesystemPrompt {
    fn prompt(&self, path: &Path, accessibility: Accessibility) -> PermissionDecision {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => return PermissionDecision::denied(format!("cannot stat: {e}")),
        };

        let readable = if metadata.is_dir() {
            std::fs::read_dir(path).is_ok()
        } else {
            File::open(path).is_ok()
        };
        if !readable {
            return PermissionDecision::denied("not readable");
        }

        if accessibility == Accessibility::ReadWrite && metadata.permissions().readonly() {
            return PermissionDecision::denied("resource is read-only");
        }

        PermissionDecision::Granted
    }
}

/// Scriptable prompt that grants or denies on demand and counts prompts.
#[derive(Debug)]
pub struct SimulatedPrompt {
    grant: AtomicBool,
    prompts: AtomicUsize,
}

impl SimulatedPrompt {
    pub fn granting() -> Self {
        Self {
            grant: AtomicBool::new(true),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: AtomicBool::new(false),
            prompts: AtomicUsize::new(0),
        }
    }

    /// Change the answer given to subsequent prompts.
    pub fn set_granting(&self, grant: bool) {
        self.grant.store(grant, Ordering::SeqCst);
    }

    /// Number of times the prompt has been shown.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

impl PermissionPrompt for SimulatedPrompt {
    fn prompt(&self, _path: &Path, _accessibility: Accessibility) -> PermissionDecision {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.grant.load(Ordering::SeqCst) {
            PermissionDecision::Granted
        } else {
            PermissionDecision::denied("simulated denial")
        }
    }
}

/// Which prompt a runtime is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Decide from the filesystem's own permissions.
    #[default]
    Filesystem,
    /// Grant everything (simulation).
    GrantAll,
    /// Deny everything (simulation).
    DenyAll,
}

impl PermissionMode {
    pub fn into_prompt(self) -> std::sync::Arc<dyn PermissionPrompt> {
        match self {
            Self::Filesystem => std::sync::Arc::new(FilesystemPrompt),
            Self::GrantAll => std::sync::Arc::new(SimulatedPrompt::granting()),
            Self::DenyAll => std::sync::Arc::new(SimulatedPrompt::denying()),
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filesystem" => Ok(Self::Filesystem),
            "grant_all" | "grant-all" => Ok(Self::GrantAll),
            "deny_all" | "deny-all" => Ok(Self::DenyAll),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}
