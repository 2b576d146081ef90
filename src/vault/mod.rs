//! Credential storage shared with the isolated execution context.
//!
//! Records are keyed by name, namespaced as `<group>.<key>` when stored under
//! a sharing group. A group must be configured with
//! [`CredentialVault::configure_sharing`] before it can be used; the
//! [`FileVault`] then keeps the group's records in a private file that both
//! the broker and its helper process can reach.

mod file;
mod memory;
mod secret;

pub use file::FileVault;
pub use memory::MemoryVault;
pub use secret::Secret;

use crate::error::CredentialError;
use crate::Result;

/// Secure key/value secret storage.
///
/// All methods may block on file locks; implementations are safe to call
/// concurrently from several threads and, for [`FileVault`], processes.
pub trait CredentialVault: Send + Sync {
    /// Store `secret` under `key`, replacing any previous value.
    fn save(&self, secret: &Secret, key: &str, group: Option<&str>) -> Result<()>;

    /// Look up `key`. Returns `None` if absent.
    fn retrieve(&self, key: &str, group: Option<&str>) -> Result<Option<Secret>>;

    /// Remove `key`. Removing an absent key succeeds.
    fn delete(&self, key: &str, group: Option<&str>) -> Result<()>;

    /// Prepare `group` for cross-context access.
    fn configure_sharing(&self, group: &str) -> Result<()>;

    /// Whether `group` is configured and currently reachable.
    fn validate_sharing(&self, group: &str) -> bool;
}

/// Storage key of `key` within `group`.
pub fn namespaced_key(key: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("{group}.{key}"),
        None => key.to_string(),
    }
}

/// Vault operation, for error attribution.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operation {
    Save,
    Retrieve,
    Delete,
}

impl Operation {
    pub(crate) fn failed(self, key: &str, reason: impl Into<String>) -> CredentialError {
        let (key, reason) = (key.to_string(), reason.into());
        match self {
            Self::Save => CredentialError::SaveFailed { key, reason },
            Self::Retrieve => CredentialError::RetrievalFailed { key, reason },
            Self::Delete => CredentialError::DeletionFailed { key, reason },
        }
    }
}

pub(crate) fn check_key(op: Operation, key: &str) -> std::result::Result<(), CredentialError> {
    if key.is_empty() || key.contains('\0') {
        return Err(op.failed(key, "invalid key"));
    }
    Ok(())
}

/// Group names are used as file names: `[A-Za-z0-9._-]+`, not starting with `.`.
pub(crate) fn check_group_name(group: &str) -> std::result::Result<(), CredentialError> {
    let valid = !group.is_empty()
        && !group.starts_with('.')
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(CredentialError::SharingConfigurationFailed {
            group: group.to_string(),
            reason: "invalid group name".into(),
        });
    }
    Ok(())
}

pub(crate) fn unconfigured(group: &str) -> CredentialError {
    CredentialError::SharingValidationFailed {
        group: group.to_string(),
        reason: "sharing group is not configured".into(),
    }
}
