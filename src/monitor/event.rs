//! Access lifecycle events.

use std::path::PathBuf;

use crate::resource::ResourceId;

/// Finite vocabulary of access lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessEventKind {
    /// A session was opened.
    Granted,
    /// A permission request was refused.
    Denied,
    /// A session was closed explicitly (or at shutdown).
    Revoked,
    /// A session was force-closed after its maximum duration.
    Expired,
}

/// Event broadcast to monitor subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub kind: AccessEventKind,
    pub resource: ResourceId,
    pub path: PathBuf,
}

impl AccessEvent {
    pub fn new(kind: AccessEventKind, resource: ResourceId, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            resource,
            path: path.into(),
        }
    }
}
