//! Resource identifier type.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of keys in the persisted bookmark store.
pub const BOOKMARK_KEY_PREFIX: &str = "bookmark.";

/// Opaque identifier of a filesystem resource.
///
/// Derived deterministically from the canonical path (UUIDv5), so the same
/// resource maps to the same id across process restarts. Displayed as
/// `res-` followed by 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Derive the id of an already-canonical path.
    pub fn for_canonical(path: &Path) -> Self {
        let url = format!("file://{}", path.to_string_lossy());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()))
    }

    /// Canonicalize `path` and derive its id.
    pub fn for_path(path: &Path) -> (PathBuf, Self) {
        let canonical = canonical_path(path);
        let id = Self::for_canonical(&canonical);
        (canonical, id)
    }

    /// Key under which this resource's bookmark is persisted.
    pub fn storage_key(&self) -> String {
        format!("{}{}", BOOKMARK_KEY_PREFIX, self)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0.simple())
    }
}

impl FromStr for ResourceId {
    type Err = crate::error::BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("res-")
            .and_then(|hex| Uuid::parse_str(hex).ok())
            .map(ResourceId)
            .ok_or_else(|| crate::error::BrokerError::InvalidRequest(format!("bad resource id: {s}")))
    }
}

/// Resolve `path` to its canonical form.
///
/// Existing paths are fully canonicalized (symlinks resolved). Paths that do
/// not exist are made absolute and lexically normalized so they still map
/// to a stable id.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    normalize(&absolute)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
