//! Durable bookmark tokens.
//!
//! A token is an opaque byte blob: a four-byte magic followed by a JSON
//! payload recording the canonical path, the granted accessibility and the
//! filesystem identity of the resource when it was bookmarked. Identity is
//! what makes staleness detectable: if the object at the path is replaced
//! or the path's canonical form changes, resolution still succeeds but
//! reports the bookmark as stale.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::Accessibility;
use crate::error::BookmarkError;

const MAGIC: &[u8; 4] = b"SBK1";
const FORMAT_VERSION: u32 = 1;

/// Opaque, durable access token for a filesystem resource.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BookmarkToken(Vec<u8>);

impl BookmarkToken {
    /// Wrap raw token bytes (e.g. received across a process boundary).
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Text form used in the bookmark store and environment variables.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Parse the text form. Fails with `ResolutionFailed` on bad encoding.
    pub fn from_base64(text: &str) -> Result<Self, BookmarkError> {
        STANDARD
            .decode(text.trim())
            .map(Self)
            .map_err(|e| BookmarkError::ResolutionFailed(format!("invalid token encoding: {e}")))
    }
}

impl fmt::Debug for BookmarkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BookmarkToken({} bytes)", self.0.len())
    }
}

/// Device/inode pair identifying a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Decoded token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkPayload {
    pub version: u32,
    pub path: PathBuf,
    pub accessibility: Accessibility,
    #[serde(default)]
    pub identity: Option<FileIdentity>,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

impl BookmarkPayload {
    /// Capture the current state of the resource at `canonical`.
    pub fn capture(
        canonical: &Path,
        accessibility: Accessibility,
    ) -> Result<Self, BookmarkError> {
        let metadata = std::fs::metadata(canonical).map_err(|e| {
            BookmarkError::CreationFailed(format!("{} is inaccessible: {e}", canonical.display()))
        })?;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            version: FORMAT_VERSION,
            path: canonical.to_path_buf(),
            accessibility,
            identity: FileIdentity::of(&metadata),
            created_at,
        })
    }

    pub fn encode(&self) -> Result<BookmarkToken, BookmarkError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| BookmarkError::CreationFailed(format!("encode failed: {e}")))?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + json.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&json);
        Ok(BookmarkToken(bytes))
    }

    pub fn decode(token: &BookmarkToken) -> Result<Self, BookmarkError> {
        let body = token
            .as_bytes()
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| BookmarkError::ResolutionFailed("unrecognized token format".into()))?;

        let payload: BookmarkPayload = serde_json::from_slice(body)
            .map_err(|e| BookmarkError::ResolutionFailed(format!("malformed token: {e}")))?;

        if payload.version != FORMAT_VERSION {
            return Err(BookmarkError::ResolutionFailed(format!(
                "unsupported token version {}",
                payload.version
            )));
        }
        if !payload.path.is_absolute() {
            return Err(BookmarkError::ResolutionFailed(
                "token path is not absolute".into(),
            ));
        }
        Ok(payload)
    }

    /// Check the recorded resource against the filesystem.
    ///
    /// Returns whether the bookmark is stale. Never mutates anything.
    pub fn check(&self) -> Result<bool, BookmarkError> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| {
            BookmarkError::ResolutionFailed(format!(
                "{} no longer resolves: {e}",
                self.path.display()
            ))
        })?;

        let identity_changed = match (self.identity, FileIdentity::of(&metadata)) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        };
        let moved = std::fs::canonicalize(&self.path)
            .map(|current| current != self.path)
            .unwrap_or(true);

        Ok(identity_changed || moved)
    }
}
