//! Persisted bookmark store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use super::BookmarkToken;
use crate::error::BrokerError;
use crate::Result;

/// Key/value record of bookmark tokens, keyed `bookmark.<resource-id>`.
///
/// Backed by a JSON file (values are base64) written atomically on every
/// mutation, or purely in memory when opened without a path. Only the
/// broker writes to it.
#[derive(Debug)]
pub struct BookmarkStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl BookmarkStore {
    /// Create a store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open (or lazily create) a store backed by `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                BrokerError::Config(format!(
                    "bookmark store {} is corrupt: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(BrokerError::Io(e)),
        };

        debug!(path = %path.display(), entries = entries.len(), "bookmark store opened");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<BookmarkToken>> {
        let entries = self.entries.read().map_err(|_| BrokerError::LockPoisoned)?;
        match entries.get(key) {
            Some(text) => Ok(Some(BookmarkToken::from_base64(text)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a token and persist the store.
    pub fn put(&self, key: &str, token: &BookmarkToken) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| BrokerError::LockPoisoned)?;
        let previous = entries.insert(key.to_string(), token.to_base64());

        if let Err(e) = self.persist(&entries) {
            // Keep memory consistent with disk.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a token. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| BrokerError::LockPoisoned)?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| BrokerError::Config(format!("cannot encode bookmark store: {e}")))?;
        write_atomic(path, &json)?;
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, sync it, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(bytes: &[u8]) -> BookmarkToken {
        BookmarkToken::from_bytes(bytes.to_vec())
    }

    #[test]
    fn test_in_memory_put_get_remove() {
        let store = BookmarkStore::in_memory();
        store.put("bookmark.a", &token(b"one")).unwrap();

        assert_eq!(store.get("bookmark.a").unwrap(), Some(token(b"one")));
        assert_eq!(store.len(), 1);

        assert!(store.remove("bookmark.a").unwrap());
        assert!(!store.remove("bookmark.a").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");

        {
            let store = BookmarkStore::open(&path).unwrap();
            store.put("bookmark.x", &token(b"durable")).unwrap();
        }

        let reopened = BookmarkStore::open(&path).unwrap();
        assert_eq!(reopened.get("bookmark.x").unwrap(), Some(token(b"durable")));
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BookmarkStore::open(dir.path().join("nested/none.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_open_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            BookmarkStore::open(&path),
            Err(BrokerError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");
        let store = BookmarkStore::open(&path).unwrap();
        store.put("bookmark.p", &token(b"p")).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
