//! OS-level access scopes.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

/// The OS bracket during which a resource may actually be used.
///
/// `acquire` and `release` are called exactly once per session by the
/// monitor; implementations need not reference-count.
pub trait AccessScope: Send + Sync {
    fn acquire(&self, path: &Path) -> io::Result<()>;
    fn release(&self, path: &Path);
}

/// Holds an open descriptor on the resource for the lifetime of the scope.
///
/// The descriptor pins the filesystem object: a rename or unlink of the path
/// while the scope is open does not invalidate the process's access.
#[derive(Debug, Default)]
pub struct DescriptorScope {
    open: Mutex<HashMap<PathBuf, File>>,
}

impl DescriptorScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently held descriptors.
    pub fn open_count(&self) -> usize {
        self.open.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl AccessScope for DescriptorScope {
    fn acquire(&self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        let mut open = self
            .open
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "scope table poisoned"))?;
        open.insert(path.to_path_buf(), file);
        debug!(path = %path.display(), "access scope opened");
        Ok(())
    }

    fn release(&self, path: &Path) {
        match self.open.lock() {
            Ok(mut open) => {
                if open.remove(path).is_some() {
                    debug!(path = %path.display(), "access scope released");
                } else {
                    warn!(path = %path.display(), "release of unknown access scope");
                }
            }
            Err(_) => warn!(path = %path.display(), "scope table poisoned during release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scope = DescriptorScope::new();

        scope.acquire(dir.path()).unwrap();
        assert_eq!(scope.open_count(), 1);

        scope.release(dir.path());
        assert_eq!(scope.open_count(), 0);
    }

    #[test]
    fn test_acquire_missing_fails() {
        let scope = DescriptorScope::new();
        assert!(scope.acquire(Path::new("/no/such/thing")).is_err());
        assert_eq!(scope.open_count(), 0);
    }

    #[test]
    fn test_release_unknown_is_harmless() {
        let scope = DescriptorScope::new();
        scope.release(Path::new("/never/opened"));
        assert_eq!(scope.open_count(), 0);
    }
}
