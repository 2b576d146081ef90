//! File-backed vault shared between the broker and its helper.
//!
//! Layout under the vault root (mode `0700`):
//!
//! ```text
//! credentials.json        ungrouped records
//! groups/<group>.json     records of a sharing group
//! .lock                   advisory lock held across read-modify-write
//! ```
//!
//! Every record file is a JSON object of storage key to base64 value, written
//! atomically with mode `0600`.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::Engine;
use tracing::{debug, info, warn};

use super::{
    check_group_name, check_key, namespaced_key, unconfigured, CredentialVault, Operation, Secret,
};
use crate::error::{BrokerError, CredentialError};
use crate::resource::write_atomic;
use crate::Result;

const CREDENTIALS_FILE: &str = "credentials.json";
const GROUPS_DIR: &str = "groups";
const LOCK_FILE: &str = ".lock";

type Records = BTreeMap<String, String>;

/// Vault persisted as private JSON files.
///
/// Each call re-reads the files, so writes made by another process sharing
/// the root are visible immediately.
#[derive(Debug)]
pub struct FileVault {
    root: PathBuf,
    groups: RwLock<HashSet<String>>,
}

impl FileVault {
    /// Open (creating if needed) a vault rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        create_private_dir(&root)?;
        debug!(root = %root.display(), "file vault opened");
        Ok(Self {
            root,
            groups: RwLock::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.root.join(GROUPS_DIR).join(format!("{group}.json"))
    }

    fn records_path(&self, group: Option<&str>) -> PathBuf {
        match group {
            Some(group) => self.group_path(group),
            None => self.root.join(CREDENTIALS_FILE),
        }
    }

    fn is_configured(&self, group: &str) -> Result<bool> {
        let groups = self.groups.read().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(groups.contains(group))
    }

    /// Validate the arguments and locate the record.
    fn resolve(&self, op: Operation, key: &str, group: Option<&str>) -> Result<(PathBuf, String)> {
        check_key(op, key)?;
        if let Some(group) = group {
            if !self.is_configured(group)? {
                return Err(unconfigured(group).into());
            }
        }
        Ok((self.records_path(group), namespaced_key(key, group)))
    }

    /// Run `f` on the records at `path` under the vault lock, persisting the
    /// result if `f` reports a change.
    fn modify(&self, path: &Path, f: impl FnOnce(&mut Records) -> bool) -> io::Result<()> {
        let _lock = VaultLock::acquire(&self.root.join(LOCK_FILE))?;
        let mut records = read_records(path)?;
        if f(&mut records) {
            let json = serde_json::to_vec_pretty(&records)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write_atomic(path, &json)?;
        }
        Ok(())
    }
}

impl CredentialVault for FileVault {
    fn save(&self, secret: &Secret, key: &str, group: Option<&str>) -> Result<()> {
        let (path, storage_key) = self.resolve(Operation::Save, key, group)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret.expose());
        self.modify(&path, |records| {
            records.insert(storage_key, encoded);
            true
        })
        .map_err(|e| Operation::Save.failed(key, e.to_string()))?;
        debug!(key, group, "credential saved");
        Ok(())
    }

    fn retrieve(&self, key: &str, group: Option<&str>) -> Result<Option<Secret>> {
        let (path, storage_key) = self.resolve(Operation::Retrieve, key, group)?;
        let records =
            read_records(&path).map_err(|e| Operation::Retrieve.failed(key, e.to_string()))?;
        let Some(encoded) = records.get(&storage_key) else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Operation::Retrieve.failed(key, format!("corrupt value: {e}")))?;
        Ok(Some(Secret::new(bytes)))
    }

    fn delete(&self, key: &str, group: Option<&str>) -> Result<()> {
        let (path, storage_key) = self.resolve(Operation::Delete, key, group)?;
        let mut removed = false;
        self.modify(&path, |records| {
            removed = records.remove(&storage_key).is_some();
            removed
        })
        .map_err(|e| Operation::Delete.failed(key, e.to_string()))?;
        if removed {
            debug!(key, group, "credential deleted");
        }
        Ok(())
    }

    fn configure_sharing(&self, group: &str) -> Result<()> {
        check_group_name(group)?;
        let failed = |reason: String| CredentialError::SharingConfigurationFailed {
            group: group.to_string(),
            reason,
        };

        create_private_dir(&self.root.join(GROUPS_DIR)).map_err(|e| failed(e.to_string()))?;
        let path = self.group_path(group);
        {
            let _lock =
                VaultLock::acquire(&self.root.join(LOCK_FILE)).map_err(|e| failed(e.to_string()))?;
            if path.exists() {
                enforce_private_permissions(&path).map_err(|e| failed(e.to_string()))?;
                read_records(&path).map_err(|e| failed(e.to_string()))?;
            } else {
                write_atomic(&path, b"{}").map_err(|e| failed(e.to_string()))?;
            }
        }

        let mut groups = self.groups.write().map_err(|_| BrokerError::LockPoisoned)?;
        groups.insert(group.to_string());
        info!(group, path = %path.display(), "sharing group configured");
        Ok(())
    }

    fn validate_sharing(&self, group: &str) -> bool {
        match self.is_configured(group) {
            Ok(true) => {}
            _ => return false,
        }
        let path = self.group_path(group);
        let checked = validate_private_permissions(&path).and_then(|_| read_records(&path));
        match checked {
            Ok(_) => true,
            Err(e) => {
                warn!(group, error = %e, "sharing group unusable");
                false
            }
        }
    }
}

/// Exclusive advisory lock on the vault's lock file, released on drop.
struct VaultLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl VaultLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor belongs to `file`, which outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { file })
    }
}

#[cfg(unix)]
impl Drop for VaultLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is still open; closing it would also unlock.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

fn read_records(path: &Path) -> io::Result<Records> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(Records::new()),
        Ok(content) => serde_json::from_str(&content).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is corrupt: {e}", path.display()),
            )
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Records::new()),
        Err(e) => Err(e),
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn enforce_private_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "{} has permissions {mode:o}; expected 0600",
                path.display()
            ),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(path: &Path) -> io::Result<()> {
    std::fs::metadata(path).map(|_| ())
}
