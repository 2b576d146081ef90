//! In-process vault.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use super::{check_group_name, check_key, unconfigured, CredentialVault, Operation, Secret};
use crate::error::BrokerError;
use crate::Result;

/// Vault that lives and dies with the process.
///
/// Sharing groups only namespace records here; there is no second process
/// to share with. Each namespace is its own key space, so no key in one
/// can name a record in another.
#[derive(Debug, Default)]
pub struct MemoryVault {
    records: RwLock<HashMap<RecordKey, Secret>>,
    groups: RwLock<HashSet<String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all groups.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage_key(&self, op: Operation, key: &str, group: Option<&str>) -> Result<RecordKey> {
        check_key(op, key)?;
        if let Some(group) = group {
            let groups = self.groups.read().map_err(|_| BrokerError::LockPoisoned)?;
            if !groups.contains(group) {
                return Err(unconfigured(group).into());
            }
        }
        Ok((group.map(str::to_string), key.to_string()))
    }
}

/// Namespace (`None` for the global one) and key.
type RecordKey = (Option<String>, String);

impl CredentialVault for MemoryVault {
    fn save(&self, secret: &Secret, key: &str, group: Option<&str>) -> Result<()> {
        let storage_key = self.storage_key(Operation::Save, key, group)?;
        let mut records = self.records.write().map_err(|_| BrokerError::LockPoisoned)?;
        records.insert(storage_key, secret.clone());
        debug!(key, group, "credential saved");
        Ok(())
    }

    fn retrieve(&self, key: &str, group: Option<&str>) -> Result<Option<Secret>> {
        let storage_key = self.storage_key(Operation::Retrieve, key, group)?;
        let records = self.records.read().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(records.get(&storage_key).cloned())
    }

    fn delete(&self, key: &str, group: Option<&str>) -> Result<()> {
        let storage_key = self.storage_key(Operation::Delete, key, group)?;
        let mut records = self.records.write().map_err(|_| BrokerError::LockPoisoned)?;
        if records.remove(&storage_key).is_some() {
            debug!(key, group, "credential deleted");
        }
        Ok(())
    }

    fn configure_sharing(&self, group: &str) -> Result<()> {
        check_group_name(group)?;
        let mut groups = self.groups.write().map_err(|_| BrokerError::LockPoisoned)?;
        groups.insert(group.to_string());
        Ok(())
    }

    fn validate_sharing(&self, group: &str) -> bool {
        self.groups
            .read()
            .map(|g| g.contains(group))
            .unwrap_or(false)
    }
}
