//! Resource handle and its grant state machine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{BookmarkToken, ResourceId};
use crate::error::BrokerError;

/// Access level granted for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accessibility {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl Accessibility {
    /// Whether a grant at this level satisfies a request for `requested`.
    pub fn covers(self, requested: Accessibility) -> bool {
        self == Accessibility::ReadWrite || requested == Accessibility::ReadOnly
    }
}

/// Lifecycle state of a resource grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HandleState {
    /// Permission has been asked for but not (yet) granted.
    #[default]
    Requested,
    /// Access is granted.
    Granted,
    /// The bookmark must be re-created before further use.
    Stale,
    /// Access was refused or withdrawn.
    Revoked,
    /// The last access session ran out of time.
    Expired,
}

impl HandleState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Requested -> Granted | Revoked
    /// - Granted -> Stale | Revoked | Expired
    /// - Stale -> Granted | Revoked
    /// - Expired -> Granted | Revoked
    /// - Revoked -> Requested
    pub fn can_transition_to(&self, target: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (*self, target),
            (Requested, Granted)
                | (Requested, Revoked)
                | (Granted, Stale)
                | (Granted, Revoked)
                | (Granted, Expired)
                | (Stale, Granted)
                | (Stale, Revoked)
                | (Expired, Granted)
                | (Expired, Revoked)
                | (Revoked, Requested)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: HandleState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(BrokerError::InvalidStateTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", target),
            })
        }
    }

    /// Whether access may currently be exercised.
    pub fn is_usable(&self) -> bool {
        matches!(self, HandleState::Granted | HandleState::Stale)
    }
}

/// A resource known to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub id: ResourceId,
    /// Canonical path of the resource.
    pub path: PathBuf,
    pub bookmark: Option<BookmarkToken>,
    pub accessibility: Accessibility,
    pub state: HandleState,
}

impl ResourceHandle {
    /// Create a handle in the `Requested` state.
    pub fn new(id: ResourceId, path: PathBuf, accessibility: Accessibility) -> Self {
        Self {
            id,
            path,
            bookmark: None,
            accessibility,
            state: HandleState::Requested,
        }
    }

    /// Move the handle to `Granted`, re-entering via `Requested` if it was revoked.
    pub fn grant(&mut self, accessibility: Accessibility) -> crate::Result<()> {
        if self.state == HandleState::Revoked {
            self.state.transition_to(HandleState::Requested)?;
        }
        if self.state != HandleState::Granted {
            self.state.transition_to(HandleState::Granted)?;
        }
        self.accessibility = accessibility;
        Ok(())
    }

    /// Move the handle to `Revoked` unless it already is.
    pub fn revoke(&mut self) -> crate::Result<()> {
        if self.state == HandleState::Revoked {
            return Ok(());
        }
        self.state.transition_to(HandleState::Revoked)
    }

    /// Whether an existing grant satisfies a request at `requested` level.
    pub fn grant_covers(&self, requested: Accessibility) -> bool {
        self.state.is_usable() && self.accessibility.covers(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn handle() -> ResourceHandle {
        let path = PathBuf::from("/srv/data");
        ResourceHandle::new(
            ResourceId::for_canonical(Path::new("/srv/data")),
            path,
            Accessibility::ReadOnly,
        )
    }

    #[test]
    fn test_valid_transitions() {
        let mut state = HandleState::Requested;
        assert!(state.transition_to(HandleState::Granted).is_ok());
        assert!(state.transition_to(HandleState::Stale).is_ok());
        assert!(state.transition_to(HandleState::Granted).is_ok());
        assert!(state.transition_to(HandleState::Expired).is_ok());
        assert!(state.transition_to(HandleState::Revoked).is_ok());
        assert!(state.transition_to(HandleState::Requested).is_ok());
    }

    #[test]
    fn test_invalid_transition_keeps_state() {
        let mut state = HandleState::Requested;
        assert!(state.transition_to(HandleState::Stale).is_err());
        assert_eq!(state, HandleState::Requested);

        let mut revoked = HandleState::Revoked;
        assert!(revoked.transition_to(HandleState::Granted).is_err());
    }

    #[test]
    fn test_grant_from_revoked() {
        let mut h = handle();
        h.revoke().unwrap();
        h.grant(Accessibility::ReadWrite).unwrap();
        assert_eq!(h.state, HandleState::Granted);
        assert_eq!(h.accessibility, Accessibility::ReadWrite);
    }

    #[test]
    fn test_revoke_twice_is_ok() {
        let mut h = handle();
        h.revoke().unwrap();
        h.revoke().unwrap();
        assert_eq!(h.state, HandleState::Revoked);
    }

    #[test]
    fn test_accessibility_covers() {
        assert!(Accessibility::ReadWrite.covers(Accessibility::ReadOnly));
        assert!(Accessibility::ReadWrite.covers(Accessibility::ReadWrite));
        assert!(Accessibility::ReadOnly.covers(Accessibility::ReadOnly));
        assert!(!Accessibility::ReadOnly.covers(Accessibility::ReadWrite));
    }

    #[test]
    fn test_grant_covers_requires_usable_state() {
        let mut h = handle();
        assert!(!h.grant_covers(Accessibility::ReadOnly));
        h.grant(Accessibility::ReadOnly).unwrap();
        assert!(h.grant_covers(Accessibility::ReadOnly));
        assert!(!h.grant_covers(Accessibility::ReadWrite));
    }
}
