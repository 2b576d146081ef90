//! Access sessions and their lifecycle.

use std::time::{Duration, Instant};

use crate::error::BrokerError;
use crate::resource::ResourceHandle;

/// Lifecycle status of an access session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// Scope is open and the expiry timer is armed.
    #[default]
    Active,
    /// The maximum duration elapsed; closing is in progress.
    Expired,
    /// Scope released. Terminal.
    Closed,
}

impl SessionStatus {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Active -> Expired
    /// - Active -> Closed
    /// - Expired -> Closed
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (*self, target),
            (Active, Expired) | (Active, Closed) | (Expired, Closed)
        )
    }

    /// Attempt to transition to a new status.
    pub fn transition_to(&mut self, target: SessionStatus) -> crate::Result<()> {
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

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed)
    }
}

/// An open access session on one resource.
#[derive(Debug, Clone)]
pub struct AccessSession {
    /// Snapshot of the handle the session was opened for.
    pub handle: ResourceHandle,
    pub started_at: Instant,
    pub max_duration: Duration,
    pub status: SessionStatus,
    /// Distinguishes this session from earlier and later ones on the same
    /// resource.
    pub generation: u64,
}

impl AccessSession {
    pub fn new(handle: ResourceHandle, max_duration: Duration, generation: u64) -> Self {
        Self {
            handle,
            started_at: Instant::now(),
            max_duration,
            status: SessionStatus::Active,
            generation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before expiry (zero once overdue).
    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.elapsed())
    }

    /// An active session that outlived its budget by more than `grace`.
    pub fn is_overdue(&self, grace: Duration) -> bool {
        self.status == SessionStatus::Active
            && self.elapsed() > self.max_duration.saturating_add(grace)
    }
}
