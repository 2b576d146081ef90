//! Access session tracking and expiry.
//!
//! The [`ResourceAccessMonitor`] owns every open [`AccessSession`]. It is the
//! only component that opens and releases OS access scopes, and the only one
//! allowed to force-close a session when its maximum duration elapses.
//! Lifecycle transitions are broadcast as [`AccessEvent`]s.

mod event;
mod registry;
mod session;

pub use event::{AccessEvent, AccessEventKind};
pub use registry::{ResourceAccessMonitor, DEFAULT_EXPIRY_GRACE, DEFAULT_MAX_DURATION};
pub use session::{AccessSession, SessionStatus};
