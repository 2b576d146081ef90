//! Filesystem resource access: permissions, bookmarks and scopes.
//!
//! A resource is identified by its canonical path. The
//! [`ResourceAccessBroker`] asks a [`PermissionPrompt`] for consent, issues
//! durable [`BookmarkToken`]s that survive restarts, and brackets actual use
//! of the resource with an OS access scope tracked by the monitor.

mod bookmark;
mod broker;
mod handle;
mod id;
mod permission;
mod scope;
mod store;

pub use bookmark::{BookmarkPayload, BookmarkToken, FileIdentity};
pub use broker::{AccessBroker, AccessTicket, ResolvedBookmark, ResourceAccessBroker};
pub use handle::{Accessibility, HandleState, ResourceHandle};
pub use id::{canonical_path, ResourceId, BOOKMARK_KEY_PREFIX};
pub use permission::{
    FilesystemPrompt, PermissionDecision, PermissionMode, PermissionPrompt, SimulatedPrompt,
};
pub use scope::{AccessScope, DescriptorScope};
pub use store::BookmarkStore;

pub(crate) use store::write_atomic;
