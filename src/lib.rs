//! # scope-broker
//!
//! Privileged-operation broker for sandboxed backup tools.
//!
//! A sandboxed application may only touch the files a user explicitly
//! granted, and some commands it needs (backup engines, repository tools)
//! must run outside the sandbox. This crate provides the pieces in between:
//!
//! - [`resource`]: permission requests, durable bookmarks that survive
//!   restarts, and bracketed access to granted resources.
//! - [`monitor`]: time-bounded access sessions with automatic expiry.
//! - [`channel`]: command execution in an isolated context, in process or
//!   through a helper process, with timeout and cancellation.
//! - [`vault`]: credential storage shareable with that helper.
//! - [`bootstrap`]: two-phase construction of the above without cycles.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use scope_broker::{
//!     AccessBroker, Accessibility, BrokerRuntime, CommandChannel, CommandRequest, Config,
//! };
//!
//! #[tokio::main]
//! async fn main() -> scope_broker::Result<()> {
//!     scope_broker::logging::try_init().ok();
//!
//!     let runtime = BrokerRuntime::builder(Config::default()).build()?;
//!     let source = Path::new("/home/user/Documents");
//!
//!     runtime
//!         .broker()
//!         .request_permission(source, Accessibility::ReadOnly)?;
//!     let bookmark = runtime.broker().create_bookmark(source)?;
//!
//!     let request = CommandRequest::new("restic")
//!         .args(["backup", "/home/user/Documents"])
//!         .bookmark("source", bookmark);
//!     let result = runtime.channel().execute(request).await?;
//!     println!("success: {}", result.success);
//!
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod output;
pub mod resource;
pub mod runtime;
pub mod vault;

// Re-export commonly used types
pub use bootstrap::{Binding, BootstrapPhase, Deferred, Placeholder};
pub use channel::{
    CancelHandle, CommandChannel, CommandRequest, CommandResult, HelperChannel, HelperOptions,
    LocalChannel, SessionContext,
};
pub use config::Config;
pub use error::{
    BookmarkError, BrokerError, CommandError, CredentialError, PermissionError, Result,
};
pub use monitor::{AccessEvent, AccessEventKind, AccessSession, ResourceAccessMonitor, SessionStatus};
pub use output::OutputSanitizer;
pub use resource::{
    AccessBroker, AccessTicket, Accessibility, BookmarkStore, BookmarkToken, HandleState,
    PermissionPrompt, ResolvedBookmark, ResourceAccessBroker, ResourceHandle, ResourceId,
};
pub use runtime::{BrokerRuntime, RuntimeBuilder};
pub use vault::{CredentialVault, FileVault, MemoryVault, Secret};
