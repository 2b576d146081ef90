//! Two-phase construction support.
//!
//! Components that need a dependency which is only built later hold a
//! [`Deferred`] slot and match on its [`Binding`]. The [`Placeholder`] is
//! the explicit answer for the `Uninitialized` case; calls that reach it
//! after startup are counted as initialization-order defects.

mod deferred;
mod placeholder;

pub use deferred::{Binding, Deferred};
pub use placeholder::{BootstrapPhase, Placeholder};
