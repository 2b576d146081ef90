//! Late-bound dependency slots.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::error::BrokerError;
use crate::Result;

/// State of a [`Deferred`] slot as seen by a caller.
pub enum Binding<T: ?Sized> {
    /// Construction has not reached the phase that provides the value.
    Uninitialized,
    Ready(Arc<T>),
}

impl<T: ?Sized> Binding<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Binding::Ready(_))
    }
}

impl<T: ?Sized> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Uninitialized => f.write_str("Uninitialized"),
            Binding::Ready(_) => f.write_str("Ready(..)"),
        }
    }
}

/// A dependency that is bound exactly once, after its consumers exist.
///
/// Clones share the slot. Consumers hold a `Deferred` from phase one of
/// construction and observe [`Binding::Ready`] once phase two binds it.
pub struct Deferred<T: ?Sized> {
    name: &'static str,
    slot: Arc<OnceLock<Arc<T>>>,
}

impl<T: ?Sized> Deferred<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// Bind the value. Fails if the slot was already bound.
    pub fn bind(&self, value: Arc<T>) -> Result<()> {
        self.slot.set(value).map_err(|_| {
            BrokerError::OperationUnavailable(format!("{} is already bound", self.name))
        })?;
        debug!(dependency = self.name, "deferred dependency bound");
        Ok(())
    }

    /// Current binding; callers must handle both variants.
    pub fn binding(&self) -> Binding<T> {
        match self.slot.get() {
            Some(value) => Binding::Ready(Arc::clone(value)),
            None => Binding::Uninitialized,
        }
    }

    /// The bound value, or `OperationUnavailable` before binding.
    pub fn get(&self) -> Result<Arc<T>> {
        match self.binding() {
            Binding::Ready(value) => Ok(value),
            Binding::Uninitialized => Err(BrokerError::OperationUnavailable(format!(
                "{} is not initialized yet",
                self.name
            ))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}
