//! Resource access broker.
//!
//! Brokers permission grants, durable bookmarks and access scopes for
//! filesystem resources. Operations on one resource are serialized through a
//! per-resource lock; operations on distinct resources never contend beyond
//! the brief map accesses.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use super::{
    Accessibility, BookmarkPayload, BookmarkStore, BookmarkToken, HandleState, PermissionDecision,
    PermissionPrompt, ResourceHandle, ResourceId,
};
use crate::error::{BookmarkError, BrokerError, PermissionError};
use crate::monitor::{AccessEvent, AccessEventKind, ResourceAccessMonitor, DEFAULT_MAX_DURATION};
use crate::Result;

/// A bookmark resolved back to its resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBookmark {
    pub path: PathBuf,
    /// The caller should re-create the bookmark before relying on it further.
    pub is_stale: bool,
}

/// Proof of one successful [`ResourceAccessBroker::begin_access`].
///
/// Handing it back to [`ResourceAccessBroker::end_access`] releases exactly
/// the session it was issued for; once that session has expired or been
/// force-closed the release is a no-op.
#[derive(Debug, PartialEq, Eq)]
pub struct AccessTicket {
    resource: ResourceId,
    path: PathBuf,
    generation: u64,
}

impl AccessTicket {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Operations the broker exposes to the rest of the system.
///
/// All methods may block and must not be called from an async executor's
/// core threads without `spawn_blocking` when the prompt is interactive.
pub trait AccessBroker: Send + Sync {
    /// Ask for permission to access `path`.
    ///
    /// Returns `Ok(true)` when access is granted, reusing an earlier grant
    /// without re-prompting when it covers `accessibility`. A refusal is
    /// returned as [`PermissionError::Denied`].
    fn request_permission(&self, path: &Path, accessibility: Accessibility) -> Result<bool>;

    /// Create and persist a durable bookmark for `path`.
    fn create_bookmark(&self, path: &Path) -> Result<BookmarkToken>;

    /// Resolve a bookmark without side effects.
    fn resolve_bookmark(&self, token: &BookmarkToken) -> Result<ResolvedBookmark>;

    /// Open (or re-enter) the access scope on `path`.
    ///
    /// Nested calls are reference-counted. Returns `Ok(false)` when the OS
    /// scope could not be opened.
    fn start_accessing(&self, path: &Path) -> Result<bool>;

    /// Leave the access scope on `path`. The last matching call releases it.
    ///
    /// Stops pair with starts in order; a stop whose start belonged to a
    /// session that has since expired does nothing.
    fn stop_accessing(&self, path: &Path) -> Result<()>;
}

/// Per-resource mutual exclusion.
#[derive(Debug, Default)]
struct ResourceLocks {
    locks: Mutex<HashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    fn with<T>(&self, id: ResourceId, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| BrokerError::LockPoisoned)?;
            Arc::clone(locks.entry(id).or_default())
        };
        let _guard = lock.lock().map_err(|_| BrokerError::LockPoisoned)?;
        f()
    }

    fn discard(&self, id: &ResourceId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(id);
        }
    }
}

/// Default [`AccessBroker`] backed by a prompt, a bookmark store and a monitor.
pub struct ResourceAccessBroker {
    prompt: Arc<dyn PermissionPrompt>,
    store: BookmarkStore,
    monitor: Arc<ResourceAccessMonitor>,
    handles: RwLock<HashMap<ResourceId, ResourceHandle>>,
    locks: ResourceLocks,
    /// Monitor events not yet folded into handle state.
    events: Mutex<broadcast::Receiver<AccessEvent>>,
    /// Session generations of outstanding path-based starts, oldest first.
    pending: Mutex<HashMap<ResourceId, VecDeque<u64>>>,
    max_duration: Duration,
}

impl ResourceAccessBroker {
    pub fn new(
        prompt: Arc<dyn PermissionPrompt>,
        store: BookmarkStore,
        monitor: Arc<ResourceAccessMonitor>,
    ) -> Self {
        let events = Mutex::new(monitor.subscribe());
        Self {
            prompt,
            store,
            monitor,
            handles: RwLock::new(HashMap::new()),
            locks: ResourceLocks::default(),
            events,
            pending: Mutex::new(HashMap::new()),
            max_duration: DEFAULT_MAX_DURATION,
        }
    }

    /// Set the maximum lifetime of sessions opened by `start_accessing`.
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn monitor(&self) -> &Arc<ResourceAccessMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &BookmarkStore {
        &self.store
    }

    /// Snapshot of the handle for `path`, if the broker knows it.
    pub fn handle(&self, path: &Path) -> Option<ResourceHandle> {
        self.absorb_events();
        let (_, id) = ResourceId::for_path(path);
        let handles = self.handles.read().ok()?;
        handles.get(&id).cloned()
    }

    /// The bookmark persisted for `path`, if any.
    pub fn persisted_bookmark(&self, path: &Path) -> Result<Option<BookmarkToken>> {
        let (_, id) = ResourceId::for_path(path);
        self.store.get(&id.storage_key())
    }

    /// Check that `token` is safe to rely on for `required` access.
    ///
    /// Unlike [`resolve_bookmark`](AccessBroker::resolve_bookmark), staleness
    /// is an error here, as is a grant the broker has since revoked or seen
    /// expire.
    pub fn validate_bookmark(
        &self,
        token: &BookmarkToken,
        required: Accessibility,
    ) -> Result<PathBuf> {
        self.absorb_events();
        let payload = BookmarkPayload::decode(token)?;
        let display = payload.path.display().to_string();

        if payload.check()? {
            return Err(BookmarkError::Stale(display).into());
        }
        if !payload.accessibility.covers(required) {
            return Err(BookmarkError::ValidationFailed(format!(
                "{display} was bookmarked {:?}, {:?} required",
                payload.accessibility, required
            ))
            .into());
        }

        let id = ResourceId::for_canonical(&payload.path);
        if let Some(handle) = self.read_handles()?.get(&id) {
            match handle.state {
                HandleState::Revoked => return Err(PermissionError::Denied(display).into()),
                HandleState::Expired => return Err(PermissionError::Expired(display).into()),
                _ => {}
            }
        }
        Ok(payload.path)
    }

    /// Open (or re-enter) the access scope on `path` and return a ticket for
    /// this one entry. `Ok(None)` means the OS scope could not be opened.
    pub fn begin_access(&self, path: &Path) -> Result<Option<AccessTicket>> {
        let (canonical, id) = ResourceId::for_path(path);
        self.locks.with(id, || self.open_session(&canonical, id))
    }

    /// Release the entry `ticket` stands for.
    ///
    /// Returns whether this closed the session.
    pub fn end_access(&self, ticket: AccessTicket) -> Result<bool> {
        let AccessTicket {
            resource,
            generation,
            ..
        } = ticket;
        self.locks
            .with(resource, || self.monitor.end_access(&resource, generation))
    }

    /// Drop everything known about `path`: session, handle and bookmark.
    ///
    /// Returns whether anything was removed.
    pub fn forget(&self, path: &Path) -> Result<bool> {
        let (canonical, id) = ResourceId::for_path(path);
        let removed = self.locks.with(id, || {
            let closed = self.monitor.stop_monitoring(&id)?;
            self.pending()?.remove(&id);
            let had_handle = self.write_handles()?.remove(&id).is_some();
            let had_bookmark = self.store.remove(&id.storage_key())?;
            Ok(closed || had_handle || had_bookmark)
        })?;
        self.locks.discard(&id);

        if removed {
            info!(resource = %id, path = %canonical.display(), "resource forgotten");
        }
        Ok(removed)
    }

    fn read_handles(&self) -> Result<RwLockReadGuard<'_, HashMap<ResourceId, ResourceHandle>>> {
        self.handles.read().map_err(|_| BrokerError::LockPoisoned)
    }

    fn write_handles(&self) -> Result<RwLockWriteGuard<'_, HashMap<ResourceId, ResourceHandle>>> {
        self.handles.write().map_err(|_| BrokerError::LockPoisoned)
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<ResourceId, VecDeque<u64>>>> {
        self.pending.lock().map_err(|_| BrokerError::LockPoisoned)
    }

    /// Grant check plus session start; the caller holds the resource lock.
    fn open_session(&self, canonical: &Path, id: ResourceId) -> Result<Option<AccessTicket>> {
        self.request_permission_locked(canonical, id, Accessibility::ReadOnly)?;

        let handle = self
            .read_handles()?
            .get(&id)
            .cloned()
            .ok_or_else(|| PermissionError::Denied(canonical.display().to_string()))?;

        match self.monitor.start_monitoring(handle, self.max_duration) {
            Ok(session) => Ok(Some(AccessTicket {
                resource: id,
                path: canonical.to_path_buf(),
                generation: session.generation,
            })),
            Err(BrokerError::Io(e)) => {
                warn!(resource = %id, error = %e, "could not open access scope");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn covers(&self, id: &ResourceId, accessibility: Accessibility) -> Result<bool> {
        Ok(self
            .read_handles()?
            .get(id)
            .is_some_and(|h| h.grant_covers(accessibility)))
    }

    /// Fold expiry notifications from the monitor into handle state.
    fn absorb_events(&self) {
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        loop {
            match events.try_recv() {
                Ok(event) if event.kind == AccessEventKind::Expired => {
                    if let Ok(mut handles) = self.handles.write() {
                        if let Some(handle) = handles.get_mut(&event.resource) {
                            if handle.state.transition_to(HandleState::Expired).is_ok() {
                                debug!(resource = %event.resource, "grant marked expired");
                            }
                        }
                    }
                }
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "broker fell behind monitor events");
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Re-establish a grant from a persisted bookmark without prompting.
    fn restore_grant(&self, canonical: &Path, id: ResourceId) -> Result<Option<Accessibility>> {
        if self
            .read_handles()?
            .get(&id)
            .is_some_and(|h| h.state == HandleState::Revoked)
        {
            return Ok(None);
        }

        let Some(token) = self.store.get(&id.storage_key())? else {
            return Ok(None);
        };
        let payload = match BookmarkPayload::decode(&token) {
            Ok(payload) if payload.path.as_path() == canonical => payload,
            Ok(_) => return Ok(None),
            Err(e) => {
                warn!(resource = %id, error = %e, "ignoring unreadable persisted bookmark");
                return Ok(None);
            }
        };
        let is_stale = match payload.check() {
            Ok(is_stale) => is_stale,
            Err(e) => {
                warn!(resource = %id, error = %e, "persisted bookmark no longer resolves");
                return Ok(None);
            }
        };

        let mut handles = self.write_handles()?;
        let handle = handles
            .entry(id)
            .or_insert_with(|| ResourceHandle::new(id, canonical.to_path_buf(), payload.accessibility));
        handle.grant(payload.accessibility)?;
        handle.bookmark = Some(token);

        if is_stale {
            handle.state.transition_to(HandleState::Stale)?;
            warn!(resource = %id, "grant restored from stale bookmark; re-create it");
        } else {
            info!(resource = %id, "grant restored from persisted bookmark");
        }
        Ok(Some(payload.accessibility))
    }

    /// Permission check; the caller holds the resource lock.
    fn request_permission_locked(
        &self,
        canonical: &Path,
        id: ResourceId,
        accessibility: Accessibility,
    ) -> Result<bool> {
        self.absorb_events();
        if self.covers(&id, accessibility)? {
            debug!(resource = %id, "existing grant reused");
            return Ok(true);
        }
        if let Some(restored) = self.restore_grant(canonical, id)? {
            if restored.covers(accessibility) {
                return Ok(true);
            }
        }

        let decision = self.prompt.prompt(canonical, accessibility);

        let mut handles = self.write_handles()?;
        let handle = handles
            .entry(id)
            .or_insert_with(|| ResourceHandle::new(id, canonical.to_path_buf(), accessibility));

        match decision {
            PermissionDecision::Granted => {
                handle.grant(accessibility)?;
                info!(
                    resource = %id,
                    path = %canonical.display(),
                    ?accessibility,
                    "permission granted"
                );
                Ok(true)
            }
            PermissionDecision::Denied { reason } => {
                handle.revoke()?;
                let snapshot = handle.clone();
                drop(handles);

                warn!(resource = %id, path = %canonical.display(), %reason, "permission denied");
                self.monitor.notify_denied(&snapshot);
                Err(PermissionError::Denied(format!("{}: {reason}", canonical.display())).into())
            }
        }
    }
}

impl AccessBroker for ResourceAccessBroker {
    fn request_permission(&self, path: &Path, accessibility: Accessibility) -> Result<bool> {
        let (canonical, id) = ResourceId::for_path(path);
        self.locks.with(id, || {
            self.request_permission_locked(&canonical, id, accessibility)
        })
    }

    fn create_bookmark(&self, path: &Path) -> Result<BookmarkToken> {
        let (canonical, id) = ResourceId::for_path(path);
        self.locks.with(id, || {
            let accessibility = self
                .read_handles()?
                .get(&id)
                .filter(|h| h.state.is_usable())
                .map(|h| h.accessibility)
                .unwrap_or_default();

            let token = BookmarkPayload::capture(&canonical, accessibility)?.encode()?;
            self.store.put(&id.storage_key(), &token).map_err(|e| {
                BookmarkError::CreationFailed(format!("could not persist bookmark: {e}"))
            })?;

            let mut handles = self.write_handles()?;
            let handle = handles
                .entry(id)
                .or_insert_with(|| ResourceHandle::new(id, canonical.clone(), accessibility));
            handle.bookmark = Some(token.clone());
            if handle.state == HandleState::Stale {
                handle.state.transition_to(HandleState::Granted)?;
            }

            info!(resource = %id, path = %canonical.display(), "bookmark created");
            Ok(token)
        })
    }

    fn resolve_bookmark(&self, token: &BookmarkToken) -> Result<ResolvedBookmark> {
        let payload = BookmarkPayload::decode(token)?;
        let is_stale = payload.check()?;
        if is_stale {
            debug!(path = %payload.path.display(), "bookmark resolved stale");
        }
        Ok(ResolvedBookmark {
            path: payload.path,
            is_stale,
        })
    }

    fn start_accessing(&self, path: &Path) -> Result<bool> {
        let (canonical, id) = ResourceId::for_path(path);
        self.locks.with(id, || {
            let Some(ticket) = self.open_session(&canonical, id)? else {
                return Ok(false);
            };
            self.pending()?
                .entry(id)
                .or_default()
                .push_back(ticket.generation);
            Ok(true)
        })
    }

    fn stop_accessing(&self, path: &Path) -> Result<()> {
        let (_, id) = ResourceId::for_path(path);
        self.locks.with(id, || {
            let generation = {
                let mut pending = self.pending()?;
                let generation = pending.get_mut(&id).and_then(VecDeque::pop_front);
                if pending.get(&id).is_some_and(VecDeque::is_empty) {
                    pending.remove(&id);
                }
                generation
            };
            match generation {
                Some(generation) => {
                    self.monitor.end_access(&id, generation)?;
                }
                None => debug!(resource = %id, "stop without a matching start ignored"),
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for ResourceAccessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAccessBroker")
            .field("handles", &self.handles.read().map(|h| h.len()).unwrap_or(0))
            .field("bookmarks", &self.store.len())
            .field("max_duration", &self.max_duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DescriptorScope, SimulatedPrompt};

    struct Fixture {
        _dir: tempfile::TempDir,
        file: PathBuf,
        prompt: Arc<SimulatedPrompt>,
        broker: ResourceAccessBroker,
    }

    fn fixture_with(prompt: SimulatedPrompt, store: BookmarkStore) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, b"payload").unwrap();
        let file = std::fs::canonicalize(file).unwrap();

        let prompt = Arc::new(prompt);
        let monitor = Arc::new(ResourceAccessMonitor::new(Arc::new(DescriptorScope::new())));
        let broker = ResourceAccessBroker::new(prompt.clone(), store, monitor);
        Fixture {
            _dir: dir,
            file,
            prompt,
            broker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SimulatedPrompt::granting(), BookmarkStore::in_memory())
    }

    #[test]
    fn test_grant_then_bookmark_round_trip() {
        let fx = fixture();
        assert!(fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).unwrap());

        let token = fx.broker.create_bookmark(&fx.file).unwrap();
        let resolved = fx.broker.resolve_bookmark(&token).unwrap();
        assert_eq!(resolved.path, fx.file);
        assert!(!resolved.is_stale);
        assert_eq!(fx.broker.persisted_bookmark(&fx.file).unwrap(), Some(token));
    }

    #[test]
    fn test_denial_is_an_error_and_revokes() {
        let fx = fixture_with(SimulatedPrompt::denying(), BookmarkStore::in_memory());
        let mut events = fx.broker.monitor().subscribe();

        let err = fx
            .broker
            .request_permission(&fx.file, Accessibility::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, BrokerError::Permission(PermissionError::Denied(_))));
        assert_eq!(fx.broker.handle(&fx.file).unwrap().state, HandleState::Revoked);
        assert_eq!(events.try_recv().unwrap().kind, AccessEventKind::Denied);
    }

    #[test]
    fn test_denial_is_not_cached() {
        let fx = fixture_with(SimulatedPrompt::denying(), BookmarkStore::in_memory());
        assert!(fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).is_err());

        fx.prompt.set_granting(true);
        assert!(fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).unwrap());
        assert_eq!(fx.prompt.prompt_count(), 2);
    }

    #[test]
    fn test_grant_is_reused_without_prompt() {
        let fx = fixture();
        fx.broker.request_permission(&fx.file, Accessibility::ReadWrite).unwrap();
        fx.broker.request_permission(&fx.file, Accessibility::ReadWrite).unwrap();
        fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).unwrap();
        assert_eq!(fx.prompt.prompt_count(), 1);
    }

    #[test]
    fn test_upgrade_to_read_write_prompts_again() {
        let fx = fixture();
        fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).unwrap();
        fx.broker.request_permission(&fx.file, Accessibility::ReadWrite).unwrap();
        assert_eq!(fx.prompt.prompt_count(), 2);
        assert_eq!(
            fx.broker.handle(&fx.file).unwrap().accessibility,
            Accessibility::ReadWrite
        );
    }

    #[test]
    fn test_bookmark_missing_resource_fails() {
        let fx = fixture();
        let err = fx
            .broker
            .create_bookmark(Path::new("/no/such/resource"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Bookmark(BookmarkError::CreationFailed(_))));
    }

    #[test]
    fn test_start_stop_is_reference_counted() {
        let fx = fixture();
        let (_, id) = ResourceId::for_path(&fx.file);

        assert!(fx.broker.start_accessing(&fx.file).unwrap());
        assert!(fx.broker.start_accessing(&fx.file).unwrap());
        fx.broker.stop_accessing(&fx.file).unwrap();
        assert!(fx.broker.monitor().is_monitoring(&id));

        fx.broker.stop_accessing(&fx.file).unwrap();
        assert!(!fx.broker.monitor().is_monitoring(&id));

        // Unbalanced stop is harmless.
        fx.broker.stop_accessing(&fx.file).unwrap();
    }

    #[test]
    fn test_start_prompts_implicitly() {
        let fx = fixture();
        assert!(fx.broker.start_accessing(&fx.file).unwrap());
        assert_eq!(fx.prompt.prompt_count(), 1);
        fx.broker.stop_accessing(&fx.file).unwrap();
    }

    #[test]
    fn test_start_denied_propagates() {
        let fx = fixture_with(SimulatedPrompt::denying(), BookmarkStore::in_memory());
        assert!(matches!(
            fx.broker.start_accessing(&fx.file),
            Err(BrokerError::Permission(PermissionError::Denied(_)))
        ));
        assert_eq!(fx.broker.monitor().active_count(), 0);
    }

    #[test]
    fn test_start_on_unopenable_resource_returns_false() {
        let fx = fixture();
        assert!(!fx.broker.start_accessing(Path::new("/no/such/resource")).unwrap());
        assert_eq!(fx.broker.monitor().active_count(), 0);
    }

    #[test]
    fn test_persisted_bookmark_restores_grant() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("bookmarks.json");

        let first = fixture_with(
            SimulatedPrompt::granting(),
            BookmarkStore::open(&store_path).unwrap(),
        );
        first.broker.request_permission(&first.file, Accessibility::ReadOnly).unwrap();
        first.broker.create_bookmark(&first.file).unwrap();

        // A fresh broker over the same store; the prompt would refuse.
        let prompt = Arc::new(SimulatedPrompt::denying());
        let monitor = Arc::new(ResourceAccessMonitor::new(Arc::new(DescriptorScope::new())));
        let second = ResourceAccessBroker::new(
            prompt.clone(),
            BookmarkStore::open(&store_path).unwrap(),
            monitor,
        );

        assert!(second.start_accessing(&first.file).unwrap());
        assert_eq!(prompt.prompt_count(), 0);
        second.stop_accessing(&first.file).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_bookmark_requires_recreation() {
        let fx = fixture();
        fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).unwrap();
        let token = fx.broker.create_bookmark(&fx.file).unwrap();

        let moved = fx.file.with_extension("old");
        std::fs::rename(&fx.file, &moved).unwrap();
        std::fs::write(&fx.file, b"replacement").unwrap();

        let resolved = fx.broker.resolve_bookmark(&token).unwrap();
        assert!(resolved.is_stale);
        assert!(matches!(
            fx.broker.validate_bookmark(&token, Accessibility::ReadOnly),
            Err(BrokerError::Bookmark(BookmarkError::Stale(_)))
        ));

        let fresh = fx.broker.create_bookmark(&fx.file).unwrap();
        assert!(!fx.broker.resolve_bookmark(&fresh).unwrap().is_stale);
    }

    #[test]
    fn test_validate_rejects_insufficient_access() {
        let fx = fixture();
        fx.broker.request_permission(&fx.file, Accessibility::ReadOnly).unwrap();
        let token = fx.broker.create_bookmark(&fx.file).unwrap();

        assert_eq!(
            fx.broker.validate_bookmark(&token, Accessibility::ReadOnly).unwrap(),
            fx.file
        );
        assert!(matches!(
            fx.broker.validate_bookmark(&token, Accessibility::ReadWrite),
            Err(BrokerError::Bookmark(BookmarkError::ValidationFailed(_)))
        ));
    }

    #[test]
    fn test_resolve_garbage_fails() {
        let fx = fixture();
        let token = BookmarkToken::from_bytes(b"garbage".to_vec());
        assert!(matches!(
            fx.broker.resolve_bookmark(&token),
            Err(BrokerError::Bookmark(BookmarkError::ResolutionFailed(_)))
        ));
    }

    #[test]
    fn test_forget_clears_everything() {
        let fx = fixture();
        fx.broker.start_accessing(&fx.file).unwrap();
        fx.broker.create_bookmark(&fx.file).unwrap();

        assert!(fx.broker.forget(&fx.file).unwrap());
        assert!(fx.broker.handle(&fx.file).is_none());
        assert!(fx.broker.persisted_bookmark(&fx.file).unwrap().is_none());
        assert_eq!(fx.broker.monitor().active_count(), 0);
        assert!(!fx.broker.forget(&fx.file).unwrap());
    }

    fn short_lived_broker(file: &Path) -> ResourceAccessBroker {
        std::fs::write(file, b"x").unwrap();
        let monitor = Arc::new(ResourceAccessMonitor::new(Arc::new(DescriptorScope::new())));
        ResourceAccessBroker::new(
            Arc::new(SimulatedPrompt::granting()),
            BookmarkStore::in_memory(),
            monitor,
        )
        .with_max_duration(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_stop_after_expiry_leaves_newer_session_open() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("shared.txt");
        let broker = short_lived_broker(&file);

        // First holder's session expires before it stops.
        assert!(broker.start_accessing(&file).unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(broker.monitor().active_count(), 0);

        // Second holder opens a fresh session.
        assert!(broker.start_accessing(&file).unwrap());
        assert_eq!(broker.monitor().active_count(), 1);

        // The late stop pairs with the expired session only.
        broker.stop_accessing(&file).unwrap();
        assert_eq!(broker.monitor().active_count(), 1);

        broker.stop_accessing(&file).unwrap();
        assert_eq!(broker.monitor().active_count(), 0);
    }

    #[tokio::test]
    async fn test_ticket_from_expired_session_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ticketed.txt");
        let broker = short_lived_broker(&file);

        let stale = broker.begin_access(&file).unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let fresh = broker.begin_access(&file).unwrap().unwrap();
        assert_eq!(fresh.resource(), stale.resource());
        assert_eq!(fresh.path(), stale.path());

        assert!(!broker.end_access(stale).unwrap());
        assert_eq!(broker.monitor().active_count(), 1);
        assert!(broker.end_access(fresh).unwrap());
        assert_eq!(broker.monitor().active_count(), 0);
    }

    #[test]
    fn test_ticket_pairs_with_nested_entries() {
        let fx = fixture();
        let outer = fx.broker.begin_access(&fx.file).unwrap().unwrap();
        let inner = fx.broker.begin_access(&fx.file).unwrap().unwrap();

        assert!(!fx.broker.end_access(inner).unwrap());
        assert_eq!(fx.broker.monitor().active_count(), 1);
        assert!(fx.broker.end_access(outer).unwrap());
        assert_eq!(fx.broker.monitor().active_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_marks_grant_expired() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("short.txt");
        std::fs::write(&file, b"x").unwrap();

        let prompt = Arc::new(SimulatedPrompt::granting());
        let monitor = Arc::new(ResourceAccessMonitor::new(Arc::new(DescriptorScope::new())));
        let broker = ResourceAccessBroker::new(prompt.clone(), BookmarkStore::in_memory(), monitor)
            .with_max_duration(Duration::from_millis(50));

        broker.start_accessing(&file).unwrap();
        let token = broker.create_bookmark(&file).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(broker.handle(&file).unwrap().state, HandleState::Expired);
        assert!(matches!(
            broker.validate_bookmark(&token, Accessibility::ReadOnly),
            Err(BrokerError::Permission(PermissionError::Expired(_)))
        ));

        // Starting again re-establishes the grant from the bookmark.
        assert!(broker.start_accessing(&file).unwrap());
        assert_eq!(prompt.prompt_count(), 1);
        broker.stop_accessing(&file).unwrap();
    }
}
