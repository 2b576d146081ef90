//! Session registry and expiry scheduling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::{AccessEvent, AccessEventKind, AccessSession, SessionStatus};
use crate::error::BrokerError;
use crate::resource::{AccessScope, HandleState, ResourceHandle, ResourceId};
use crate::Result;

/// Default maximum lifetime of an access session.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(3600);

/// How far past its budget a session may run before the monitor reports
/// itself unhealthy.
pub const DEFAULT_EXPIRY_GRACE: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;

struct Tracked {
    session: AccessSession,
    /// Outstanding `start` calls on this resource.
    refs: usize,
    generation: u64,
    timer: Option<AbortHandle>,
}

type Sessions = HashMap<ResourceId, Tracked>;

/// Tracks open access sessions and force-closes them when they expire.
///
/// All registry state lives behind one mutex. Scope release and event
/// emission always happen after the lock is dropped, and expiry timers
/// re-acquire the lock through the same path as explicit stops.
pub struct ResourceAccessMonitor {
    scope: Arc<dyn AccessScope>,
    sessions: Mutex<Sessions>,
    events: broadcast::Sender<AccessEvent>,
    next_generation: AtomicU64,
    expiry_grace: Duration,
}

impl ResourceAccessMonitor {
    /// Create a monitor that opens and releases scopes through `scope`.
    pub fn new(scope: Arc<dyn AccessScope>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scope,
            sessions: Mutex::new(HashMap::new()),
            events,
            next_generation: AtomicU64::new(1),
            expiry_grace: DEFAULT_EXPIRY_GRACE,
        }
    }

    /// Override the grace period used by [`is_healthy`](Self::is_healthy).
    pub fn with_expiry_grace(mut self, grace: Duration) -> Self {
        self.expiry_grace = grace;
        self
    }

    /// Subscribe to lifecycle events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<AccessEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Sessions>> {
        self.sessions.lock().map_err(|_| BrokerError::LockPoisoned)
    }

    /// Register a session for `handle` and arm its expiry timer.
    ///
    /// If the resource is already monitored the existing session is
    /// returned and its reference count incremented; no second scope is
    /// acquired and no second timer is scheduled.
    pub fn start_monitoring(
        self: &Arc<Self>,
        handle: ResourceHandle,
        max_duration: Duration,
    ) -> Result<AccessSession> {
        let id = handle.id;
        let session = {
            let mut sessions = self.lock()?;
            if let Some(tracked) = sessions.get_mut(&id) {
                tracked.refs += 1;
                debug!(resource = %id, refs = tracked.refs, "session already active");
                return Ok(tracked.session.clone());
            }

            self.scope.acquire(&handle.path)?;

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let session = AccessSession::new(handle, max_duration, generation);
            let timer = self.schedule_expiry(id, generation, max_duration);
            sessions.insert(
                id,
                Tracked {
                    session: session.clone(),
                    refs: 1,
                    generation,
                    timer,
                },
            );
            session
        };

        info!(
            resource = %id,
            path = %session.handle.path.display(),
            max_secs = max_duration.as_secs_f64(),
            "access session started"
        );
        self.emit(AccessEventKind::Granted, &session);
        Ok(session)
    }

    /// Close the session for `id` regardless of its reference count.
    ///
    /// Returns whether a session was closed. Calling this on an unmonitored
    /// resource is a no-op.
    pub fn stop_monitoring(&self, id: &ResourceId) -> Result<bool> {
        let tracked = self.lock()?.remove(id);
        match tracked {
            Some(tracked) => {
                info!(resource = %id, "access session stopped");
                self.finish(tracked, AccessEventKind::Revoked);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop one reference taken on session `generation`; the last one
    /// closes the session.
    ///
    /// A release for an earlier session (one that expired or was force-closed
    /// since) is ignored, so it can never close a newer session.
    pub(crate) fn end_access(&self, id: &ResourceId, generation: u64) -> Result<bool> {
        let tracked = {
            let mut sessions = self.lock()?;
            let remaining = match sessions.get_mut(id) {
                Some(tracked) if tracked.generation == generation => {
                    tracked.refs = tracked.refs.saturating_sub(1);
                    tracked.refs
                }
                Some(tracked) => {
                    debug!(
                        resource = %id,
                        generation,
                        current = tracked.generation,
                        "release for an earlier session ignored"
                    );
                    return Ok(false);
                }
                None => return Ok(false),
            };
            if remaining > 0 {
                debug!(resource = %id, refs = remaining, "access reference released");
                return Ok(false);
            }
            sessions.remove(id)
        };

        match tracked {
            Some(tracked) => {
                info!(resource = %id, "access session ended");
                self.finish(tracked, AccessEventKind::Revoked);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_monitoring(&self, id: &ResourceId) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    /// Snapshot of the session for `id`, if active.
    pub fn session(&self, id: &ResourceId) -> Option<AccessSession> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(id).map(|t| t.session.clone()))
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// False if any session outlived its budget without being closed.
    pub fn is_healthy(&self) -> bool {
        let sessions = match self.sessions.lock() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let leaked: Vec<ResourceId> = sessions
            .iter()
            .filter(|(_, t)| t.session.is_overdue(self.expiry_grace))
            .map(|(id, _)| *id)
            .collect();

        for id in &leaked {
            warn!(resource = %id, "session exceeded max duration without closing");
        }
        leaked.is_empty()
    }

    /// Force-close every session. Used on process termination.
    ///
    /// Returns the number of sessions closed.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Tracked> = match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, t)| t).collect(),
            Err(_) => {
                error!("session registry poisoned; cannot release scopes at shutdown");
                return 0;
            }
        };

        let count = drained.len();
        for tracked in drained {
            self.finish(tracked, AccessEventKind::Revoked);
        }
        if count > 0 {
            info!(count, "force-closed access sessions at shutdown");
        }
        count
    }

    /// Publish a `Denied` event for a refused permission request.
    pub fn notify_denied(&self, handle: &ResourceHandle) {
        let _ = self.events.send(AccessEvent::new(
            AccessEventKind::Denied,
            handle.id,
            handle.path.clone(),
        ));
    }

    fn schedule_expiry(
        self: &Arc<Self>,
        id: ResourceId,
        generation: u64,
        after: Duration,
    ) -> Option<AbortHandle> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(resource = %id, "no async runtime; session will not expire on its own");
                return None;
            }
        };

        let monitor: Weak<Self> = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(monitor) = monitor.upgrade() {
                monitor.expire(id, generation);
            }
        });
        Some(task.abort_handle())
    }

    fn expire(&self, id: ResourceId, generation: u64) {
        let tracked = match self.sessions.lock() {
            Ok(mut sessions) => {
                let current = sessions.get(&id).is_some_and(|t| {
                    t.generation == generation && t.session.status == SessionStatus::Active
                });
                if current {
                    sessions.remove(&id)
                } else {
                    None
                }
            }
            Err(_) => {
                error!(resource = %id, "session registry poisoned; expiry skipped");
                return;
            }
        };

        let Some(mut tracked) = tracked else {
            debug!(resource = %id, generation, "outdated expiry timer ignored");
            return;
        };

        // This task is the timer; nothing to abort.
        tracked.timer = None;
        let _ = tracked.session.status.transition_to(SessionStatus::Expired);
        let _ = tracked.session.handle.state.transition_to(HandleState::Expired);
        warn!(
            resource = %id,
            elapsed_secs = tracked.session.elapsed().as_secs_f64(),
            "access session expired; force-closing"
        );
        self.finish(tracked, AccessEventKind::Expired);
    }

    /// Release the scope and announce the close. Must be called without the lock held.
    fn finish(&self, mut tracked: Tracked, kind: AccessEventKind) {
        if let Some(timer) = tracked.timer.take() {
            timer.abort();
        }
        self.scope.release(&tracked.session.handle.path);
        let _ = tracked.session.status.transition_to(SessionStatus::Closed);
        self.emit(kind, &tracked.session);
    }

    fn emit(&self, kind: AccessEventKind, session: &AccessSession) {
        // No subscribers is not an error.
        let _ = self.events.send(AccessEvent::new(
            kind,
            session.handle.id,
            session.handle.path.clone(),
        ));
    }
}

impl std::fmt::Debug for ResourceAccessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAccessMonitor")
            .field("active", &self.active_count())
            .field("expiry_grace", &self.expiry_grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Accessibility;
    use std::path::{Path, PathBuf};
    use tokio::sync::broadcast::error::TryRecvError;

    #[derive(Default)]
    struct CountingScope {
        acquired: Mutex<HashMap<PathBuf, usize>>,
        released: Mutex<HashMap<PathBuf, usize>>,
    }

    impl CountingScope {
        fn acquired(&self, path: &Path) -> usize {
            *self.acquired.lock().unwrap().get(path).unwrap_or(&0)
        }
        fn released(&self, path: &Path) -> usize {
            *self.released.lock().unwrap().get(path).unwrap_or(&0)
        }
    }

    impl AccessScope for CountingScope {
        fn acquire(&self, path: &Path) -> std::io::Result<()> {
            if path.starts_with("/unreachable") {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
            }
            *self.acquired.lock().unwrap().entry(path.into()).or_default() += 1;
            Ok(())
        }
        fn release(&self, path: &Path) {
            *self.released.lock().unwrap().entry(path.into()).or_default() += 1;
        }
    }

    fn handle(path: &str) -> ResourceHandle {
        let mut h = ResourceHandle::new(
            ResourceId::for_canonical(Path::new(path)),
            PathBuf::from(path),
            Accessibility::ReadOnly,
        );
        h.grant(Accessibility::ReadOnly).unwrap();
        h
    }

    fn monitor() -> (Arc<CountingScope>, Arc<ResourceAccessMonitor>) {
        let scope = Arc::new(CountingScope::default());
        let monitor = Arc::new(ResourceAccessMonitor::new(scope.clone()));
        (scope, monitor)
    }

    #[tokio::test]
    async fn test_start_stop_and_idempotent_stop() {
        let (scope, monitor) = monitor();
        let h = handle("/srv/a");
        let mut events = monitor.subscribe();

        monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();
        assert!(monitor.is_monitoring(&h.id));
        assert_eq!(events.try_recv().unwrap().kind, AccessEventKind::Granted);

        assert!(monitor.stop_monitoring(&h.id).unwrap());
        assert!(!monitor.is_monitoring(&h.id));
        assert_eq!(events.try_recv().unwrap().kind, AccessEventKind::Revoked);

        // Second stop: no error, no event, no second release.
        assert!(!monitor.stop_monitoring(&h.id).unwrap());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(scope.released(&h.path), 1);
    }

    #[tokio::test]
    async fn test_start_twice_returns_existing() {
        let (scope, monitor) = monitor();
        let h = handle("/srv/a");

        let first = monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();
        let second = monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();

        assert_eq!(first.started_at, second.started_at);
        assert_eq!(scope.acquired(&h.path), 1);
        assert_eq!(monitor.active_count(), 1);
    }

    #[tokio::test]
    async fn test_end_access_is_reference_counted() {
        let (scope, monitor) = monitor();
        let h = handle("/srv/a");

        let first = monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();
        let second = monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();
        assert_eq!(first.generation, second.generation);

        assert!(!monitor.end_access(&h.id, first.generation).unwrap());
        assert!(monitor.is_monitoring(&h.id));
        assert_eq!(scope.released(&h.path), 0);

        assert!(monitor.end_access(&h.id, second.generation).unwrap());
        assert!(!monitor.is_monitoring(&h.id));
        assert_eq!(scope.released(&h.path), 1);

        assert!(!monitor.end_access(&h.id, first.generation).unwrap());
    }

    #[tokio::test]
    async fn test_late_release_does_not_close_newer_session() {
        let (scope, monitor) = monitor();
        let h = handle("/srv/a");

        let expired = monitor.start_monitoring(h.clone(), Duration::from_millis(30)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!monitor.is_monitoring(&h.id));

        let fresh = monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();
        assert_ne!(expired.generation, fresh.generation);

        // The first holder's stop arrives after its session expired.
        assert!(!monitor.end_access(&h.id, expired.generation).unwrap());
        assert!(monitor.is_monitoring(&h.id));
        assert_eq!(scope.released(&h.path), 1);

        assert!(monitor.end_access(&h.id, fresh.generation).unwrap());
        assert_eq!(scope.released(&h.path), 2);
    }

    #[tokio::test]
    async fn test_expiry_releases_exactly_once() {
        let (scope, monitor) = monitor();
        let h = handle("/srv/expiring");
        let mut events = monitor.subscribe();

        monitor.start_monitoring(h.clone(), Duration::from_millis(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!monitor.is_monitoring(&h.id));
        assert_eq!(scope.released(&h.path), 1);
        assert_eq!(events.recv().await.unwrap().kind, AccessEventKind::Granted);
        assert_eq!(events.recv().await.unwrap().kind, AccessEventKind::Expired);

        // Stopping after expiry is a silent no-op.
        assert!(!monitor.stop_monitoring(&h.id).unwrap());
        assert_eq!(scope.released(&h.path), 1);
    }

    #[tokio::test]
    async fn test_explicit_stop_cancels_timer() {
        let (scope, monitor) = monitor();
        let h = handle("/srv/a");
        let mut events = monitor.subscribe();

        monitor.start_monitoring(h.clone(), Duration::from_millis(50)).unwrap();
        monitor.stop_monitoring(&h.id).unwrap();

        // Restart; the first timer must not close the new session.
        monitor.start_monitoring(h.clone(), Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(monitor.is_monitoring(&h.id));
        assert_eq!(scope.released(&h.path), 1);

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AccessEventKind::Granted,
                AccessEventKind::Revoked,
                AccessEventKind::Granted
            ]
        );
    }

    #[tokio::test]
    async fn test_distinct_resources_are_independent() {
        let (_scope, monitor) = monitor();
        let a = handle("/srv/a");
        let b = handle("/srv/b");

        monitor.start_monitoring(a.clone(), Duration::from_secs(60)).unwrap();
        monitor.start_monitoring(b.clone(), Duration::from_secs(60)).unwrap();
        monitor.stop_monitoring(&a.id).unwrap();

        assert!(!monitor.is_monitoring(&a.id));
        assert!(monitor.is_monitoring(&b.id));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (scope, monitor) = monitor();
        let a = handle("/srv/a");
        let b = handle("/srv/b");
        monitor.start_monitoring(a.clone(), Duration::from_secs(60)).unwrap();
        monitor.start_monitoring(b.clone(), Duration::from_secs(60)).unwrap();

        assert_eq!(monitor.shutdown(), 2);
        assert_eq!(monitor.active_count(), 0);
        assert_eq!(scope.released(&a.path), 1);
        assert_eq!(scope.released(&b.path), 1);
    }

    #[tokio::test]
    async fn test_acquire_failure_registers_nothing() {
        let (_scope, monitor) = monitor();
        let h = handle("/unreachable/x");

        assert!(monitor.start_monitoring(h.clone(), Duration::from_secs(60)).is_err());
        assert!(!monitor.is_monitoring(&h.id));
    }

    #[test]
    fn test_leaked_session_is_unhealthy() {
        // Without a runtime no timer is armed, so the session can leak.
        let scope = Arc::new(CountingScope::default());
        let monitor = Arc::new(
            ResourceAccessMonitor::new(scope).with_expiry_grace(Duration::from_millis(1)),
        );
        let h = handle("/srv/leak");

        monitor.start_monitoring(h.clone(), Duration::from_millis(50)).unwrap();
        assert!(monitor.is_healthy());

        std::thread::sleep(Duration::from_millis(120));
        assert!(!monitor.is_healthy());

        monitor.stop_monitoring(&h.id).unwrap();
        assert!(monitor.is_healthy());
    }
}
