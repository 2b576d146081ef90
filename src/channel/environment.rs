//! Child environment composition.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::CommandRequest;
use crate::bootstrap::{Binding, Deferred, Placeholder};
use crate::resource::AccessBroker;

/// Default prefix of bookmark environment variables.
pub const DEFAULT_BOOKMARK_PREFIX: &str = "SCOPE_BROKER_BOOKMARK";

/// Exposes request bookmarks to the child as environment variables.
///
/// For a bookmark named `SOURCE` the child sees `<PREFIX>_SOURCE` (the token
/// in base64) and, once the broker is bound and the token resolves,
/// `<PREFIX>_SOURCE_PATH` (the resolved path) and `<PREFIX>_SOURCE_STALE=1`
/// when the bookmark is stale.
#[derive(Debug, Clone)]
pub struct BookmarkEnvironment {
    prefix: String,
    broker: Deferred<dyn AccessBroker>,
    fallback: Placeholder,
}

impl BookmarkEnvironment {
    pub fn new(
        prefix: impl Into<String>,
        broker: Deferred<dyn AccessBroker>,
        fallback: Placeholder,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            broker,
            fallback,
        }
    }

    /// Variables derived from the request's bookmarks.
    pub fn variables(&self, request: &CommandRequest) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        for (name, token) in &request.bookmarks {
            let key = format!("{}_{}", self.prefix, name.to_ascii_uppercase());

            let resolved = match self.broker.binding() {
                Binding::Ready(broker) => broker.resolve_bookmark(token),
                Binding::Uninitialized => self.fallback.resolve_bookmark(token),
            };
            match resolved {
                Ok(resolved) => {
                    vars.insert(
                        format!("{key}_PATH"),
                        resolved.path.to_string_lossy().into_owned(),
                    );
                    if resolved.is_stale {
                        warn!(
                            context = %request.session_context,
                            bookmark = %name,
                            "passing stale bookmark to command"
                        );
                        vars.insert(format!("{key}_STALE"), "1".to_string());
                    }
                }
                Err(e) => {
                    debug!(bookmark = %name, error = %e, "bookmark passed unresolved");
                }
            }
            vars.insert(key, token.to_base64());
        }
        vars
    }

    /// Full child environment: `PATH`, request variables, then bookmarks.
    pub fn compose(&self, request: &CommandRequest) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(path) = std::env::var_os("PATH") {
            env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
        }
        env.extend(request.environment.clone());
        env.extend(self.variables(request));
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bootstrap::BootstrapPhase;
    use crate::monitor::ResourceAccessMonitor;
    use crate::resource::{
        BookmarkStore, BookmarkToken, DescriptorScope, ResourceAccessBroker, SimulatedPrompt,
    };

    fn environment() -> (BookmarkEnvironment, Deferred<dyn AccessBroker>) {
        let slot: Deferred<dyn AccessBroker> = Deferred::new("broker");
        let env = BookmarkEnvironment::new(
            "TEST_BM",
            slot.clone(),
            Placeholder::new(Arc::new(BootstrapPhase::new())),
        );
        (env, slot)
    }

    fn broker() -> Arc<ResourceAccessBroker> {
        let monitor = Arc::new(ResourceAccessMonitor::new(Arc::new(DescriptorScope::new())));
        Arc::new(ResourceAccessBroker::new(
            Arc::new(SimulatedPrompt::granting()),
            BookmarkStore::in_memory(),
            monitor,
        ))
    }

    #[test]
    fn test_unbound_broker_passes_token_only() {
        let (env, _slot) = environment();
        let req = CommandRequest::new("true").bookmark("src", BookmarkToken::from_bytes(vec![1]));

        let vars = env.variables(&req);
        assert_eq!(vars.get("TEST_BM_SRC"), Some(&"AQ==".to_string()));
        assert!(!vars.contains_key("TEST_BM_SRC_PATH"));
    }

    #[test]
    fn test_bound_broker_adds_path() {
        let dir = tempfile::tempdir().unwrap();
        let (env, slot) = environment();
        let broker = broker();
        let token = broker.create_bookmark(dir.path()).unwrap();
        slot.bind(broker).unwrap();

        let req = CommandRequest::new("true").bookmark("SOURCE", token.clone());
        let vars = env.variables(&req);

        assert_eq!(vars.get("TEST_BM_SOURCE"), Some(&token.to_base64()));
        assert_eq!(
            vars.get("TEST_BM_SOURCE_PATH").map(String::as_str),
            std::fs::canonicalize(dir.path()).unwrap().to_str()
        );
        assert!(!vars.contains_key("TEST_BM_SOURCE_STALE"));
    }

    #[test]
    fn test_compose_layers() {
        let (env, _slot) = environment();
        let req = CommandRequest::new("true")
            .env("LANG", "C")
            .env("TEST_BM_X", "overridden")
            .bookmark("X", BookmarkToken::from_bytes(vec![1]));

        let vars = env.compose(&req);
        assert_eq!(vars.get("LANG"), Some(&"C".to_string()));
        assert_eq!(vars.get("TEST_BM_X"), Some(&"AQ==".to_string()));
        if std::env::var_os("PATH").is_some() {
            assert!(vars.contains_key("PATH"));
        }
    }
}
