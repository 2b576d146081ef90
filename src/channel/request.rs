//! Command request building and representation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource::BookmarkToken;

/// Timeout applied when a request does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque correlation identifier attached to a command for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionContext(Uuid);

impl SessionContext {
    /// Generate a fresh random context.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0.simple())
    }
}

/// A privileged command and everything needed to run it in isolation.
///
/// The child process sees only `environment`, the bookmark variables derived
/// from `bookmarks` and `PATH`; nothing else is inherited.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Program to execute (looked up on `PATH` when not a path).
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub working_directory: PathBuf,
    /// Durable access tokens keyed by name.
    #[serde(default, with = "bookmark_map")]
    pub bookmarks: BTreeMap<String, BookmarkToken>,
    /// Hard wall-clock bound, in (fractional) seconds on the wire.
    #[serde(with = "float_secs")]
    pub timeout: Duration,
    pub session_context: SessionContext,
}

impl CommandRequest {
    /// Create a request for `command` in the current directory.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            bookmarks: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            session_context: SessionContext::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.environment.insert(k.into(), v.into());
        }
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Attach a bookmark under `name`.
    pub fn bookmark(mut self, name: impl Into<String>, token: BookmarkToken) -> Self {
        self.bookmarks.insert(name.into(), token);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    pub fn session_context(mut self, context: SessionContext) -> Self {
        self.session_context = context;
        self
    }
}

// Environment values may carry credentials; only keys are printed.
impl fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("command", &self.command)
            .field("arguments", &self.arguments)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("working_directory", &self.working_directory)
            .field("bookmarks", &self.bookmarks.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("session_context", &self.session_context)
            .finish()
    }
}

mod float_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid timeout {secs}: {e}")))
    }
}

mod bookmark_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::resource::BookmarkToken;

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<String, BookmarkToken>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .iter()
            .map(|(name, token)| (name.as_str(), token.to_base64()))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, BookmarkToken>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, text)| {
                BookmarkToken::from_base64(&text)
                    .map(|token| (name, token))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_new() {
        let req = CommandRequest::new("restic");
        assert_eq!(req.command, "restic");
        assert!(req.arguments.is_empty());
        assert!(req.environment.is_empty());
        assert!(req.bookmarks.is_empty());
        assert_eq!(req.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_request_builder_chain() {
        let req = CommandRequest::new("restic")
            .args(["backup", "--json"])
            .arg("/data")
            .working_dir("/srv")
            .env("RESTIC_REPOSITORY", "/backups/repo")
            .timeout(Duration::from_secs(60));

        assert_eq!(req.arguments, vec!["backup", "--json", "/data"]);
        assert_eq!(req.working_directory, PathBuf::from("/srv"));
        assert_eq!(
            req.environment.get("RESTIC_REPOSITORY"),
            Some(&"/backups/repo".to_string())
        );
        assert_eq!(req.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_request_envs() {
        let req = CommandRequest::new("env").envs([("KEY1", "val1"), ("KEY2", "val2")]);
        assert_eq!(req.environment.len(), 2);
        assert_eq!(req.environment.get("KEY2"), Some(&"val2".to_string()));
    }

    #[test]
    fn test_wire_format() {
        let req = CommandRequest::new("true")
            .bookmark("SOURCE", BookmarkToken::from_bytes(vec![1, 2, 3]))
            .timeout(Duration::from_millis(2500));
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();

        assert_eq!(json["timeout"], 2.5);
        assert_eq!(json["bookmarks"]["SOURCE"], "AQID");
        assert!(json["session_context"].is_string());

        let back: CommandRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let json = r#"{"command":"true","working_directory":"/","timeout":-1.0,
            "session_context":"67e55044-10b1-426f-9247-bb680e5fe0c8"}"#;
        assert!(serde_json::from_str::<CommandRequest>(json).is_err());
    }

    #[test]
    fn test_debug_hides_environment_values() {
        let req = CommandRequest::new("restic").env("RESTIC_PASSWORD", "hunter2");
        let debug = format!("{:?}", req);
        assert!(debug.contains("RESTIC_PASSWORD"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_session_context_display() {
        let ctx = SessionContext::new();
        assert!(ctx.to_string().starts_with("ctx-"));
        assert_ne!(ctx, SessionContext::new());
    }
}
