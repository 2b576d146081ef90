//! Wiring of broker, monitor, channel and vault.
//!
//! The command channel needs the broker to resolve bookmarks, and the broker
//! is built from parts the channel does not need. Construction therefore runs
//! in two phases: phase one builds everything that does not depend on the
//! broker and hands the channel an unbound [`Deferred`] slot; phase two
//! builds the broker and binds it. Until the slot is bound the channel falls
//! back to a [`Placeholder`].

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapPhase, Deferred, Placeholder};
use crate::channel::{
    BookmarkEnvironment, CancelHandle, CommandChannel, CommandRequest, CommandResult,
    CommandValidator, HelperChannel, HelperOptions, LocalChannel,
};
use crate::config::{Config, HelperMode};
use crate::monitor::ResourceAccessMonitor;
use crate::error::CredentialError;
use crate::resource::{
    AccessBroker, AccessScope, AccessTicket, BookmarkStore, DescriptorScope, PermissionPrompt,
    ResourceAccessBroker,
};
use crate::vault::{CredentialVault, FileVault, MemoryVault};
use crate::Result;

/// Builder for [`BrokerRuntime`].
pub struct RuntimeBuilder {
    config: Config,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    scope: Option<Arc<dyn AccessScope>>,
    vault: Option<Arc<dyn CredentialVault>>,
    force_local: bool,
}

impl RuntimeBuilder {
    /// Decide permissions with `prompt` instead of the configured mode.
    pub fn prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Bracket access sessions with `scope` instead of open descriptors.
    pub fn scope(mut self, scope: Arc<dyn AccessScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Use `vault` instead of the configured one.
    pub fn vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Run commands in this process whatever the configuration says.
    ///
    /// A helper process uses this so it does not start helpers of its own.
    pub fn local_channel(mut self) -> Self {
        self.force_local = true;
        self
    }

    pub fn build(self) -> Result<BrokerRuntime> {
        let config = self.config;
        let phase = Arc::new(BootstrapPhase::new());
        let placeholder = Placeholder::new(Arc::clone(&phase));

        // Phase one: nothing here may call into the broker.
        let vault = match self.vault {
            Some(vault) => vault,
            None => open_vault(&config)?,
        };
        if let Some(ref group) = config.vault.sharing_group {
            vault.configure_sharing(group)?;
        }

        let scope = self
            .scope
            .unwrap_or_else(|| Arc::new(DescriptorScope::new()) as Arc<dyn AccessScope>);
        let monitor = Arc::new(ResourceAccessMonitor::new(scope));

        let slot: Deferred<dyn AccessBroker> = Deferred::new("access broker");
        let channel = build_channel(&config, self.force_local, slot.clone(), placeholder)?;
        debug!(ready = slot.is_ready(), "bootstrap phase one complete");

        // Phase two.
        let store = match config.storage.bookmark_store {
            Some(ref path) => BookmarkStore::open(path)?,
            None => BookmarkStore::in_memory(),
        };
        let prompt = self
            .prompt
            .unwrap_or_else(|| config.access.permission_mode.into_prompt());
        let broker = Arc::new(
            ResourceAccessBroker::new(prompt, store, Arc::clone(&monitor))
                .with_max_duration(config.max_duration()),
        );
        slot.bind(Arc::clone(&broker) as Arc<dyn AccessBroker>)?;
        phase.mark_complete();

        info!(
            helper = ?config.channel.helper,
            local = self.force_local,
            permission_mode = ?config.access.permission_mode,
            "broker runtime ready"
        );
        Ok(BrokerRuntime {
            config,
            phase,
            broker,
            monitor,
            channel,
            vault,
        })
    }
}

fn open_vault(config: &Config) -> Result<Arc<dyn CredentialVault>> {
    Ok(match config.storage.vault_dir {
        Some(ref dir) => Arc::new(FileVault::open(dir)?),
        None => Arc::new(MemoryVault::new()),
    })
}

fn build_channel(
    config: &Config,
    force_local: bool,
    broker: Deferred<dyn AccessBroker>,
    fallback: Placeholder,
) -> Result<Arc<dyn CommandChannel>> {
    let validator = CommandValidator::new(config.validation());

    let helper = match (&config.channel.helper, force_local) {
        (_, true) | (HelperMode::None, false) => None,
        (HelperMode::CurrentExe, false) => {
            let mut options = HelperOptions::current_exe()?;
            // The helper reads the same configuration file as its parent.
            if let Some(ref source) = config.source {
                options = options.args([
                    "-c".to_string(),
                    source.display().to_string(),
                    "helper".to_string(),
                ]);
            }
            Some(options)
        }
        (HelperMode::Path(path), false) => Some(HelperOptions::new(path)),
    };

    Ok(match helper {
        Some(options) => Arc::new(
            HelperChannel::new(
                options
                    .ping_timeout(config.ping_timeout())
                    .kill_grace(config.kill_grace()),
            )
            .with_validator(validator),
        ),
        None => {
            let environment =
                BookmarkEnvironment::new(&config.channel.bookmark_env_prefix, broker, fallback);
            Arc::new(
                LocalChannel::new(environment)
                    .with_validator(validator)
                    .with_limits(config.channel.max_output_bytes, config.kill_grace()),
            )
        }
    })
}

/// The assembled components.
pub struct BrokerRuntime {
    config: Config,
    phase: Arc<BootstrapPhase>,
    broker: Arc<ResourceAccessBroker>,
    monitor: Arc<ResourceAccessMonitor>,
    channel: Arc<dyn CommandChannel>,
    vault: Arc<dyn CredentialVault>,
}

impl BrokerRuntime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            prompt: None,
            scope: None,
            vault: None,
            force_local: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &Arc<ResourceAccessBroker> {
        &self.broker
    }

    pub fn monitor(&self) -> &Arc<ResourceAccessMonitor> {
        &self.monitor
    }

    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    pub fn vault(&self) -> &Arc<dyn CredentialVault> {
        &self.vault
    }

    pub fn phase(&self) -> &Arc<BootstrapPhase> {
        &self.phase
    }

    /// Run `request` with access to `bookmarks` and credentials injected.
    ///
    /// Each `(NAME, PATH)` bookmark gets an access scope for the duration of
    /// the command and is attached to the request under `NAME`. Each
    /// `(VAR, KEY)` secret is read from the vault (in `group`, when given) and
    /// set as `VAR`. Every scope opened here is released before returning,
    /// whether the command ran or preparation failed.
    pub async fn execute_with_access(
        &self,
        request: CommandRequest,
        bookmarks: &[(String, PathBuf)],
        secrets: &[(String, String)],
        group: Option<&str>,
        cancel: &CancelHandle,
    ) -> Result<CommandResult> {
        let mut tickets = Vec::new();
        let outcome = self
            .prepare_and_execute(request, bookmarks, secrets, group, cancel, &mut tickets)
            .await;

        for ticket in tickets {
            let path = ticket.path().to_path_buf();
            if let Err(e) = self.broker.end_access(ticket) {
                warn!(path = %path.display(), error = %e, "could not end access");
            }
        }
        outcome
    }

    async fn prepare_and_execute(
        &self,
        mut request: CommandRequest,
        bookmarks: &[(String, PathBuf)],
        secrets: &[(String, String)],
        group: Option<&str>,
        cancel: &CancelHandle,
        tickets: &mut Vec<AccessTicket>,
    ) -> Result<CommandResult> {
        for (name, path) in bookmarks {
            match self.broker.begin_access(path)? {
                Some(ticket) => tickets.push(ticket),
                None => warn!(path = %path.display(), "could not open access scope"),
            }
            let token = self.broker.create_bookmark(path)?;
            request = request.bookmark(name.clone(), token);
        }

        if let Some(group) = group.filter(|_| !secrets.is_empty()) {
            self.vault.configure_sharing(group)?;
        }
        for (var, key) in secrets {
            let secret = self
                .vault
                .retrieve(key, group)?
                .ok_or_else(|| CredentialError::RetrievalFailed {
                    key: key.clone(),
                    reason: "no such credential".into(),
                })?;
            let value = secret
                .expose_str()
                .ok_or_else(|| CredentialError::RetrievalFailed {
                    key: key.clone(),
                    reason: "credential is not valid UTF-8".into(),
                })?;
            request = request.env(var.clone(), value);
        }

        self.channel.execute_cancellable(request, cancel).await
    }

    /// Force-close every open access session.
    pub fn shutdown(&self) -> usize {
        let closed = self.monitor.shutdown();
        info!(closed, "broker runtime shut down");
        closed
    }
}

impl std::fmt::Debug for BrokerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRuntime")
            .field("phase", &self.phase)
            .field("broker", &self.broker)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}
