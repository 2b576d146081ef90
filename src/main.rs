//! scope-broker binary entry point.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use scope_broker::channel::serve_stdio;
use scope_broker::cli::{self, CliCommand, ExecArgs, SecretAction};
use scope_broker::{
    logging, AccessBroker, Accessibility, BookmarkToken, BrokerError, BrokerRuntime,
    CancelHandle, CommandChannel, CommandRequest, CommandResult, Config, CredentialVault, Result,
    Secret,
};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run 'scope-broker --help' for usage.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }
    let Some(command) = args.command.clone() else {
        cli::print_help();
        return ExitCode::from(2);
    };

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    // Logs go to stderr; stdout carries command output or helper frames.
    let _ = logging::try_init_with_level(config.log_filter());
    info!("scope-broker v{}", env!("CARGO_PKG_VERSION"));

    match run(command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: CliCommand, config: Config) -> Result<ExitCode> {
    match command {
        CliCommand::Helper => helper(config).await,
        CliCommand::Ping => {
            let runtime = BrokerRuntime::builder(config).build()?;
            let alive = runtime.channel().ping().await;
            println!("{}", if alive { "pong" } else { "unreachable" });
            Ok(if alive {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        CliCommand::Bookmark { path } => {
            let runtime = BrokerRuntime::builder(config).build()?;
            runtime
                .broker()
                .request_permission(&path, Accessibility::ReadOnly)?;
            let token = runtime.broker().create_bookmark(&path)?;
            println!("{}", token.to_base64());
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Resolve { token } => {
            let runtime = BrokerRuntime::builder(config).build()?;
            let token = BookmarkToken::from_base64(&token)?;
            let resolved = runtime.broker().resolve_bookmark(&token)?;
            println!("{}", resolved.path.display());
            if resolved.is_stale {
                eprintln!("warning: bookmark is stale; create it again");
            }
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Exec(exec) => execute(config, exec).await,
        CliCommand::Secret { action, key, group } => {
            secret(config, action, &key, group.as_deref()).await
        }
    }
}

/// Serve the helper protocol until stdin closes or Ctrl-C.
async fn helper(config: Config) -> Result<ExitCode> {
    let runtime = BrokerRuntime::builder(config).local_channel().build()?;
    let channel = Arc::clone(runtime.channel());

    tokio::select! {
        served = serve_stdio(channel) => served?,
        _ = tokio::signal::ctrl_c() => warn!("helper interrupted"),
    }

    runtime.shutdown();
    Ok(ExitCode::SUCCESS)
}

async fn execute(config: Config, exec: ExecArgs) -> Result<ExitCode> {
    let runtime = BrokerRuntime::builder(config).build()?;

    let working_dir = match exec.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let timeout = exec
        .timeout
        .unwrap_or_else(|| runtime.config().default_timeout());
    let request = CommandRequest::new(exec.program)
        .args(exec.arguments)
        .working_dir(working_dir)
        .timeout(timeout);

    let cancel = CancelHandle::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; cancelling command");
                cancel.cancel();
            }
        })
    };
    let outcome = runtime
        .execute_with_access(
            request,
            &exec.bookmarks,
            &exec.secrets,
            exec.group.as_deref(),
            &cancel,
        )
        .await;
    watcher.abort();
    runtime.shutdown();

    let result = outcome?;
    report(&result)?;
    Ok(exit_code(&result))
}

fn report(result: &CommandResult) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if let Some(ref output) = result.output {
        stdout.write_all(output.as_bytes())?;
        if !output.is_empty() && !output.ends_with('\n') {
            stdout.write_all(b"\n")?;
        }
    }
    stdout.flush()?;
    if let Some(ref detail) = result.error_detail {
        eprintln!("{detail}");
    }
    Ok(())
}

fn exit_code(result: &CommandResult) -> ExitCode {
    match u8::try_from(result.exit_code) {
        Ok(0) if !result.success => ExitCode::FAILURE,
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

async fn secret(
    config: Config,
    action: SecretAction,
    key: &str,
    group: Option<&str>,
) -> Result<ExitCode> {
    let runtime = BrokerRuntime::builder(config).build()?;
    let vault = runtime.vault();
    if let Some(group) = group {
        vault.configure_sharing(group)?;
    }

    match action {
        SecretAction::Set => {
            let mut value = Vec::new();
            tokio::io::stdin().read_to_end(&mut value).await?;
            while matches!(value.last(), Some(b'\n' | b'\r')) {
                value.pop();
            }
            if value.is_empty() {
                return Err(BrokerError::InvalidRequest(
                    "no secret on standard input".into(),
                ));
            }
            vault.save(&Secret::new(value), key, group)?;
            eprintln!("saved {key}");
        }
        SecretAction::Get => match vault.retrieve(key, group)? {
            Some(secret) => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(secret.expose())?;
                stdout.write_all(b"\n")?;
                stdout.flush()?;
            }
            None => {
                eprintln!("no credential named {key}");
                return Ok(ExitCode::FAILURE);
            }
        },
        SecretAction::Delete => {
            vault.delete(key, group)?;
            eprintln!("deleted {key}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
