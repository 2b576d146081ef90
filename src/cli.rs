//! Command-line interface for scope-broker.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::HelperMode;
use crate::resource::PermissionMode;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Execution context override.
    pub helper: Option<HelperMode>,
    /// Permission mode override.
    pub permission_mode: Option<PermissionMode>,
    /// Bookmark store override.
    pub bookmark_store: Option<PathBuf>,
    /// Vault directory override.
    pub vault_dir: Option<PathBuf>,
    /// Sharing group configured at startup.
    pub sharing_group: Option<String>,
    /// What to do.
    pub command: Option<CliCommand>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Serve the helper protocol on stdio.
    Helper,
    /// Probe the configured execution context.
    Ping,
    /// Request permission for a path and print a bookmark for it.
    Bookmark { path: PathBuf },
    /// Resolve a bookmark back to its path.
    Resolve { token: String },
    /// Run a command through the command channel.
    Exec(ExecArgs),
    /// Manage vault credentials.
    Secret {
        action: SecretAction,
        key: String,
        group: Option<String>,
    },
}

/// Arguments of `exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecArgs {
    pub program: String,
    pub arguments: Vec<String>,
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
    /// `NAME=PATH` pairs passed to the command as bookmarks.
    pub bookmarks: Vec<(String, PathBuf)>,
    /// `VAR=KEY` pairs injected from the vault.
    pub secrets: Vec<(String, String)>,
    /// Sharing group the secrets are read from.
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretAction {
    Set,
    Get,
    Delete,
}

impl std::str::FromStr for SecretAction {
    type Err = ArgsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Self::Set),
            "get" => Ok(Self::Get),
            "delete" => Ok(Self::Delete),
            other => Err(ArgsError::InvalidValue("secret action", other.to_string())),
        }
    }
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Long("helper") => {
                let value: String = parser.value()?.parse()?;
                result.helper = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("helper", value))?,
                );
            }
            Long("permission-mode") => {
                let value: String = parser.value()?.parse()?;
                result.permission_mode = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("permission-mode", value))?,
                );
            }
            Long("store") => {
                result.bookmark_store = Some(parser.value()?.parse()?);
            }
            Long("vault-dir") => {
                result.vault_dir = Some(parser.value()?.parse()?);
            }
            Long("sharing-group") => {
                result.sharing_group = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                let name = val.string()?;
                let command = match name.as_str() {
                    "helper" => CliCommand::Helper,
                    "ping" => CliCommand::Ping,
                    "bookmark" => CliCommand::Bookmark {
                        path: required(&mut parser, "PATH")?.into(),
                    },
                    "resolve" => CliCommand::Resolve {
                        token: required(&mut parser, "TOKEN")?,
                    },
                    "exec" => CliCommand::Exec(parse_exec(&mut parser)?),
                    "secret" => parse_secret(&mut parser)?,
                    _ => return Err(ArgsError::UnexpectedArgument(name)),
                };
                if let Some(extra) = parser.next()? {
                    return Err(match extra {
                        Value(v) => ArgsError::UnexpectedArgument(v.to_string_lossy().into()),
                        other => other.unexpected().into(),
                    });
                }
                result.command = Some(command);
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

fn required(parser: &mut lexopt::Parser, name: &'static str) -> Result<String, ArgsError> {
    use lexopt::ValueExt;

    match parser.next()? {
        Some(lexopt::Arg::Value(value)) => Ok(value.string()?),
        Some(other) => Err(other.unexpected().into()),
        None => Err(ArgsError::MissingArgument(name)),
    }
}

fn parse_exec(parser: &mut lexopt::Parser) -> Result<ExecArgs, ArgsError> {
    use lexopt::prelude::*;

    let mut exec = ExecArgs::default();
    while let Some(arg) = parser.next()? {
        match arg {
            Short('t') | Long("timeout") => {
                let value: String = parser.value()?.parse()?;
                let secs: f64 = value
                    .parse()
                    .map_err(|_| ArgsError::InvalidValue("timeout", value.clone()))?;
                exec.timeout = Some(
                    Duration::try_from_secs_f64(secs)
                        .map_err(|_| ArgsError::InvalidValue("timeout", value))?,
                );
            }
            Short('w') | Long("working-dir") => {
                exec.working_dir = Some(parser.value()?.parse()?);
            }
            Short('b') | Long("bookmark") => {
                let (name, path) = split_pair("bookmark", parser.value()?.string()?)?;
                exec.bookmarks.push((name, PathBuf::from(path)));
            }
            Short('s') | Long("secret") => {
                exec.secrets.push(split_pair("secret", parser.value()?.string()?)?);
            }
            Short('g') | Long("group") => {
                exec.group = Some(parser.value()?.parse()?);
            }
            Value(program) => {
                exec.program = program.string()?;
                for raw in parser.raw_args()? {
                    exec.arguments.push(
                        raw.into_string()
                            .map_err(|v| ArgsError::UnexpectedArgument(v.to_string_lossy().into()))?,
                    );
                }
                return Ok(exec);
            }
            _ => return Err(arg.unexpected().into()),
        }
    }
    Err(ArgsError::MissingArgument("COMMAND"))
}

fn parse_secret(parser: &mut lexopt::Parser) -> Result<CliCommand, ArgsError> {
    use lexopt::prelude::*;

    let mut action: Option<SecretAction> = None;
    let mut key: Option<String> = None;
    let mut group: Option<String> = None;
    while let Some(arg) = parser.next()? {
        match arg {
            Short('g') | Long("group") => {
                group = Some(parser.value()?.parse()?);
            }
            Value(value) if action.is_none() => {
                action = Some(value.string()?.parse()?);
            }
            Value(value) if key.is_none() => {
                key = Some(value.string()?);
            }
            Value(value) => {
                return Err(ArgsError::UnexpectedArgument(value.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(CliCommand::Secret {
        action: action.ok_or(ArgsError::MissingArgument("set|get|delete"))?,
        key: key.ok_or(ArgsError::MissingArgument("KEY"))?,
        group,
    })
}

fn split_pair(option: &'static str, value: String) -> Result<(String, String), ArgsError> {
    match value.split_once('=') {
        Some((name, rest)) if !name.is_empty() && !rest.is_empty() => {
            Ok((name.to_string(), rest.to_string()))
        }
        _ => Err(ArgsError::InvalidValue(option, value)),
    }
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"scope-broker {version}
Scoped resource grants, access sessions and isolated command execution

USAGE:
    scope-broker [OPTIONS] <COMMAND>

COMMANDS:
    helper                  Serve the helper protocol on stdin/stdout
    ping                    Check that the execution context answers
    bookmark <PATH>         Request access to PATH and print its bookmark
    resolve <TOKEN>         Print the path a bookmark refers to
    exec [EXEC OPTIONS] [--] <CMD> [ARGS]...
                            Run a command in the execution context
    secret <set|get|delete> <KEY> [-g <GROUP>]
                            Manage vault credentials (set reads stdin)

EXEC OPTIONS:
    -t, --timeout <SECS>    Command timeout [default: from config]
    -w, --working-dir <DIR> Working directory [default: current]
    -b, --bookmark <N=PATH> Pass PATH to the command as bookmark N
    -s, --secret <VAR=KEY>  Set VAR from vault credential KEY
    -g, --group <GROUP>     Sharing group for --secret

OPTIONS:
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
        --helper <MODE>     Execution context: none, self or a helper path
        --permission-mode <MODE>
                            filesystem, grant_all or deny_all
        --store <FILE>      Bookmark store file
        --vault-dir <DIR>   Vault directory
        --sharing-group <G> Configure vault sharing group G at startup
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    SCOPE_BROKER_BOOKMARK_STORE   Bookmark store file (overrides config)
    SCOPE_BROKER_VAULT_DIR        Vault directory (overrides config)
    SCOPE_BROKER_MAX_DURATION     Access session limit in seconds
    SCOPE_BROKER_PERMISSION_MODE  Permission mode (overrides config)
    SCOPE_BROKER_HELPER           Execution context (overrides config)
    SCOPE_BROKER_SHARING_GROUP    Sharing group (overrides config)
    SCOPE_BROKER_LOG_LEVEL        Log level (overrides config)
    RUST_LOG                      Alternative log level setting

EXAMPLES:
    # Bookmark a backup source, then use it from a command
    scope-broker --store ~/.scope-broker/bookmarks.json bookmark "$HOME/Documents"
    scope-broker exec -b SOURCE="$HOME/Documents" -- restic backup "$HOME/Documents"

    # Store a repository password and inject it through a helper process
    printf %s "$PASSWORD" | scope-broker --vault-dir ~/.scope-broker/vault secret set repo1
    scope-broker --helper self exec -s RESTIC_PASSWORD=repo1 -- restic snapshots
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("scope-broker {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
    /// A required positional argument is missing.
    MissingArgument(&'static str),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
            Self::MissingArgument(name) => {
                write!(f, "missing argument: <{}>", name)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
