//! Command line and bootstrap shared by the three daemon binaries.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, FromArgMatches, Parser};
use pony_core::config::{Config, Directories};
use pony_core::logging::setup_logging;
use pony_core::{Daemon, ProcessContext};
use pony_rpc::{ConnectOptions, Router};
use pony_types::{AgentKind, Role};
use tracing::{debug, error, info};

use crate::agent::AgentManager;
use crate::error::{DaemonError, Result};
use crate::hub::HubManager;

/// The daemon a binary runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Sparkle,
    Twilight,
    Luna,
}

impl Program {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Program::Sparkle => "sparkle",
            Program::Twilight => AgentKind::Twilight.name(),
            Program::Luna => AgentKind::Luna.name(),
        }
    }

    #[must_use]
    pub fn role(self) -> Role {
        match self {
            Program::Sparkle => Role::Hub,
            Program::Twilight | Program::Luna => Role::Agent,
        }
    }

    #[must_use]
    pub fn agent_kind(self) -> Option<AgentKind> {
        match self {
            Program::Sparkle => None,
            Program::Twilight => Some(AgentKind::Twilight),
            Program::Luna => Some(AgentKind::Luna),
        }
    }

    fn about(self) -> &'static str {
        match self {
            Program::Sparkle => "ponycloud hub daemon",
            Program::Twilight => "ponycloud host agent",
            Program::Luna => "ponycloud storage agent",
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, long_about = None)]
pub struct Args {
    /// Config file (defaults to `<daemon>.json` in `$PONYCLOUD_CONFIG_DIR` or `~/.config/ponycloud`)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl Args {
    #[must_use]
    pub fn command_for(program: Program) -> clap::Command {
        Self::command()
            .name(program.name())
            .bin_name(program.name())
            .about(program.about())
    }

    /// Parse `args` (including the binary name) for `program`.
    ///
    /// # Errors
    ///
    /// Returns the clap error for bad arguments and for `--help` and
    /// `--version`, which clap reports as errors with exit code 0.
    pub fn try_parse_for<I, T>(program: Program, args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command_for(program).try_get_matches_from(args)?;
        Self::from_arg_matches(&matches)
    }

    /// Parse the process arguments, exiting on `--help`, `--version` or
    /// usage errors.
    #[must_use]
    pub fn parse_for(program: Program) -> Self {
        match Self::try_parse_for(program, std::env::args_os()) {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// The config file to load: `--config` or the daemon's default.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::NoConfigDir` if there is no default location.
    pub fn config_path(&self, program: Program) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Directories::new()
                .map(|dirs| dirs.config_file(program.name()))
                .ok_or(DaemonError::NoConfigDir),
        }
    }
}

/// Entry point of every daemon binary.
pub async fn run(program: Program) -> ExitCode {
    let args = Args::parse_for(program);

    let mut ctx = ProcessContext::new();
    if let Some(guard) = setup_logging(program.name()) {
        ctx.on_shutdown("flush log file", move || {
            drop(guard);
            Ok(())
        });
    }

    info!("Starting {} {}", program.name(), env!("CARGO_PKG_VERSION"));

    let code = match serve(program, &args, &ctx).await {
        Ok(()) => {
            info!("{} stopped", program.name());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}: {}", program.name(), e);
            ExitCode::from(e.exit_code())
        }
    };

    ctx.shutdown();
    code
}

/// Load configuration and run `program` until shutdown.
///
/// # Errors
///
/// Returns configuration, bind and fatal connect failures.
pub async fn serve(program: Program, args: &Args, ctx: &ProcessContext) -> Result<()> {
    let path = args.config_path(program)?;
    let config = Config::load(&path)?;
    config.validate(program.role())?;
    info!("Loaded config from {}", path.display());

    let _signals = ctx.watch_signals();
    run_with_config(program, &config, ctx).await
}

/// Run `program` with an already validated configuration.
///
/// # Errors
///
/// Returns bind and fatal connect failures.
pub async fn run_with_config(program: Program, config: &Config, ctx: &ProcessContext) -> Result<()> {
    match program.agent_kind() {
        None => run_hub(config, ctx).await,
        Some(kind) => run_agent(kind, config, ctx).await,
    }
}

async fn run_hub(config: &Config, ctx: &ProcessContext) -> Result<()> {
    let Some(identity) = config.identity(Role::Hub)? else {
        return Err(pony_core::Error::Config("hub identity is missing".to_string()).into());
    };

    let router = Router::bind(&config.messaging.address, identity).await?;

    if let Some(management) = &config.management {
        info!(
            "Management interface configured at {}:{}",
            management.host, management.port
        );
    }
    if config.database.is_some() {
        debug!("Data store configured");
    }

    let manager = HubManager::new(router.handle(), config.hub.stale_after())?;
    Daemon::new(Program::Sparkle.name(), router, manager)
        .run(ctx.token())
        .await?;
    Ok(())
}

async fn run_agent(kind: AgentKind, config: &Config, ctx: &ProcessContext) -> Result<()> {
    let router = Router::connect(ConnectOptions {
        address: config.messaging.address.clone(),
        identity: config.identity(Role::Agent)?,
        default_recipient: config.messaging.hub_identity()?,
        backoff: config.reconnect.backoff(),
    })?;

    let manager = AgentManager::new(
        kind,
        router.handle(),
        config.agent.workers,
        config.agent.status_interval(),
    );
    Daemon::new(kind.name(), router, manager)
        .run(ctx.token())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_program_roles() {
        assert_eq!(Program::Sparkle.role(), Role::Hub);
        assert_eq!(Program::Twilight.role(), Role::Agent);
        assert_eq!(Program::Luna.agent_kind(), Some(AgentKind::Luna));
        assert_eq!(Program::Sparkle.agent_kind(), None);
        assert_eq!(Program::Twilight.name(), "twilight");
    }

    #[test]
    fn test_short_config_flag() {
        let args = Args::try_parse_for(Program::Sparkle, ["sparkle", "-c", "/etc/ponycloud/s.json"])
            .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/ponycloud/s.json")));
    }

    #[test]
    fn test_long_config_flag() {
        let args =
            Args::try_parse_for(Program::Luna, ["luna", "--config", "luna.json"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("luna.json")));
    }

    #[test]
    fn test_no_arguments() {
        let args = Args::try_parse_for(Program::Twilight, ["twilight"]).unwrap();
        assert!(args.config.is_none());
    }

    #[test]
    fn test_help_and_version_exit_zero() {
        for flag in ["-h", "--help"] {
            let err = Args::try_parse_for(Program::Sparkle, ["sparkle", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
            assert_eq!(err.exit_code(), 0);
        }
        for flag in ["-V", "--version"] {
            let err = Args::try_parse_for(Program::Luna, ["luna", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayVersion);
            assert_eq!(err.exit_code(), 0);
        }
    }

    #[test]
    fn test_help_names_the_daemon() {
        let help = Args::command_for(Program::Twilight).render_help().to_string();
        assert!(help.contains("twilight"));
        assert!(help.contains("--config"));
    }

    #[test]
    fn test_unknown_flag_is_usage_error() {
        let err = Args::try_parse_for(Program::Sparkle, ["sparkle", "--daemonize"]).unwrap_err();
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let args = Args {
            config: Some(PathBuf::from("/tmp/custom.json")),
        };
        assert_eq!(
            args.config_path(Program::Sparkle).unwrap(),
            PathBuf::from("/tmp/custom.json")
        );
    }

    #[tokio::test]
    async fn test_serve_fails_on_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            config: Some(dir.path().join("sparkle.json")),
        };
        let ctx = ProcessContext::new();

        let err = serve(Program::Sparkle, &args, &ctx).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_serve_fails_on_invalid_hub_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkle.json");
        std::fs::write(&path, r#"{"messaging": {"address": "tcp://127.0.0.1:0"}}"#).unwrap();
        let args = Args { config: Some(path) };
        let ctx = ProcessContext::new();

        let err = serve(Program::Sparkle, &args, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("management"));
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_hub_bind_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("sparkle.sock");
        let address = format!("ipc://{}", socket.display());
        let _live = Router::bind(&address, pony_types::Identity::new("sparkle").unwrap())
            .await
            .unwrap();

        let config: Config = serde_json::from_value(serde_json::json!({
            "messaging": {"address": address},
            "management": {"port": 9860},
            "database": {"url": "postgresql://localhost/ponycloud"}
        }))
        .unwrap();
        let ctx = ProcessContext::new();

        let err = run_with_config(Program::Sparkle, &config, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Router(pony_rpc::RouterError::Bind(_))
        ));
        assert_eq!(err.exit_code(), crate::error::EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_agent_rejects_unusable_address() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "messaging": {"address": "carrier-pigeon://hub"}
        }))
        .unwrap();
        let ctx = ProcessContext::new();

        let err = run_with_config(Program::Twilight, &config, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Router(pony_rpc::RouterError::Connect(_))
        ));
    }
}
