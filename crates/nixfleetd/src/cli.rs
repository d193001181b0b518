//! Command-line interface.
//!
//! Every flag can also come from a `NIXFLEET_*` environment variable, and
//! most have a counterpart in the TOML config file. Flags win over the file.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nixfleet_state::Action;

use crate::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "nixfleetd", about = "nixfleet daemon", version)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "NIXFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path of the redb state file.
    #[arg(long, global = true, env = "NIXFLEET_STATE_PATH")]
    pub state_path: Option<PathBuf>,

    /// Dispatcher URL used by `agent`, `deploy` and `status`.
    #[arg(long, global = true, env = "NIXFLEET_DISPATCHER")]
    pub dispatcher: Option<String>,

    #[arg(long, global = true, value_enum, env = "NIXFLEET_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the fleet binary cache.
    Serve(ServeArgs),
    /// Keep this node on its published closure.
    Agent(AgentArgs),
    /// Publish a closure for a node.
    Deploy(DeployArgs),
    /// Print a node's last deployment outcome as JSON.
    Status(StatusArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "NIXFLEET_BIND")]
    pub bind: Option<SocketAddr>,

    /// Nix secret key that signs narinfos (`name:base64`).
    #[arg(long, env = "NIXFLEET_CACHE_KEY_FILE")]
    pub secret_key_file: Option<PathBuf>,

    /// Priority advertised in `/nix-cache-info`.
    #[arg(long)]
    pub priority: Option<u32>,

    /// Largest accepted upload in bytes.
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    /// ed25519 key this node is identified by.
    #[arg(long, env = "NIXFLEET_NODE_KEY_FILE")]
    pub node_key_file: Option<PathBuf>,

    /// Key the deployment cache proxy signs with. Defaults to the cache key.
    #[arg(long, env = "NIXFLEET_CACHE_KEY_FILE")]
    pub cache_key_file: Option<PathBuf>,

    /// Node-local redb file backing the deployment cache proxy.
    #[arg(long, env = "NIXFLEET_AGENT_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Dry-activate every deployment.
    #[arg(long)]
    pub dry_run: bool,

    /// Longest wait for a desired-state change, in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Node identity (`N...`).
    #[arg(long)]
    pub node: String,

    /// System closure store path.
    #[arg(long)]
    pub closure: String,

    #[arg(long, default_value = "switch")]
    pub action: Action,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Node identity (`N...`).
    #[arg(long)]
    pub node: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn deploy_parses_action() {
        let cli = Cli::try_parse_from([
            "nixfleetd",
            "deploy",
            "--node",
            "NABC",
            "--closure",
            "/nix/store/xyz-system",
            "--action",
            "boot",
        ])
        .unwrap();
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.action, Action::Boot);
        assert!(!args.dry_run);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "nixfleetd",
            "status",
            "--node",
            "NABC",
            "--state-path",
            "/tmp/state.redb",
            "--dispatcher",
            "http://10.0.0.1:5000",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.state_path, Some(PathBuf::from("/tmp/state.redb")));
        assert_eq!(cli.dispatcher.as_deref(), Some("http://10.0.0.1:5000"));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let result = Cli::try_parse_from([
            "nixfleetd",
            "deploy",
            "--node",
            "NABC",
            "--closure",
            "/nix/store/x",
            "--action",
            "reboot",
        ]);
        assert!(result.is_err());
    }
}
