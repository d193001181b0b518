//! nixfleetd entry point.
//!
//! # Usage
//!
//! ```text
//! nixfleetd serve --secret-key-file /etc/nixfleet/cache.key
//! nixfleetd agent --node-key-file /etc/nixfleet/node.key --dispatcher http://dispatcher:5000
//! nixfleetd deploy --node N... --closure /nix/store/...-system --action boot
//! nixfleetd status --node N...
//! ```

use anyhow::Context;
use clap::Parser;
use nixfleet_core::NodeIdentity;
use nixfleet_state::DeploymentDescriptor;
use tokio::sync::watch;
use tracing::{error, info};

use nixfleetd::cli::{Cli, Command};
use nixfleetd::dispatcher::Dispatcher;
use nixfleetd::settings::Settings;
use nixfleetd::{agent_mode, logging, operator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli)?;
    logging::init(settings.log_format, &settings.log_filter);

    match cli.command {
        Command::Serve(args) => {
            let options = settings.cache_options(&args)?;
            info!(bind = %options.bind, "nixfleet dispatcher starting");
            let mut dispatcher =
                Dispatcher::new(settings.state_path.clone(), settings.layout.clone(), options);
            dispatcher.init().await?;
            dispatcher.run(shutdown_on_ctrl_c()).await
        }
        Command::Agent(args) => {
            let options = settings.reconciler_options(&args)?;
            agent_mode::run_agent(
                &settings.dispatcher_url,
                &settings.agent_cache_path(&args),
                &settings.layout,
                options,
                shutdown_on_ctrl_c(),
            )
            .await
        }
        Command::Deploy(args) => {
            let node = NodeIdentity::parse(&args.node)
                .with_context(|| format!("invalid node identity '{}'", args.node))?;
            let descriptor = DeploymentDescriptor {
                closure: args.closure,
                action: args.action,
                dry_run: args.dry_run,
            };
            let revision =
                operator::publish_deployment(&settings.dispatcher_url, &node, &descriptor).await?;
            println!("{revision}");
            Ok(())
        }
        Command::Status(args) => {
            let node = NodeIdentity::parse(&args.node)
                .with_context(|| format!("invalid node identity '{}'", args.node))?;
            match operator::read_status(&settings.dispatcher_url, &node).await? {
                Some(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(())
                }
                None => anyhow::bail!("node {node} has not reported a deployment"),
            }
        }
    }
}

/// Shutdown channel that flips to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "failed to listen for Ctrl-C");
                // Keep the sender alive so receivers do not see a closed channel.
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}
