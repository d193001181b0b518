//! Host collaborators backed by the Nix command line.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nixfleet_state::{Action, DeploymentDescriptor};
use tokio::process::Command;
use tracing::debug;

use crate::collaborators::{
    ClosureFetcher, CommandFailure, CommandOutput, CommandResult, ConfigurationApplier,
    SystemInspector,
};

pub const CURRENT_SYSTEM: &str = "/run/current-system";
pub const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

#[derive(Debug, Clone)]
pub struct NixSystem {
    current_system: PathBuf,
    system_profile: PathBuf,
}

impl Default for NixSystem {
    fn default() -> Self {
        Self {
            current_system: PathBuf::from(CURRENT_SYSTEM),
            system_profile: PathBuf::from(SYSTEM_PROFILE),
        }
    }
}

impl NixSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Run `command` to completion, capturing both streams. A non-zero exit
/// is a failure carrying whatever the command printed.
async fn run(mut command: Command) -> CommandResult {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?command.as_std(), "running");
    let output = command
        .output()
        .await
        .map_err(|e| CommandFailure::new(format!("failed to spawn: {e}"), CommandOutput::default()))?;

    let captured = CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    };
    if output.status.success() {
        Ok(captured)
    } else {
        Err(CommandFailure::new(
            format!("exited with {}", output.status),
            captured,
        ))
    }
}

#[async_trait]
impl SystemInspector for NixSystem {
    async fn current_closure(&self) -> Result<String, CommandFailure> {
        let mut command = Command::new("readlink");
        command.arg("-f").arg(&self.current_system);
        let output = run(command).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ClosureFetcher for NixSystem {
    async fn fetch(&self, endpoint: &str, closure: &str) -> CommandResult {
        let mut command = Command::new("nix");
        command
            .args(["--extra-experimental-features", "nix-command"])
            .args(["copy", "--from", endpoint, closure]);
        run(command).await
    }
}

#[async_trait]
impl ConfigurationApplier for NixSystem {
    async fn apply(&self, descriptor: &DeploymentDescriptor, dry_run: bool) -> CommandResult {
        let action = if dry_run {
            Action::DryActivate
        } else {
            descriptor.action
        };

        let mut captured = CommandOutput::default();

        // Switch and boot make the closure the default boot entry.
        if matches!(action, Action::Switch | Action::Boot) {
            let mut command = Command::new("nix-env");
            command
                .arg("--profile")
                .arg(&self.system_profile)
                .arg("--set")
                .arg(&descriptor.closure);
            let output = run(command).await?;
            captured.stdout.extend(output.stdout);
            captured.stderr.extend(output.stderr);
        }

        let switch = PathBuf::from(&descriptor.closure).join("bin/switch-to-configuration");
        let mut command = Command::new(switch);
        command.arg(action.as_str());
        match run(command).await {
            Ok(output) => {
                captured.stdout.extend(output.stdout);
                captured.stderr.extend(output.stderr);
                Ok(captured)
            }
            Err(mut failure) => {
                captured.stdout.extend(failure.output.stdout);
                captured.stderr.extend(failure.output.stderr);
                failure.output = captured;
                Err(failure)
            }
        }
    }
}
