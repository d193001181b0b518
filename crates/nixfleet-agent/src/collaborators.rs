//! The system operations a deployment needs.
//!
//! The reconciler never touches the host directly. It asks a
//! [`SystemInspector`] what is running, a [`ClosureFetcher`] to copy the new
//! closure in, and a [`ConfigurationApplier`] to activate it. Every step
//! hands back the command output, including on failure, so the outcome
//! can show what happened.

use std::sync::Arc;

use async_trait::async_trait;
use nixfleet_state::DeploymentDescriptor;

/// Captured output of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: text.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    pub message: String,
    pub output: CommandOutput,
}

impl CommandFailure {
    pub fn new(message: impl Into<String>, output: CommandOutput) -> Self {
        Self {
            message: message.into(),
            output,
        }
    }
}

pub type CommandResult = Result<CommandOutput, CommandFailure>;

#[async_trait]
pub trait SystemInspector: Send + Sync {
    /// Store path of the running system closure.
    async fn current_closure(&self) -> Result<String, CommandFailure>;
}

#[async_trait]
pub trait ClosureFetcher: Send + Sync {
    /// Copy `closure` and its dependencies from the binary cache at `endpoint`.
    async fn fetch(&self, endpoint: &str, closure: &str) -> CommandResult;
}

#[async_trait]
pub trait ConfigurationApplier: Send + Sync {
    /// Activate `descriptor.closure` with `descriptor.action`, or only
    /// report what would change when `dry_run` is set.
    async fn apply(&self, descriptor: &DeploymentDescriptor, dry_run: bool) -> CommandResult;
}

#[derive(Clone)]
pub struct Collaborators {
    pub inspector: Arc<dyn SystemInspector>,
    pub fetcher: Arc<dyn ClosureFetcher>,
    pub applier: Arc<dyn ConfigurationApplier>,
}

impl Collaborators {
    /// All three roles played by one implementation.
    pub fn from_system<S>(system: Arc<S>) -> Self
    where
        S: SystemInspector + ClosureFetcher + ConfigurationApplier + 'static,
    {
        Self {
            inspector: system.clone(),
            fetcher: system.clone(),
            applier: system,
        }
    }
}
