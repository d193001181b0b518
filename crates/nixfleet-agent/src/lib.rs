//! nixfleet-agent — keeps one node on its desired system closure.
//!
//! Each node follows its own key in the dispatcher's desired-state bucket
//! through the control API. When a new closure is published the agent
//! starts a private binary cache proxy on a loopback port, copies the
//! closure through it, switches to it, and reports the outcome back. The
//! proxy keeps a node-local store and pulls what it lacks from the
//! dispatcher's cache.
//!
//! # Components
//!
//! - **`reconciler`**: the watch/evaluate/deploy/report state machine
//! - **`bus`**: where desired state is read and outcomes are written
//! - **`collaborators`**: traits for the host operations a deployment needs
//! - **`nix`**: `NixSystem`, the collaborators backed by the Nix CLI
//! - **`output`**: command output capture and truncation

pub mod bus;
pub mod collaborators;
pub mod error;
pub mod nix;
pub mod output;
pub mod reconciler;

pub use bus::{DeploymentBus, LocalBus, RemoteBus};
pub use collaborators::{
    ClosureFetcher, Collaborators, CommandFailure, CommandOutput, CommandResult,
    ConfigurationApplier, SystemInspector,
};
pub use error::{AgentError, AgentResult};
pub use nix::NixSystem;
pub use output::{CapturedOutput, DEFAULT_MAX_OUTPUT_BYTES, fit_outcome};
pub use reconciler::{
    DEFAULT_POLL_INTERVAL, Disposition, Event, Phase, Reconciler, ReconcilerOptions,
};
