//! nixfleetd — the nixfleet daemon.
//!
//! One binary, four modes:
//!
//! - `serve` runs the fleet binary cache over the shared state store
//! - `agent` keeps the local node on its published closure
//! - `deploy` publishes a closure for a node
//! - `status` prints a node's last reported outcome

pub mod agent_mode;
pub mod cli;
pub mod dispatcher;
pub mod logging;
pub mod operator;
pub mod settings;
