//! The ponycloud control-plane daemons.
//!
//! `sparkle` is the hub: it binds the messaging endpoint, tracks the agents
//! that connect to it and hands them actions. `twilight` and `luna` are
//! agents: they connect to the hub, report their status and run the actions
//! they are sent. All three share the runtime in `pony_core` and differ only
//! in the [`pony_core::Manager`] they plug into it.

pub mod actions;
pub mod agent;
pub mod cli;
pub mod error;
pub mod hub;

pub use actions::{ActionId, AgentInfo};
pub use agent::AgentManager;
pub use cli::{Args, Program};
pub use error::{DaemonError, Result};
pub use hub::{AgentRecord, HubManager};
