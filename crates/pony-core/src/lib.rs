//! Daemon runtime shared by the ponycloud hub and agents.
//!
//! A daemon is a [`Manager`] plugged into a [`Daemon`] loop: the loop pulls
//! events from a [`pony_rpc::Router`], hands messages to the manager through
//! an [`EventDispatcher`] and drives the manager's [`Lifecycle`]. A
//! [`ProcessContext`] coordinates shutdown for the whole process. The
//! [`Model`] holds desired and current state in indexed tables.

pub mod config;
pub mod logging;
pub mod model;

mod context;
mod daemon;
mod dispatch;
mod error;
mod lifecycle;
mod manager;
mod worker;

#[cfg(test)]
mod tests;

pub use context::{ProcessContext, shutdown_signal};
pub use daemon::Daemon;
pub use dispatch::{Dispatch, EventDispatcher};
pub use error::{DecodeError, Error, LifecycleError, ModelError, Result};
pub use lifecycle::{Lifecycle, State};
pub use manager::Manager;
pub use model::{Model, Row, Table, TableSchema};
pub use worker::WorkerPool;

pub use pony_types::*;
