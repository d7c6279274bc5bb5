//! The interface every daemon's business logic implements.

use std::time::Duration;

use pony_types::Identity;

use crate::dispatch::EventDispatcher;

/// Business logic fed by the daemon loop.
///
/// The loop owns the manager and calls it from a single task, so methods
/// take `&mut self` and need no internal locking. Work that blocks or takes
/// long belongs on a [`WorkerPool`](crate::WorkerPool).
pub trait Manager: Send + Sized + 'static {
    /// Register a handler for every message kind this manager accepts.
    fn register(dispatcher: &mut EventDispatcher<Self>);

    /// Called once the loop is live and the router is receiving.
    ///
    /// # Errors
    ///
    /// An error aborts startup.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Called when an orderly shutdown begins.
    ///
    /// # Errors
    ///
    /// Errors are logged; shutdown continues.
    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release held resources. May be called more than once and must stay
    /// harmless after the first call.
    fn cleanup(&mut self) {}

    fn on_peer_connected(&mut self, _peer: &Identity) {}

    fn on_peer_disconnected(&mut self, _peer: &Identity) {}

    /// Periodic hook, run every [`tick_interval`](Manager::tick_interval).
    fn on_tick(&mut self) {}

    /// `None` disables [`on_tick`](Manager::on_tick).
    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}
