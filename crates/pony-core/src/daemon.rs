//! The daemon event loop.
//!
//! One task owns the [`Router`]'s receive side and the [`Manager`], and
//! multiplexes inbound router events, the manager's tick timer and the
//! shutdown token. Nothing else touches the manager, so handlers run
//! strictly one at a time in arrival order.

use std::time::Duration;

use pony_rpc::{Router, RouterEvent, RouterHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatch, EventDispatcher};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, State};
use crate::manager::Manager;

pub struct Daemon<M: Manager> {
    name: String,
    router: Router,
    manager: M,
    dispatcher: EventDispatcher<M>,
    lifecycle: Lifecycle,
    cleaned_up: bool,
}

impl<M: Manager> std::fmt::Debug for Daemon<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("name", &self.name)
            .field("state", &self.lifecycle.state())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl<M: Manager> Daemon<M> {
    pub fn new(name: impl Into<String>, router: Router, manager: M) -> Self {
        let mut dispatcher = EventDispatcher::new();
        M::register(&mut dispatcher);

        Self {
            name: name.into(),
            router,
            manager,
            dispatcher,
            lifecycle: Lifecycle::new(),
            cleaned_up: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut M {
        &mut self.manager
    }

    #[must_use]
    pub fn router_handle(&self) -> RouterHandle {
        self.router.handle()
    }

    /// Move to `Running`, calling the manager's `start` on the way.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error when not in `Created` or `Starting`, or the
    /// manager's error, in which case the daemon is left `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        if self.lifecycle.state() == State::Created {
            self.lifecycle.transition(State::Starting)?;
        }
        if self.lifecycle.state() != State::Starting {
            return Err(self.invalid(State::Running));
        }

        if let Err(e) = self.manager.start() {
            self.lifecycle.transition(State::Stopped)?;
            return Err(Error::Manager(e));
        }

        self.lifecycle.transition(State::Running)?;
        info!("{} running", self.name);
        Ok(())
    }

    /// Move from `Running` through `Stopping` to `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error unless the daemon is running. Manager
    /// errors during stop are logged, not returned.
    pub fn stop(&mut self) -> Result<()> {
        self.lifecycle.transition(State::Stopping)?;
        info!("{} stopping", self.name);

        if let Err(e) = self.manager.stop() {
            warn!("{} manager stop failed: {:#}", self.name, e);
        }

        self.lifecycle.transition(State::Stopped)?;
        Ok(())
    }

    /// Release the manager's resources and close the router. Runs once; later
    /// calls do nothing.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        debug!("{} cleaning up", self.name);
        self.manager.cleanup();
        self.router.close();
    }

    fn invalid(&self, to: State) -> Error {
        crate::error::LifecycleError {
            from: self.lifecycle.state(),
            to,
        }
        .into()
    }

    /// Feed one router event to the manager. Returns the dispatch outcome
    /// for messages.
    pub fn handle_event(&mut self, event: RouterEvent) -> Option<Dispatch> {
        match event {
            RouterEvent::PeerConnected(peer) => {
                self.manager.on_peer_connected(&peer);
                None
            }
            RouterEvent::PeerDisconnected(peer) => {
                self.manager.on_peer_disconnected(&peer);
                None
            }
            RouterEvent::Message(message) => {
                Some(self.dispatcher.dispatch(&mut self.manager, &message))
            }
        }
    }

    /// Wait for the next router event and handle it. Returns `false` once the
    /// router has closed.
    pub async fn process_next(&mut self) -> bool {
        match self.router.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Start, serve until `shutdown` is cancelled or the router closes, then
    /// stop and clean up.
    ///
    /// # Errors
    ///
    /// Returns startup failures. Shutdown itself does not fail.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self.start() {
            error!("{} failed to start: {}", self.name, e);
            self.cleanup();
            return Err(e);
        }

        let mut ticker = self.manager.tick_interval().map(ticker);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("{} shutdown requested", self.name);
                    break;
                }
                event = self.router.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        warn!("{} router closed", self.name);
                        break;
                    }
                },
                () = next_tick(ticker.as_mut()) => self.manager.on_tick(),
            }
        }

        if let Err(e) = self.stop() {
            warn!("{} stop: {}", self.name, e);
        }
        self.cleanup();
        info!("{} stopped", self.name);
        Ok(())
    }
}

impl<M: Manager> Drop for Daemon<M> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
