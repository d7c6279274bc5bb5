//! Agent manager shared by `twilight` and `luna`.
//!
//! The agent reports its status to the hub whenever the connection comes up,
//! on a fixed interval and on request (`resync`). Action requests are run on
//! the worker pool; each result goes straight back to the requesting hub
//! from the worker thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pony_core::{EventDispatcher, Manager, WorkerPool};
use pony_rpc::RouterHandle;
use pony_types::{ActionRequest, AgentKind, AgentStatus, Identity, Resync, kinds};
use tracing::{debug, info, warn};

use crate::actions::{self, AgentInfo};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AgentManager {
    kind: AgentKind,
    router: RouterHandle,
    pool: WorkerPool,
    status_interval: Duration,
    started_at: Instant,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("kind", &self.kind)
            .field("workers", &self.pool.size())
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AgentManager {
    #[must_use]
    pub fn new(
        kind: AgentKind,
        router: RouterHandle,
        workers: usize,
        status_interval: Duration,
    ) -> Self {
        Self {
            kind,
            router,
            pool: WorkerPool::new(workers),
            status_interval,
            started_at: Instant::now(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Actions queued or running on the worker pool.
    #[must_use]
    pub fn active_actions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            kind: self.kind,
            version: VERSION.to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_actions: self.active_actions(),
        }
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            identity: self.router.local_identity(),
            kind: self.kind,
            version: VERSION,
        }
    }

    /// Send the current status to the hub.
    ///
    /// # Errors
    ///
    /// Fails while the hub is not connected.
    pub fn report_status(&self) -> anyhow::Result<()> {
        let status = serde_json::to_value(self.status())?;
        self.router.send(kinds::STATUS, status, None)?;
        debug!("Status reported");
        Ok(())
    }

    fn handle_action(&mut self, sender: &Identity, request: ActionRequest) {
        info!("Action {} ({}) requested by {}", request.id, request.name, sender);

        let router = self.router.clone();
        let reply_to = sender.clone();
        let agent = self.info();
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::SeqCst);

        self.pool.spawn(move || {
            let result = actions::execute(&request, &agent);
            active.fetch_sub(1, Ordering::SeqCst);

            if !result.ok {
                warn!(
                    "Action {} failed: {}",
                    result.id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }

            match serde_json::to_value(&result) {
                Ok(payload) => {
                    if let Err(e) = router.send(kinds::RESULT, payload, Some(&reply_to)) {
                        warn!("Result of action {} not delivered: {}", result.id, e);
                    }
                }
                Err(e) => warn!("Result of action {} not encodable: {}", result.id, e),
            }
        });
    }
}

impl Manager for AgentManager {
    fn register(dispatcher: &mut EventDispatcher<Self>) {
        dispatcher
            .on(kinds::ACTION, |manager: &mut Self, sender, request: ActionRequest| {
                manager.handle_action(sender, request);
                Ok(())
            })
            .on(kinds::RESYNC, |manager: &mut Self, sender, resync: Resync| {
                debug!(
                    "Resync from {} with {} desired entries",
                    sender,
                    resync.desired.len()
                );
                manager.report_status()
            });
    }

    fn start(&mut self) -> anyhow::Result<()> {
        info!(
            "{} agent started ({} workers, status every {:?})",
            self.kind,
            self.pool.size(),
            self.status_interval
        );
        Ok(())
    }

    fn cleanup(&mut self) {
        let active = self.active_actions();
        if active > 0 {
            warn!("{} actions still running at shutdown", active);
        }
    }

    fn on_peer_connected(&mut self, peer: &Identity) {
        if self.router.default_recipient() != Some(peer) {
            warn!(
                "Connected to hub {} but configured for {}; not reporting",
                peer,
                self.router
                    .default_recipient()
                    .map_or_else(|| "none".to_string(), ToString::to_string)
            );
            return;
        }
        if let Err(e) = self.report_status() {
            warn!("Initial status report failed: {:#}", e);
        }
    }

    fn on_peer_disconnected(&mut self, peer: &Identity) {
        info!("Hub {} went away; waiting for reconnect", peer);
    }

    fn on_tick(&mut self) {
        if let Err(e) = self.report_status() {
            debug!("Periodic status skipped: {:#}", e);
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.status_interval)
    }
}
