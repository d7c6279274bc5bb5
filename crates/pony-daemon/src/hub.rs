//! Hub manager for `sparkle`.
//!
//! The hub keeps its view of agents and actions in a [`Model`]. The `agent`
//! table has one row per agent and the `action` table one row per action.
//! What the hub asks for is desired state; what agents report is current
//! state. Nothing is persisted: the first time a hub sees an agent it sends
//! a resync, and rebuilds its view from the answer.
//!
//! Finished actions and agents gone for longer than `stale_after` are
//! dropped on the tick timer.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pony_core::{EventDispatcher, Manager, Model, Row, TableSchema};
use pony_rpc::RouterHandle;
use pony_types::{
    ActionRequest, ActionResult, AgentKind, AgentStatus, Identity, Part, Resync, RowKey,
    StateEntry, StateKind, kinds,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::actions::ActionId;
use crate::error::Result;

const AGENTS: &str = "agent";
const ACTIONS: &str = "action";

fn schemas() -> [TableSchema; 2] {
    [
        TableSchema::new(AGENTS).primary_key(["identity"]).index("kind"),
        TableSchema::new(ACTIONS).primary_key(["id"]).index("agent"),
    ]
}

fn to_part(value: impl Serialize) -> serde_json::Result<Part> {
    serde_json::to_value(value).and_then(serde_json::from_value)
}

fn column<T: DeserializeOwned>(part: Option<&Part>, name: &str) -> Option<T> {
    let value = part?.get(name)?;
    serde_json::from_value(value.clone()).ok()
}

/// What the hub knows about one agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub identity: Identity,
    pub kind: Option<AgentKind>,
    pub status: Option<AgentStatus>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Instant,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    first_seen: DateTime<Utc>,
    last_seen: Instant,
    disconnected_since: Option<Instant>,
}

pub struct HubManager {
    router: RouterHandle,
    stale_after: Duration,
    model: Model,
    liveness: HashMap<Identity, Liveness>,
    finished: VecDeque<(Instant, ActionId)>,
}

impl std::fmt::Debug for HubManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubManager")
            .field("agents", &self.liveness.len())
            .field("pending", &self.pending_actions())
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl HubManager {
    /// # Errors
    ///
    /// Only fails if the hub's table layout is inconsistent.
    pub fn new(router: RouterHandle, stale_after: Duration) -> Result<Self> {
        Ok(Self {
            router,
            stale_after,
            model: Model::new(schemas())?,
            liveness: HashMap::new(),
            finished: VecDeque::new(),
        })
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    #[must_use]
    pub fn agent(&self, identity: &Identity) -> Option<AgentRecord> {
        let live = self.liveness.get(identity)?;
        let current = self
            .model
            .table(AGENTS)
            .and_then(|table| table.get(&RowKey::from(identity)))
            .and_then(Row::current);

        Some(AgentRecord {
            identity: identity.clone(),
            kind: column(current, "kind"),
            status: column(current, "status"),
            first_seen: live.first_seen,
            last_seen: live.last_seen,
            connected: live.disconnected_since.is_none(),
        })
    }

    /// Every known agent, by identity.
    #[must_use]
    pub fn agents(&self) -> Vec<AgentRecord> {
        let mut identities: Vec<&Identity> = self.liveness.keys().collect();
        identities.sort();
        identities
            .into_iter()
            .filter_map(|identity| self.agent(identity))
            .collect()
    }

    #[must_use]
    pub fn connected_agents(&self) -> usize {
        self.liveness
            .values()
            .filter(|live| live.disconnected_since.is_none())
            .count()
    }

    /// Actions without a result, optionally only those sent to `agent`.
    fn pending_ids(&self, agent: Option<&Identity>) -> Vec<ActionId> {
        let Some(table) = self.model.table(ACTIONS) else {
            return Vec::new();
        };
        let rows = match agent {
            Some(agent) => table.list(&[("agent", agent.as_str())]),
            None => table.rows().collect(),
        };
        rows.into_iter()
            .filter(|row| row.desired().is_some() && row.current().is_none())
            .map(|row| ActionId::from(row.pkey().to_string()))
            .collect()
    }

    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.pending_ids(None).len()
    }

    fn action_row(&self, id: &ActionId) -> Option<&Row> {
        self.model.table(ACTIONS)?.get(&RowKey::from(id.as_str()))
    }

    #[must_use]
    pub fn result(&self, id: &ActionId) -> Option<ActionResult> {
        let current = self.action_row(id)?.current()?;
        serde_json::from_value(Value::Object(current.clone())).ok()
    }

    /// Hand out the result of a finished action and forget the action.
    ///
    /// # Errors
    ///
    /// Only fails if the action table is missing from the model.
    pub fn take_result(&mut self, id: &ActionId) -> Result<Option<ActionResult>> {
        let Some(result) = self.result(id) else {
            return Ok(None);
        };
        self.forget_action(id)?;
        Ok(Some(result))
    }

    fn forget_action(&mut self, id: &ActionId) -> Result<()> {
        let key = RowKey::from(id.as_str());
        for state in StateKind::ALL {
            self.model.update_row(ACTIONS, key.clone(), state, None)?;
        }
        Ok(())
    }

    /// Ask `agent` to run an action. The result arrives later as a `result`
    /// message and is available through [`HubManager::result`].
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Router` wrapping `UnknownRecipient` if the agent
    /// is not connected.
    pub fn request_action(
        &mut self,
        agent: &Identity,
        name: &str,
        params: Value,
    ) -> Result<ActionId> {
        let id = ActionId::new();
        let request = ActionRequest::new(id.as_str(), name, params);
        let mut desired = to_part(&request)?;
        desired.insert("agent".to_string(), json!(agent));

        self.router
            .send(kinds::ACTION, serde_json::to_value(&request)?, Some(agent))?;

        debug!("Action {} ({}) sent to {}", id, name, agent);
        self.model.update_row(
            ACTIONS,
            RowKey::from(id.as_str()),
            StateKind::Desired,
            Some(desired),
        )?;
        Ok(id)
    }

    /// Patch the desired state held for `agent`, or drop it with `None`.
    /// A connected agent is sent a resync right away; others get it the
    /// next time they connect.
    ///
    /// # Errors
    ///
    /// Only fails if the agent table is missing from the model.
    pub fn set_desired(&mut self, agent: &Identity, desired: Option<Part>) -> Result<()> {
        let desired = desired.map(|mut part| {
            part.insert("identity".to_string(), json!(agent));
            part
        });
        self.model
            .update_row(AGENTS, RowKey::from(agent), StateKind::Desired, desired)?;

        if self.router.is_connected(agent) {
            self.send_resync(agent);
        }
        Ok(())
    }

    /// Desired state an agent should hold: its own agent row and the actions
    /// still waiting on it.
    #[must_use]
    pub fn resync_for(&self, agent: &Identity) -> Resync {
        let key = RowKey::from(agent);
        let pending = self.pending_ids(Some(agent));
        let desired = self
            .model
            .dump(&[StateKind::Desired])
            .into_iter()
            .filter(|entry: &StateEntry| match entry.table.as_str() {
                AGENTS => entry.pkey == key,
                ACTIONS => pending
                    .iter()
                    .any(|id| entry.pkey == RowKey::from(id.as_str())),
                _ => false,
            })
            .collect();
        Resync { desired }
    }

    fn send_resync(&self, agent: &Identity) {
        let resync = self.resync_for(agent);
        let entries = resync.desired.len();
        let payload = match serde_json::to_value(&resync) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Resync for {} not encodable: {}", agent, e);
                return;
            }
        };
        match self.router.send(kinds::RESYNC, payload, Some(agent)) {
            Ok(()) => debug!("Resync sent to {} with {} desired entries", agent, entries),
            Err(e) => warn!("Resync for {} not delivered: {}", agent, e),
        }
    }

    /// Note that `identity` is alive. Returns `true` the first time the hub
    /// sees it.
    fn touch(&mut self, identity: &Identity) -> Result<bool> {
        let now = Instant::now();
        let first = !self.liveness.contains_key(identity);
        let live = self
            .liveness
            .entry(identity.clone())
            .or_insert_with(|| Liveness {
                first_seen: Utc::now(),
                last_seen: now,
                disconnected_since: None,
            });
        live.last_seen = now;
        live.disconnected_since = None;

        self.mark(identity, true)?;
        Ok(first)
    }

    fn mark(&mut self, identity: &Identity, connected: bool) -> Result<()> {
        let current = to_part(json!({"identity": identity, "connected": connected}))?;
        self.model.update_row(
            AGENTS,
            RowKey::from(identity),
            StateKind::Current,
            Some(current),
        )?;
        Ok(())
    }

    fn handle_status(&mut self, sender: &Identity, status: &AgentStatus) -> Result<()> {
        debug!(
            "Status from {}: {} v{} up {}s, {} active",
            sender, status.kind, status.version, status.uptime_secs, status.active_actions
        );
        self.touch(sender)?;

        let current = to_part(json!({"kind": status.kind, "status": status}))?;
        self.model.update_row(
            AGENTS,
            RowKey::from(sender),
            StateKind::Current,
            Some(current),
        )?;
        Ok(())
    }

    fn handle_result(&mut self, sender: &Identity, result: &ActionResult) -> anyhow::Result<()> {
        self.touch(sender)?;

        let id = ActionId::from(result.id.clone());
        let Some(row) = self.action_row(&id) else {
            anyhow::bail!("unsolicited result {} from {}", id, sender);
        };
        if row.current().is_some() {
            anyhow::bail!("duplicate result {} from {}", id, sender);
        }
        let expected: Option<String> = column(row.desired(), "agent");
        let name: String = column(row.desired(), "name").unwrap_or_default();

        if expected.as_deref() != Some(sender.as_str()) {
            warn!(
                "Result for action {} came from {}, expected {}",
                id,
                sender,
                expected.as_deref().unwrap_or("nobody")
            );
        }

        if result.ok {
            info!("Action {} ({}) on {} succeeded", id, name, sender);
        } else {
            warn!(
                "Action {} ({}) on {} failed: {}",
                id,
                name,
                sender,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        self.record_result(&id, result, Instant::now())?;
        Ok(())
    }

    fn record_result(&mut self, id: &ActionId, result: &ActionResult, now: Instant) -> Result<()> {
        self.model.update_row(
            ACTIONS,
            RowKey::from(id.as_str()),
            StateKind::Current,
            Some(to_part(result)?),
        )?;
        self.finished.push_back((now, id.clone()));
        Ok(())
    }

    /// Mark agents not heard from since `now - stale_after` as disconnected.
    /// Returns the identities that just went stale.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<Identity> {
        let mut expired = Vec::new();
        for (identity, live) in &mut self.liveness {
            if live.disconnected_since.is_none()
                && now.saturating_duration_since(live.last_seen) > self.stale_after
            {
                live.disconnected_since = Some(now);
                expired.push(identity.clone());
            }
        }
        for identity in &expired {
            warn!("Agent {} silent for over {:?}", identity, self.stale_after);
            if let Err(e) = self.mark(identity, false) {
                warn!("Cannot mark {} disconnected: {}", identity, e);
            }
        }
        expired
    }

    /// Forget agents disconnected for longer than `stale_after`. Desired
    /// state held for them is kept. Returns the identities dropped.
    pub fn evict_disconnected(&mut self, now: Instant) -> Vec<Identity> {
        let stale_after = self.stale_after;
        let evicted: Vec<Identity> = self
            .liveness
            .iter()
            .filter(|(_, live)| {
                live.disconnected_since
                    .is_some_and(|since| now.saturating_duration_since(since) > stale_after)
            })
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &evicted {
            self.liveness.remove(identity);
            debug!("Forgetting agent {}", identity);
            if let Err(e) =
                self.model
                    .update_row(AGENTS, RowKey::from(identity), StateKind::Current, None)
            {
                warn!("Cannot drop state of {}: {}", identity, e);
            }
        }
        evicted
    }

    /// Drop results finished more than `stale_after` before `now` that
    /// nobody took. Returns how many were dropped.
    pub fn expire_results(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        while let Some((finished_at, _)) = self.finished.front() {
            if now.saturating_duration_since(*finished_at) <= self.stale_after {
                break;
            }
            let Some((_, id)) = self.finished.pop_front() else {
                break;
            };
            if self.action_row(&id).is_none() {
                continue;
            }
            match self.forget_action(&id) {
                Ok(()) => dropped += 1,
                Err(e) => warn!("Cannot drop result {}: {}", id, e),
            }
        }
        if dropped > 0 {
            debug!("Dropped {} unclaimed results", dropped);
        }
        dropped
    }

    fn fail_pending_for(&mut self, agent: &Identity) -> Result<()> {
        let now = Instant::now();
        for id in self.pending_ids(Some(agent)) {
            let failure = ActionResult::failure(id.as_str(), "agent disconnected");
            self.record_result(&id, &failure, now)?;
        }
        Ok(())
    }
}

impl Manager for HubManager {
    fn register(dispatcher: &mut EventDispatcher<Self>) {
        dispatcher
            .on(kinds::STATUS, |manager: &mut Self, sender, status: AgentStatus| {
                manager.handle_status(sender, &status)?;
                Ok(())
            })
            .on(kinds::RESULT, |manager: &mut Self, sender, result: ActionResult| {
                manager.handle_result(sender, &result)
            });
    }

    fn start(&mut self) -> anyhow::Result<()> {
        info!("Hub started; agents are resynced as they connect");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let pending = self.pending_actions();
        if pending > 0 {
            warn!("{} actions pending at shutdown", pending);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.model.clear();
        self.liveness.clear();
        self.finished.clear();
    }

    fn on_peer_connected(&mut self, peer: &Identity) {
        info!("Agent {} connected", peer);
        match self.touch(peer) {
            Ok(true) => self.send_resync(peer),
            Ok(false) => {}
            Err(e) => warn!("Cannot record agent {}: {}", peer, e),
        }
    }

    fn on_peer_disconnected(&mut self, peer: &Identity) {
        info!("Agent {} disconnected", peer);
        let Some(live) = self.liveness.get_mut(peer) else {
            return;
        };
        if live.disconnected_since.is_none() {
            live.disconnected_since = Some(Instant::now());
        }

        if let Err(e) = self.mark(peer, false) {
            warn!("Cannot mark {} disconnected: {}", peer, e);
        }
        if let Err(e) = self.fail_pending_for(peer) {
            warn!("Cannot fail actions pending on {}: {}", peer, e);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.expire_stale(now);
        self.evict_disconnected(now);
        self.expire_results(now);
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some((self.stale_after / 3).max(Duration::from_secs(1)))
    }
}
