//! Actions an agent runs on the hub's behalf.
//!
//! Actions run on worker threads and may block.

use std::time::Duration;

use pony_types::{ActionRequest, ActionResult, AgentKind, Identity};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{DaemonError, Result};

/// Longest a `sleep` action may block a worker, in milliseconds.
pub const MAX_SLEEP_MS: u64 = 60_000;

/// Correlates an action request with its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ActionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What an action may know about the agent running it.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub identity: Option<Identity>,
    pub kind: AgentKind,
    pub version: &'static str,
}

#[derive(Deserialize)]
struct SleepParams {
    ms: u64,
}

/// Run `request` to completion on the current thread.
///
/// # Errors
///
/// Returns `DaemonError::UnknownAction` for unsupported names and
/// `DaemonError::InvalidParams` for bad parameters.
pub fn run(request: &ActionRequest, agent: &AgentInfo) -> Result<Value> {
    match request.name.as_str() {
        "ping" => Ok(json!({ "pong": request.params })),
        "describe" => Ok(json!({
            "identity": agent.identity.as_ref().map(Identity::as_str),
            "kind": agent.kind,
            "version": agent.version,
        })),
        "sleep" => {
            let params = SleepParams::deserialize(&request.params)
                .map_err(|e| DaemonError::InvalidParams(e.to_string()))?;
            let ms = params.ms.min(MAX_SLEEP_MS);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!({ "sleptMs": ms }))
        }
        other => Err(DaemonError::UnknownAction(other.to_string())),
    }
}

/// Run `request` and fold the outcome into a result for the hub.
#[must_use]
pub fn execute(request: &ActionRequest, agent: &AgentInfo) -> ActionResult {
    match run(request, agent) {
        Ok(output) => ActionResult::success(&request.id, output),
        Err(e) => ActionResult::failure(&request.id, e.to_string()),
    }
}
