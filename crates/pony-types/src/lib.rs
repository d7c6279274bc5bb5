//! Shared types for ponycloud control-plane components.
//!
//! This crate provides the identity and event payload types used across
//! pony-rpc, pony-core and the daemons. All types are serializable for
//! transport inside message payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest identity accepted on the wire, in bytes.
pub const MAX_IDENTITY_LEN: usize = 255;

/// Message type tags understood by the daemons.
pub mod kinds {
    /// Agent → hub periodic or on-demand status report.
    pub const STATUS: &str = "status";
    /// Hub → agent request to run an action.
    pub const ACTION: &str = "action";
    /// Agent → hub outcome of an action.
    pub const RESULT: &str = "result";
    /// Hub → agents request to report status immediately.
    pub const RESYNC: &str = "resync";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity must not be empty")]
    Empty,

    #[error("Identity too long: {0} bytes (max: {MAX_IDENTITY_LEN})")]
    TooLong(usize),

    #[error("Identity contains control characters: {0:?}")]
    ControlCharacter(String),
}

/// Name of a connected peer, used for explicit addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity string.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is empty, longer than
    /// [`MAX_IDENTITY_LEN`] bytes or contains control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdentityError::Empty);
        }
        if value.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong(value.len()));
        }
        if value.chars().any(char::is_control) {
            return Err(IdentityError::ControlCharacter(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Identity {
    type Error = IdentityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which side of the messaging fabric a daemon sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Binds a listening endpoint and is addressed by identity.
    Hub,
    /// Connects outbound to the hub.
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Hub => write!(f, "hub"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

/// The two agent daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Compute host agent.
    Twilight,
    /// Storage agent.
    Luna,
}

impl AgentKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Twilight => "twilight",
            AgentKind::Luna => "luna",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Status report sent by an agent to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub kind: AgentKind,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(default)]
    pub active_actions: usize,
}

/// Action the hub asks an agent to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl ActionRequest {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            params,
        }
    }
}

/// Outcome of an [`ActionRequest`], reported back to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    #[must_use]
    pub fn success(id: impl Into<String>, output: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            output: Some(output),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// One column-to-value map, the unit every model row state is made of.
pub type Part = serde_json::Map<String, Value>;

/// The two halves of every model row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// What the hub wants to be true.
    Desired,
    /// What the agents report to be true.
    Current,
}

impl StateKind {
    pub const ALL: [StateKind; 2] = [StateKind::Desired, StateKind::Current];
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateKind::Desired => write!(f, "desired"),
            StateKind::Current => write!(f, "current"),
        }
    }
}

/// Primary key of a model row. Composite keys hold one value per key column,
/// in the order the columns are declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<String>);

impl RowKey {
    #[must_use]
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        Self(vec![value.to_string()])
    }
}

impl From<&Identity> for RowKey {
    fn from(identity: &Identity) -> Self {
        Self::from(identity.as_str())
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// One state of one row, as exchanged when state is dumped or replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub table: String,
    pub pkey: RowKey,
    pub state: StateKind,
    pub part: Part,
}

/// Hub request for an agent to report status now. Carries the desired state
/// the hub holds for that agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resync {
    pub desired: Vec<StateEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_rejects_empty() {
        assert_eq!(Identity::new(""), Err(IdentityError::Empty));
    }

    #[test]
    fn test_identity_rejects_too_long() {
        let long = "x".repeat(MAX_IDENTITY_LEN + 1);
        assert!(matches!(Identity::new(long), Err(IdentityError::TooLong(256))));
    }

    #[test]
    fn test_identity_rejects_control_characters() {
        assert!(matches!(
            Identity::new("twi\nlight"),
            Err(IdentityError::ControlCharacter(_))
        ));
    }

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let id = Identity::new("twilight").unwrap();
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("twilight"));
    }

    #[test]
    fn test_identity_deserialize_validates() {
        let result = serde_json::from_value::<Identity>(json!(""));
        assert!(result.is_err());

        let id: Identity = serde_json::from_value(json!("luna")).unwrap();
        assert_eq!(id.as_str(), "luna");
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Hub.to_string(), "hub");
        assert_eq!(Role::Agent.to_string(), "agent");
    }

    #[test]
    fn test_agent_status_camel_case() {
        let status = AgentStatus {
            kind: AgentKind::Luna,
            version: "0.4.0".to_string(),
            uptime_secs: 12,
            active_actions: 1,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["kind"], "luna");
        assert_eq!(value["uptimeSecs"], 12);
        assert_eq!(value["activeActions"], 1);
    }

    #[test]
    fn test_action_request_params_default_to_null() {
        let req: ActionRequest =
            serde_json::from_value(json!({"id": "a1", "name": "ping"})).unwrap();
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn test_action_result_failure_omits_output() {
        let result = ActionResult::failure("a1", "boom");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["ok"], false);
        assert!(value.get("output").is_none());
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_resync_decodes_from_empty_object() {
        let resync: Resync = serde_json::from_value(json!({})).unwrap();
        assert_eq!(resync, Resync::default());
    }

    #[test]
    fn test_state_entry_wire_format() {
        let mut part = Part::new();
        part.insert("kind".to_string(), json!("luna"));
        let entry = StateEntry {
            table: "agent".to_string(),
            pkey: RowKey::new(["luna"]),
            state: StateKind::Desired,
            part,
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({"table": "agent", "pkey": ["luna"], "state": "desired", "part": {"kind": "luna"}})
        );
        let back: StateEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_composite_row_key_display() {
        assert_eq!(RowKey::new(["tenant-1", "image-9"]).to_string(), "tenant-1/image-9");
        assert_eq!(RowKey::from("luna").values(), ["luna".to_string()]);
    }
}

#[cfg(test)]
mod proptest_identity_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn printable_identities_are_accepted(s in "[a-zA-Z0-9_\\-.:]{1,255}") {
            let id = Identity::new(s.clone()).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }

        #[test]
        fn identity_json_preserves_value(s in "[a-z0-9\\-]{1,64}") {
            let id = Identity::new(s).unwrap();
            let json = serde_json::to_string(&id).unwrap();
            let back: Identity = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, id);
        }
    }
}
