use crate::{Error, Result};
use pony_rpc::{Address, Backoff};
use pony_types::{Identity, Role};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Identity agents address un-addressed messages to unless configured.
pub const DEFAULT_HUB: &str = "sparkle";

/// Daemon configuration, one file per daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Management interface endpoint (hub only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<ManagementConfig>,

    /// Data store (hub only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub hub: HubConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingConfig {
    /// `tcp://host:port` or `ipc:///path`
    #[serde(default)]
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,

    /// Hub identity agents send to by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<Identity>,
}

impl MessagingConfig {
    /// Parsed endpoint address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the address is empty or malformed.
    pub fn address(&self) -> Result<Address> {
        if self.address.trim().is_empty() {
            return Err(Error::Config("messaging.address is required".to_string()));
        }
        self.address
            .parse()
            .map_err(|e| Error::Config(format!("messaging.address: {e}")))
    }

    /// The hub's identity, `"sparkle"` unless configured.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in default is not a valid identity.
    pub fn hub_identity(&self) -> Result<Identity> {
        match &self.hub {
            Some(hub) => Ok(hub.clone()),
            None => Identity::new(DEFAULT_HUB).map_err(|e| Error::Config(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: u32,
}

fn default_initial_ms() -> u64 {
    100
}
fn default_max_ms() -> u64 {
    30_000
}
fn default_factor() -> u32 {
    2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            factor: default_factor(),
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_ms),
            max: Duration::from_millis(self.max_ms),
            factor: self.factor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementConfig {
    #[serde(default = "default_management_host")]
    pub host: String,

    #[serde(default = "default_management_port")]
    pub port: u16,
}

fn default_management_host() -> String {
    "127.0.0.1".to_string()
}
fn default_management_port() -> u16 {
    9860
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            host: default_management_host(),
            port: default_management_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Blocking action workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_status_interval() -> u64 {
    30
}
fn default_workers() -> usize {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval(),
            workers: default_workers(),
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Agents silent for longer than this are marked disconnected
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    90
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

impl HubConfig {
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Config {
    /// Load config from file.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigNotFound` if the file does not exist, or an
    /// error if it cannot be read or contains invalid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        super::validation::warn_unknown_fields(&content, &name);
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// The identity this daemon runs under. Hubs always have one; agents
    /// without a configured identity get one assigned at handshake.
    ///
    /// # Errors
    ///
    /// Propagates [`MessagingConfig::hub_identity`] failures.
    pub fn identity(&self, role: Role) -> Result<Option<Identity>> {
        match (role, &self.messaging.identity) {
            (_, Some(identity)) => Ok(Some(identity.clone())),
            (Role::Hub, None) => self.messaging.hub_identity().map(Some),
            (Role::Agent, None) => Ok(None),
        }
    }

    /// Check that everything `role` needs is present and sane.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending key.
    pub fn validate(&self, role: Role) -> Result<()> {
        self.messaging.address()?;

        let reconnect = &self.reconnect;
        if reconnect.initial_ms == 0 {
            return Err(Error::Config(
                "reconnect.initialMs must be positive".to_string(),
            ));
        }
        if reconnect.max_ms < reconnect.initial_ms {
            return Err(Error::Config(
                "reconnect.maxMs must not be below reconnect.initialMs".to_string(),
            ));
        }
        if reconnect.factor == 0 {
            return Err(Error::Config("reconnect.factor must be at least 1".to_string()));
        }

        match role {
            Role::Hub => {
                let Some(management) = &self.management else {
                    return Err(Error::Config("management section is required".to_string()));
                };
                if management.host.trim().is_empty() || management.port == 0 {
                    return Err(Error::Config(
                        "management.host and management.port must be set".to_string(),
                    ));
                }
                let Some(database) = &self.database else {
                    return Err(Error::Config("database section is required".to_string()));
                };
                if database.url.trim().is_empty() {
                    return Err(Error::Config("database.url is required".to_string()));
                }
                if self.hub.stale_after_secs == 0 {
                    return Err(Error::Config(
                        "hub.staleAfterSecs must be positive".to_string(),
                    ));
                }
            }
            Role::Agent => {
                self.messaging.hub_identity()?;
                if self.agent.workers == 0 {
                    return Err(Error::Config("agent.workers must be at least 1".to_string()));
                }
                if self.agent.status_interval_secs == 0 {
                    return Err(Error::Config(
                        "agent.statusIntervalSecs must be positive".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
