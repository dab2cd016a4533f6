//! Configuration for the consensus group, the connection layer and the pet owner protocol.
//!
//! Every section falls back to its defaults, so a config file only needs the values it changes:
//!
//! ```json
//! { "cluster": { "members": 5 }, "client": { "instance_name": "🐶" } }
//! ```

use super::error::ConfigError;
use super::ServerId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub client: ClientConfig,
    pub owner: OwnerConfig,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;
        self.client.validate()?;
        self.owner.validate()
    }
}

/// Shape and timing of the consensus group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// number of servers in the group
    pub members: ServerId,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// how often the leader proposes housekeeping, i.e. expiring sessions
    pub housekeeping_interval_ms: u64,
    pub max_entries_per_append: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            members: 3,
            election_timeout_min_ms: 200,
            election_timeout_max_ms: 400,
            heartbeat_interval_ms: 50,
            housekeeping_interval_ms: 250,
            max_entries_per_append: crate::server::DEFAULT_MAX_ENTRIES_PER_APPEND,
        }
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.members == 0 {
            return Err(ConfigError::Invalid("cluster.members must be at least 1".into()));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(ConfigError::Invalid(
                "cluster.election_timeout_min_ms exceeds election_timeout_max_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::Invalid(
                "cluster.heartbeat_interval_ms must be below the election timeout".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

/// Connection layer settings, one client per process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub instance_name: String,
    pub session_heartbeat_interval_ms: u64,
    /// a session missing heartbeats for this long is expired by the cluster
    pub session_ttl_ms: u64,
    pub request_timeout_ms: u64,
    /// attempts before a call fails as unavailable
    pub max_attempts: u32,
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// how often blocking calls (lock, await) check back with the cluster
    pub wait_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            instance_name: "client".into(),
            session_heartbeat_interval_ms: 1_000,
            session_ttl_ms: 5_000,
            request_timeout_ms: 1_000,
            max_attempts: 10,
            retry_backoff_initial_ms: 50,
            retry_backoff_max_ms: 1_000,
            wait_poll_interval_ms: 50,
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("client.max_attempts must be at least 1".into()));
        }
        if self.session_heartbeat_interval_ms >= self.session_ttl_ms {
            return Err(ConfigError::Invalid(
                "client.session_heartbeat_interval_ms must be below session_ttl_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn session_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.session_heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    pub publish_interval_min_ms: u64,
    pub publish_interval_max_ms: u64,
    /// photos are named `<pet>1.png` up to `<pet><variants>.png`
    pub photo_variants: u32,
    /// generation races tolerated per publication before giving up on it
    pub max_publish_attempts: u32,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        OwnerConfig {
            publish_interval_min_ms: 2_000,
            publish_interval_max_ms: 3_000,
            photo_variants: 15,
            max_publish_attempts: 8,
            restart_backoff_initial_ms: 100,
            restart_backoff_max_ms: 5_000,
        }
    }
}

impl OwnerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_interval_min_ms > self.publish_interval_max_ms {
            return Err(ConfigError::Invalid(
                "owner.publish_interval_min_ms exceeds publish_interval_max_ms".into(),
            ));
        }
        if self.photo_variants == 0 || self.max_publish_attempts == 0 {
            return Err(ConfigError::Invalid(
                "owner.photo_variants and owner.max_publish_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
