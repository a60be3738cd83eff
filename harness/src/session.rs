//! Typed queries against the service's session table and configuration.

use std::sync::Arc;

use tracing::instrument;

use crate::service::ServiceAdmin;
use crate::{HarnessError, Result};

pub const RECONNECT_TIMEOUT_KEY: &str = "mds_reconnect_timeout";
pub const SESSION_TIMEOUT_KEY: &str = "mds_session_timeout";
pub const MAX_BACKOFF_KEY: &str = "ms_max_backoff";

pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Opening,
    Open,
    Stale,
    Closing,
    Closed,
    Killing,
    #[serde(other)]
    Unknown,
}

/// One row of `session ls`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub state: SessionState,
    #[serde(default)]
    pub reconnecting: bool,
}

impl SessionRecord {
    /// Stale and closed sessions no longer count as connected clients.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, SessionState::Stale | SessionState::Closed)
    }
}

pub fn find_session(sessions: &[SessionRecord], id: u64) -> Option<&SessionRecord> {
    sessions.iter().find(|session| session.id == id)
}

/// Service timeouts the recovery bounds are derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceTimeouts {
    pub reconnect: std::time::Duration,
    pub session: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

fn parse_seconds(key: &str, value: &serde_json::Value) -> Result<std::time::Duration> {
    let seconds = match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match seconds {
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
            Ok(std::time::Duration::from_secs_f64(seconds))
        }
        _ => Err(HarnessError::AdminOutput {
            command: format!("config get {key}"),
            message: format!("expected a number of seconds, got {value}"),
        }),
    }
}

/// Read-mostly client for the service admin interface.
///
/// Every query goes to the service; nothing is cached between calls.
#[derive(Clone)]
pub struct SessionQueryClient {
    admin: Arc<dyn ServiceAdmin>,
    poll_interval: std::time::Duration,
}

impl std::fmt::Debug for SessionQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionQueryClient")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl SessionQueryClient {
    pub fn new(admin: Arc<dyn ServiceAdmin>) -> Self {
        Self {
            admin,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: std::time::Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// All sessions in the order the service reports them.
    #[instrument(skip(self))]
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let value = self.admin.admin(&["session", "ls"]).await?;
        let sessions: Vec<SessionRecord> =
            serde_json::from_value(value).map_err(|error| HarnessError::AdminOutput {
                command: "session ls".to_string(),
                message: error.to_string(),
            })?;
        tracing::debug!("sessions: {:?}", sessions);
        Ok(sessions)
    }

    pub async fn active_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut sessions = self.list_sessions().await?;
        sessions.retain(SessionRecord::is_active);
        Ok(sessions)
    }

    pub async fn session_state(&self, id: u64) -> Result<Option<SessionState>> {
        let sessions = self.list_sessions().await?;
        Ok(find_session(&sessions, id).map(|session| session.state))
    }

    pub async fn get_config(&self, key: &str) -> Result<serde_json::Value> {
        let value = self.admin.admin(&["config", "get", key]).await?;
        value
            .get(key)
            .cloned()
            .ok_or_else(|| HarnessError::AdminOutput {
                command: format!("config get {key}"),
                message: format!("key missing from {value}"),
            })
    }

    pub async fn get_config_seconds(&self, key: &str) -> Result<std::time::Duration> {
        let value = self.get_config(key).await?;
        parse_seconds(key, &value)
    }

    #[instrument(skip(self))]
    pub async fn fetch_timeouts(&self) -> Result<ServiceTimeouts> {
        let timeouts = ServiceTimeouts {
            reconnect: self.get_config_seconds(RECONNECT_TIMEOUT_KEY).await?,
            session: self.get_config_seconds(SESSION_TIMEOUT_KEY).await?,
            max_backoff: self.get_config_seconds(MAX_BACKOFF_KEY).await?,
        };
        tracing::info!("service timeouts: {:?}", timeouts);
        Ok(timeouts)
    }

    #[instrument(skip(self))]
    pub async fn evict(&self, id: u64) -> Result<()> {
        let id = id.to_string();
        self.admin.admin(&["session", "evict", &id]).await?;
        Ok(())
    }

    pub async fn set_network_block(&self, blocked: bool) -> Result<()> {
        tracing::info!("client network block: {}", blocked);
        self.admin.set_clients_block(blocked).await
    }

    pub async fn clear_firewall(&self) -> Result<()> {
        self.admin.clear_firewall().await
    }

    pub async fn restart(&self) -> Result<()> {
        tracing::info!("restarting service");
        self.admin.restart().await
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("stopping service");
        self.admin.stop().await
    }

    pub async fn fail_out(&self) -> Result<()> {
        self.admin.fail_out().await
    }

    pub async fn daemon_state(&self) -> Result<String> {
        self.admin.daemon_state().await
    }

    pub async fn daemon_hostnames(&self) -> Result<Vec<String>> {
        self.admin.daemon_hostnames().await
    }

    /// Polls the daemon state until it equals `target` and returns how long that took.
    ///
    /// Seeing `reject` first is a protocol violation; running past `timeout` is a timeout.
    #[instrument(skip(self))]
    pub async fn wait_for_state(
        &self,
        target: &str,
        timeout: std::time::Duration,
        reject: Option<&str>,
    ) -> Result<std::time::Duration> {
        let started = tokio::time::Instant::now();
        loop {
            let state = self.admin.daemon_state().await?;
            let elapsed = started.elapsed();
            if state == target {
                tracing::info!(
                    "reached {} after {}",
                    target,
                    crate::timing::format(elapsed)
                );
                return Ok(elapsed);
            }
            if reject == Some(state.as_str()) {
                return Err(HarnessError::ProtocolViolation {
                    expected: target.to_string(),
                    observed: state,
                });
            }
            if elapsed > timeout {
                return Err(HarnessError::Timeout {
                    what: format!("service state {target} (last seen {state})"),
                    waited: elapsed,
                });
            }
            tracing::debug!("service state {}, waiting for {}", state, target);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
