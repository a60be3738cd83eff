//! JSON configuration file of the harness binary.

use std::sync::Arc;

use crate::mount::{FuseMount, KernelMount, MountCore, MountPolling, RemoteMount};
use crate::scenario::Scenario;
use crate::service::ServiceCommands;
use crate::{HarnessError, Result};

/// Where commands for a host run.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum HostConfig {
    /// On the machine running the harness.
    Local {
        #[serde(default = "default_local_name")]
        name: String,
    },
    Ssh(remote::SshSession),
}

fn default_local_name() -> String {
    "localhost".to_string()
}

impl HostConfig {
    pub fn hostname(&self) -> &str {
        match self {
            HostConfig::Local { name } => name,
            HostConfig::Ssh(session) => &session.host,
        }
    }

    pub fn executor(&self, wait_timeout: std::time::Duration) -> Arc<dyn remote::Executor> {
        match self {
            HostConfig::Local { name } => Arc::new(
                remote::LocalExecutor::with_hostname(name).with_wait_timeout(wait_timeout),
            ),
            HostConfig::Ssh(session) => Arc::new(
                remote::SshExecutor::new(session.clone()).with_wait_timeout(wait_timeout),
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    #[default]
    Fuse,
    Kernel,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct ClientConfig {
    /// Client id, `0` for `client.0`
    pub id: String,
    pub host: HostConfig,
    #[serde(default)]
    pub kind: ClientKind,
    /// Extra `ceph-fuse` arguments, or extra `-o` options for kernel mounts
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Monitor addresses, required for kernel mounts
    #[serde(default)]
    pub monitors: Option<String>,
    #[serde(default = "default_true")]
    pub sudo: bool,
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct ServiceConfig {
    pub host: HostConfig,
    #[serde(default)]
    pub commands: ServiceCommands,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct MountPollConfig {
    pub attempts: u32,
    pub interval_secs: f64,
}

impl Default for MountPollConfig {
    fn default() -> Self {
        let polling = MountPolling::default();
        Self {
            attempts: polling.attempts,
            interval_secs: polling.interval.as_secs_f64(),
        }
    }
}

fn default_test_dir() -> String {
    "/home/ubuntu/cephtest".to_string()
}

fn default_restart_grace_secs() -> u64 {
    60
}

fn default_wait_timeout_secs() -> u64 {
    900
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default = "default_test_dir")]
    pub test_dir: String,
    pub service: ServiceConfig,
    pub clients: Vec<ClientConfig>,
    #[serde(default = "default_restart_grace_secs")]
    pub restart_grace_secs: u64,
    #[serde(default)]
    pub mount_poll: MountPollConfig,
    /// Bound on waiting for any background command
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default)]
    pub thrash_pool_snaps: Option<thrash::ThrashConfig>,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default, rename = "interactive-on-error")]
    pub interactive_on_error: bool,
}

fn seconds(what: &str, value: f64) -> Result<std::time::Duration> {
    if value.is_finite() && value > 0.0 {
        return Ok(std::time::Duration::from_secs_f64(value));
    }
    Err(HarnessError::Config(format!(
        "{what} must be a positive number of seconds, got {value}"
    )))
}

impl HarnessConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: HarnessConfig =
            serde_json::from_str(text).map_err(|error| HarnessError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            HarnessError::Config(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clients.len() < 2 {
            return Err(HarnessError::Precondition(format!(
                "at least 2 clients are required, {} configured",
                self.clients.len()
            )));
        }
        let mut ids = std::collections::BTreeSet::new();
        for client in &self.clients {
            if !ids.insert(client.id.as_str()) {
                return Err(HarnessError::Config(format!(
                    "client id {} is configured twice",
                    client.id
                )));
            }
            if client.kind == ClientKind::Kernel && client.monitors.is_none() {
                return Err(HarnessError::Config(format!(
                    "kernel client {} needs monitors",
                    client.id
                )));
            }
        }
        self.selected_scenarios(None)?;
        self.mount_polling()?;
        self.poll_interval()?;
        if let Some(thrash) = &self.thrash_pool_snaps {
            thrash.validate()?;
        }
        Ok(())
    }

    /// `test_name` from the command line wins over the file; neither selects every scenario.
    pub fn selected_scenarios(&self, cli: Option<Scenario>) -> Result<Vec<Scenario>> {
        if let Some(scenario) = cli {
            return Ok(vec![scenario]);
        }
        match &self.test_name {
            Some(name) => name
                .parse::<Scenario>()
                .map(|scenario| vec![scenario])
                .map_err(|_| HarnessError::Config(format!("unknown test_name {name:?}"))),
            None => Ok(Scenario::all()),
        }
    }

    pub fn mount_polling(&self) -> Result<MountPolling> {
        if self.mount_poll.attempts == 0 {
            return Err(HarnessError::Config(
                "mount_poll.attempts must be non-zero".to_string(),
            ));
        }
        Ok(MountPolling {
            attempts: self.mount_poll.attempts,
            interval: seconds("mount_poll.interval_secs", self.mount_poll.interval_secs)?,
        })
    }

    pub fn poll_interval(&self) -> Result<std::time::Duration> {
        seconds("service.poll_interval_secs", self.service.poll_interval_secs)
    }

    pub fn restart_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.restart_grace_secs)
    }

    pub fn wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn build_mount(&self, client: &ClientConfig) -> Result<Box<dyn RemoteMount>> {
        let core = MountCore::new(
            &client.id,
            client.host.executor(self.wait_timeout()),
            &self.test_dir,
        )
        .with_polling(self.mount_polling()?)
        .with_sudo(client.sudo);
        match client.kind {
            ClientKind::Fuse => {
                Ok(Box::new(FuseMount::new(core).with_extra_args(client.extra_args.clone())))
            }
            ClientKind::Kernel => {
                let monitors = client.monitors.as_deref().ok_or_else(|| {
                    HarnessError::Config(format!("kernel client {} needs monitors", client.id))
                })?;
                Ok(Box::new(
                    KernelMount::new(core, monitors).with_options(client.extra_args.clone()),
                ))
            }
        }
    }

    /// The first two clients, as mount A and mount B.
    pub fn build_mounts(&self) -> Result<(Box<dyn RemoteMount>, Box<dyn RemoteMount>)> {
        match self.clients.as_slice() {
            [a, b, ..] => Ok((self.build_mount(a)?, self.build_mount(b)?)),
            _ => Err(HarnessError::Precondition(
                "at least 2 clients are required".to_string(),
            )),
        }
    }
}
