//! The metadata service as seen by the harness: admin queries plus lifecycle control.

use std::sync::Arc;

use crate::{HarnessError, Result};

/// Daemon state once the service is serving requests.
pub const STATE_ACTIVE: &str = "up:active";
/// Daemon state while previously connected clients may re-establish their sessions.
pub const STATE_RECONNECT: &str = "up:reconnect";

/// Administrative and lifecycle interface of the metadata service.
#[async_trait::async_trait]
pub trait ServiceAdmin: Send + Sync {
    /// Runs an admin command (e.g. `["session", "ls"]`) and returns its JSON output.
    async fn admin(&self, command: &[&str]) -> Result<serde_json::Value>;
    async fn daemon_state(&self) -> Result<String>;
    async fn stop(&self) -> Result<()>;
    /// Marks the stopped daemon as failed so a restart goes through reconnect.
    async fn fail_out(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    async fn clear_firewall(&self) -> Result<()>;
    async fn set_clients_block(&self, blocked: bool) -> Result<()>;
    async fn daemon_hostnames(&self) -> Result<Vec<String>>;
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn default_state_pointer() -> String {
    "/state".to_string()
}

// rejects daemon traffic both ways: requests from clients and the daemon's replies
const BLOCK_SCRIPT: &str = "\
iptables -I INPUT -p tcp --dport 6800:7300 -j REJECT -m comment --comment recovery-harness && \
iptables -I OUTPUT -p tcp --sport 6800:7300 -j REJECT -m comment --comment recovery-harness";

// removes both rules, failing if either one was missing
const UNBLOCK_SCRIPT: &str = "\
iptables -D INPUT -p tcp --dport 6800:7300 -j REJECT -m comment --comment recovery-harness; \
input=$?; \
iptables -D OUTPUT -p tcp --sport 6800:7300 -j REJECT -m comment --comment recovery-harness \
&& [ \"$input\" -eq 0 ]";

/// Command vectors run on the service host.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ServiceCommands {
    /// Prepended to every admin command, including any output-format flag
    pub admin_prefix: Vec<String>,
    /// Prints daemon status as JSON; a non-zero exit means the daemon is down
    pub state: Vec<String>,
    /// JSON pointer to the state string in the `state` output
    #[serde(default = "default_state_pointer")]
    pub state_pointer: String,
    pub stop: Vec<String>,
    pub fail: Vec<String>,
    pub restart: Vec<String>,
    pub block: Vec<String>,
    pub unblock: Vec<String>,
    pub clear_firewall: Vec<String>,
    /// Hosts running service daemons, defaults to the host the commands run on
    pub daemon_hosts: Vec<String>,
}

impl Default for ServiceCommands {
    fn default() -> Self {
        Self {
            admin_prefix: strings(&["sudo", "ceph", "daemon", "mds.a"]),
            state: strings(&["sudo", "ceph", "daemon", "mds.a", "status"]),
            state_pointer: default_state_pointer(),
            stop: strings(&["sudo", "systemctl", "stop", "ceph-mds@a"]),
            fail: strings(&["sudo", "ceph", "mds", "fail", "a"]),
            restart: strings(&["sudo", "systemctl", "restart", "ceph-mds@a"]),
            block: strings(&["sudo", "sh", "-c", BLOCK_SCRIPT]),
            unblock: strings(&["sudo", "sh", "-c", UNBLOCK_SCRIPT]),
            clear_firewall: strings(&[
                "sudo",
                "sh",
                "-c",
                "iptables-save | grep -v recovery-harness | iptables-restore",
            ]),
            daemon_hosts: Vec::new(),
        }
    }
}

/// [`ServiceAdmin`] that runs [`ServiceCommands`] through an executor.
#[derive(Debug)]
pub struct RemoteServiceAdmin {
    executor: Arc<dyn remote::Executor>,
    commands: ServiceCommands,
}

impl RemoteServiceAdmin {
    pub fn new(executor: Arc<dyn remote::Executor>, commands: ServiceCommands) -> Self {
        Self { executor, commands }
    }

    async fn run_vector(&self, name: &str, vector: &[String]) -> Result<remote::CommandOutput> {
        if vector.is_empty() {
            return Err(HarnessError::Config(format!(
                "service command {name:?} is not configured"
            )));
        }
        let args: Vec<&str> = vector.iter().map(String::as_str).collect();
        tracing::debug!("service {}: {}", name, remote::format_command(&args));
        Ok(self.executor.run(&args, true).await?)
    }
}

fn parse_json(command: &str, stdout: &str) -> Result<serde_json::Value> {
    if stdout.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(stdout).map_err(|error| HarnessError::AdminOutput {
        command: command.to_string(),
        message: error.to_string(),
    })
}

#[async_trait::async_trait]
impl ServiceAdmin for RemoteServiceAdmin {
    async fn admin(&self, command: &[&str]) -> Result<serde_json::Value> {
        let mut args: Vec<&str> = self
            .commands
            .admin_prefix
            .iter()
            .map(String::as_str)
            .collect();
        args.extend_from_slice(command);
        let output = self.executor.run(&args, true).await?;
        parse_json(&command.join(" "), &output.stdout)
    }

    async fn daemon_state(&self) -> Result<String> {
        let args: Vec<&str> = self.commands.state.iter().map(String::as_str).collect();
        let output = self.executor.run(&args, false).await?;
        if !output.success() {
            tracing::debug!("state command exited with {:?}, daemon is down", output.status);
            return Ok("down:unreachable".to_string());
        }
        let value = parse_json("state", &output.stdout)?;
        value
            .pointer(&self.commands.state_pointer)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HarnessError::AdminOutput {
                command: "state".to_string(),
                message: format!("no string at {}", self.commands.state_pointer),
            })
    }

    async fn stop(&self) -> Result<()> {
        self.run_vector("stop", &self.commands.stop).await?;
        Ok(())
    }

    async fn fail_out(&self) -> Result<()> {
        self.run_vector("fail", &self.commands.fail).await?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.run_vector("restart", &self.commands.restart).await?;
        Ok(())
    }

    async fn clear_firewall(&self) -> Result<()> {
        self.run_vector("clear_firewall", &self.commands.clear_firewall)
            .await?;
        Ok(())
    }

    async fn set_clients_block(&self, blocked: bool) -> Result<()> {
        if blocked {
            self.run_vector("block", &self.commands.block).await?;
        } else {
            self.run_vector("unblock", &self.commands.unblock).await?;
        }
        Ok(())
    }

    async fn daemon_hostnames(&self) -> Result<Vec<String>> {
        if self.commands.daemon_hosts.is_empty() {
            return Ok(vec![self.executor.hostname().to_string()]);
        }
        Ok(self.commands.daemon_hosts.clone())
    }
}
