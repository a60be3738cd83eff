//! In-memory metadata service and client mounts, driven by tokio's clock.
//!
//! The model follows the session protocol closely enough for every scenario to observe the
//! behaviour it checks: sessions go stale after the session timeout without heartbeats, a
//! restart waits in reconnect for sessions whose client is gone, and a capability moves to a
//! new writer only once its holder's session is stale or evicted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use harness::mount::{
    BackgroundProcess, HoldKind, MountCore, MountPolling, MountState, RemoteMount, TEST_FILES,
};
use harness::service::{STATE_ACTIVE, STATE_RECONNECT, ServiceAdmin};
use harness::{HarnessError, Result};

pub const SESSION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
pub const RECONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45);
pub const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(15);
pub const SERVICE_HOST: &str = "mds-host";

const WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(900);
const CLIENT_POLL: std::time::Duration = std::time::Duration::from_millis(100);
const KILLED: i32 = 137;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Daemon {
    Active,
    Reconnect(Instant),
    Stopped,
    Failed,
}

impl Daemon {
    fn state(self) -> &'static str {
        match self {
            Daemon::Active => STATE_ACTIVE,
            Daemon::Reconnect(_) => STATE_RECONNECT,
            Daemon::Stopped => "down:stopped",
            Daemon::Failed => "down:failed",
        }
    }

    fn is_up(self) -> bool {
        matches!(self, Daemon::Active | Daemon::Reconnect(_))
    }
}

#[derive(Debug)]
struct Session {
    client: String,
    stale: bool,
    reconnecting: bool,
    last_heard: Instant,
    recover_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Client {
    mounted: bool,
    alive: bool,
    generation: u64,
    session: Option<u64>,
}

#[derive(Debug)]
struct ClusterState {
    daemon: Daemon,
    sessions: BTreeMap<u64, Session>,
    clients: BTreeMap<String, Client>,
    next_session: u64,
    blocked: bool,
    cap_holder: Option<String>,
    files: BTreeMap<String, String>,
    stale_factor: f64,
    reconnect_factor: f64,
    full_reconnect_window: bool,
    caps_enforced: bool,
    recovery_delay: std::time::Duration,
    restarts: usize,
    evicted: Vec<u64>,
}

impl ClusterState {
    fn new() -> Self {
        Self {
            daemon: Daemon::Active,
            sessions: BTreeMap::new(),
            clients: BTreeMap::new(),
            next_session: 4100,
            blocked: false,
            cap_holder: None,
            files: BTreeMap::new(),
            stale_factor: 1.0,
            reconnect_factor: 1.0,
            full_reconnect_window: false,
            caps_enforced: true,
            recovery_delay: MAX_BACKOFF / 2,
            restarts: 0,
            evicted: Vec::new(),
        }
    }

    fn reachable(&self, client: &str) -> bool {
        !self.blocked
            && self
                .clients
                .get(client)
                .is_some_and(|c| c.mounted && c.alive)
    }

    /// The session's client is still attached to it and can talk to the service.
    fn attached(&self, id: u64) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                self.clients
                    .get(&session.client)
                    .is_some_and(|c| c.session == Some(id))
                    && self.reachable(&session.client)
            }
            None => false,
        }
    }

    fn release_caps(&mut self, client: &str) {
        if self.cap_holder.as_deref() == Some(client) {
            self.cap_holder = None;
        }
    }

    fn drop_session(&mut self, id: u64) {
        if let Some(session) = self.sessions.remove(&id) {
            self.release_caps(&session.client);
            if let Some(client) = self.clients.get_mut(&session.client) {
                if client.session == Some(id) {
                    client.session = None;
                }
            }
        }
    }

    fn advance(&mut self, now: Instant) {
        match self.daemon {
            Daemon::Stopped | Daemon::Failed => return,
            Daemon::Reconnect(since) => {
                let back: Vec<u64> = self
                    .sessions
                    .iter()
                    .filter(|(id, session)| session.reconnecting && self.attached(**id))
                    .map(|(id, _)| *id)
                    .collect();
                for id in back {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.reconnecting = false;
                    }
                }
                let window = RECONNECT_TIMEOUT.mul_f64(self.reconnect_factor);
                if now.duration_since(since) >= window {
                    let missing: Vec<u64> = self
                        .sessions
                        .iter()
                        .filter(|(_, session)| session.reconnecting)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in missing {
                        self.drop_session(id);
                    }
                }
                if self.sessions.values().any(|session| session.reconnecting) {
                    return;
                }
                if self.full_reconnect_window && now.duration_since(since) < window {
                    return;
                }
                self.daemon = Daemon::Active;
            }
            Daemon::Active => {}
        }
        let joining: Vec<String> = self
            .clients
            .iter()
            .filter(|(name, client)| client.session.is_none() && self.reachable(name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in joining {
            let id = self.next_session;
            self.next_session += 1;
            self.sessions.insert(
                id,
                Session {
                    client: name.clone(),
                    stale: false,
                    reconnecting: false,
                    last_heard: now,
                    recover_at: None,
                },
            );
            if let Some(client) = self.clients.get_mut(&name) {
                client.session = Some(id);
            }
        }
        let stale_after = SESSION_TIMEOUT.mul_f64(self.stale_factor);
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            let attached = self.attached(id);
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if session.stale {
                if !attached {
                    continue;
                }
                match session.recover_at {
                    Some(at) if now >= at => {
                        session.stale = false;
                        session.recover_at = None;
                        session.last_heard = now;
                    }
                    Some(_) => {}
                    None => session.recover_at = Some(now + self.recovery_delay),
                }
            } else if attached {
                session.last_heard = now;
            } else if now.duration_since(session.last_heard) > stale_after {
                session.stale = true;
                let client = session.client.clone();
                self.release_caps(&client);
            }
        }
    }

    fn restart(&mut self, now: Instant) {
        self.restarts += 1;
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.stale)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.drop_session(id);
        }
        for session in self.sessions.values_mut() {
            session.reconnecting = true;
            session.last_heard = now;
        }
        self.daemon = Daemon::Reconnect(now);
    }

    fn admin(&mut self, command: &[&str]) -> Result<serde_json::Value> {
        let fail = |message: String| HarnessError::AdminOutput {
            command: command.join(" "),
            message,
        };
        if !self.daemon.is_up() {
            return Err(fail(format!("daemon is {}", self.daemon.state())));
        }
        match command {
            ["session", "ls"] => Ok(serde_json::Value::Array(
                self.sessions
                    .iter()
                    .map(|(id, session)| {
                        serde_json::json!({
                            "id": id,
                            "state": if session.stale { "stale" } else { "open" },
                            "reconnecting": session.reconnecting,
                        })
                    })
                    .collect(),
            )),
            ["session", "evict", id] => {
                let id: u64 = id.parse().map_err(|_| fail("bad session id".to_string()))?;
                if !self.sessions.contains_key(&id) {
                    return Err(fail(format!("no session {id}")));
                }
                self.drop_session(id);
                self.evicted.push(id);
                Ok(serde_json::Value::Null)
            }
            ["config", "get", key] => {
                let seconds = match *key {
                    "mds_session_timeout" => SESSION_TIMEOUT,
                    "mds_reconnect_timeout" => RECONNECT_TIMEOUT,
                    "ms_max_backoff" => MAX_BACKOFF,
                    _ => return Err(fail(format!("unknown key {key}"))),
                };
                let mut reply = serde_json::Map::new();
                reply.insert(
                    key.to_string(),
                    serde_json::Value::String(format!("{:.6}", seconds.as_secs_f64())),
                );
                Ok(serde_json::Value::Object(reply))
            }
            _ => Err(fail("unknown command".to_string())),
        }
    }

    fn incarnation_alive(&self, client: &str, generation: u64) -> bool {
        self.clients
            .get(client)
            .is_some_and(|c| c.alive && c.generation == generation)
    }

    fn can_write(&self, client: &str) -> bool {
        let session = self.clients.get(client).and_then(|c| c.session);
        self.daemon == Daemon::Active
            && session.is_some_and(|id| {
                self.attached(id) && self.sessions.get(&id).is_some_and(|s| !s.stale)
            })
            && (!self.caps_enforced
                || self
                    .cap_holder
                    .as_deref()
                    .is_none_or(|holder| holder == client))
    }

    fn is_mounted(&self, client: &str) -> bool {
        self.clients.get(client).is_some_and(|c| {
            c.mounted
                && c.alive
                && c.session
                    .and_then(|id| self.sessions.get(&id))
                    .is_some_and(|s| !s.stale)
        })
    }
}

/// Shared handle to the simulated cluster.
#[derive(Clone, Debug)]
pub struct SimCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::new())),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.advance(now);
        let result = f(&mut state);
        state.advance(now);
        result
    }

    /// Stretches how long a silent session takes to go stale, in session timeouts.
    pub fn set_stale_factor(&self, factor: f64) {
        self.with_state(|state| state.stale_factor = factor);
    }

    /// Scales how long the daemon waits in reconnect, without changing the timeout it reports.
    pub fn set_reconnect_factor(&self, factor: f64) {
        self.with_state(|state| state.reconnect_factor = factor);
    }

    /// Keeps the daemon in reconnect for the whole window even once nobody is left to wait for.
    pub fn set_full_reconnect_window(&self, full: bool) {
        self.with_state(|state| state.full_reconnect_window = full);
    }

    /// With caps off, any client with a live session may write regardless of the holder.
    pub fn set_caps_enforced(&self, enforced: bool) {
        self.with_state(|state| state.caps_enforced = enforced);
    }

    /// How long a stale session takes to come back once its client is reachable again.
    pub fn set_recovery_delay(&self, delay: std::time::Duration) {
        self.with_state(|state| state.recovery_delay = delay);
    }

    pub fn restarts(&self) -> usize {
        self.with_state(|state| state.restarts)
    }

    pub fn evicted(&self) -> Vec<u64> {
        self.with_state(|state| state.evicted.clone())
    }

    pub fn blocked(&self) -> bool {
        self.with_state(|state| state.blocked)
    }

    pub fn admin(&self) -> Arc<SimAdmin> {
        Arc::new(SimAdmin {
            cluster: self.clone(),
        })
    }

    pub fn mount(&self, client_id: &str, host: &str) -> SimMount {
        self.with_state(|state| {
            state.clients.insert(client_id.to_string(), Client::default());
        });
        let executor = remote::LocalExecutor::with_hostname(host).with_wait_timeout(WAIT_TIMEOUT);
        let core = MountCore::new(client_id, Arc::new(executor), "/sim")
            .with_sudo(false)
            .with_polling(MountPolling::default());
        SimMount {
            core,
            cluster: self.clone(),
        }
    }
}

#[derive(Debug)]
pub struct SimAdmin {
    cluster: SimCluster,
}

#[async_trait::async_trait]
impl ServiceAdmin for SimAdmin {
    async fn admin(&self, command: &[&str]) -> Result<serde_json::Value> {
        self.cluster.with_state(|state| state.admin(command))
    }

    async fn daemon_state(&self) -> Result<String> {
        Ok(self
            .cluster
            .with_state(|state| state.daemon.state().to_string()))
    }

    async fn stop(&self) -> Result<()> {
        self.cluster.with_state(|state| state.daemon = Daemon::Stopped);
        Ok(())
    }

    async fn fail_out(&self) -> Result<()> {
        self.cluster.with_state(|state| state.daemon = Daemon::Failed);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.cluster
            .with_state(|state| state.restart(Instant::now()));
        Ok(())
    }

    async fn clear_firewall(&self) -> Result<()> {
        self.cluster.with_state(|state| state.blocked = false);
        Ok(())
    }

    async fn set_clients_block(&self, blocked: bool) -> Result<()> {
        self.cluster.with_state(|state| state.blocked = blocked);
        Ok(())
    }

    async fn daemon_hostnames(&self) -> Result<Vec<String>> {
        Ok(vec![SERVICE_HOST.to_string()])
    }
}

fn exited(status: i32) -> remote::CommandOutput {
    remote::CommandOutput {
        status: Some(status),
        ..Default::default()
    }
}

/// Writes `name` once the client may, then keeps it open until stdin closes.
async fn hold(
    cluster: SimCluster,
    client: String,
    generation: u64,
    name: String,
    mut stdin: tokio::io::DuplexStream,
) -> std::result::Result<remote::CommandOutput, remote::RemoteError> {
    let mut holding = false;
    let mut buf = [0u8; 16];
    loop {
        let alive = cluster.with_state(|state| {
            if !state.incarnation_alive(&client, generation) {
                return false;
            }
            if !holding && state.can_write(&client) {
                state.cap_holder = Some(client.clone());
                state
                    .files
                    .insert(name.clone(), "contentcontent2".to_string());
                holding = true;
            }
            true
        });
        if !alive {
            return Ok(exited(KILLED));
        }
        tokio::select! {
            read = stdin.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            _ = tokio::time::sleep(CLIENT_POLL) => {}
        }
    }
    if holding {
        cluster.with_state(|state| state.release_caps(&client));
    }
    Ok(exited(0))
}

/// Writes `name` once the client may.
async fn write_file(
    cluster: SimCluster,
    client: String,
    generation: u64,
    name: String,
) -> std::result::Result<remote::CommandOutput, remote::RemoteError> {
    loop {
        let status = cluster.with_state(|state| {
            if !state.incarnation_alive(&client, generation) {
                return Some(KILLED);
            }
            if state.can_write(&client) {
                state.files.insert(name.clone(), "content".to_string());
                return Some(0);
            }
            None
        });
        if let Some(status) = status {
            return Ok(exited(status));
        }
        tokio::time::sleep(CLIENT_POLL).await;
    }
}

#[derive(Debug)]
pub struct SimMount {
    core: MountCore,
    cluster: SimCluster,
}

impl SimMount {
    fn generation(&self) -> u64 {
        let id = self.core.client_id();
        self.cluster
            .with_state(|state| state.clients.get(id).map_or(0, |c| c.generation))
    }

    fn start<F>(
        &self,
        command: &str,
        stdin: Option<remote::ProcessStdin>,
        waiter: F,
    ) -> remote::RemoteProcess
    where
        F: std::future::Future<
                Output = std::result::Result<remote::CommandOutput, remote::RemoteError>,
            > + Send
            + 'static,
    {
        remote::RemoteProcess::start(
            self.core.hostname(),
            command.to_string(),
            stdin,
            waiter,
            WAIT_TIMEOUT,
        )
    }
}

#[async_trait::async_trait]
impl RemoteMount for SimMount {
    fn core(&self) -> &MountCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MountCore {
        &mut self.core
    }

    fn technology(&self) -> &'static str {
        "sim"
    }

    async fn mount(&mut self) -> Result<()> {
        self.core.expect_state("mount", &[MountState::Unmounted])?;
        let id = self.core.client_id().to_string();
        self.cluster.with_state(|state| {
            let client = state.clients.entry(id).or_default();
            client.mounted = true;
            client.alive = true;
            client.generation += 1;
            client.session = None;
        });
        self.core.set_state(MountState::Mounting);
        Ok(())
    }

    async fn umount_wait(&mut self, force: bool) -> Result<()> {
        if !force {
            self.core
                .expect_state("unmount", &[MountState::Mounted, MountState::Mounting])?;
        }
        let id = self.core.client_id().to_string();
        self.cluster.with_state(|state| {
            let session = state.clients.get(&id).and_then(|c| c.session);
            // a clean unmount closes the session; with the daemon down it is left behind
            if let Some(session) = session {
                if state.daemon == Daemon::Active {
                    state.drop_session(session);
                }
            }
            state.release_caps(&id);
            if let Some(client) = state.clients.get_mut(&id) {
                client.mounted = false;
                client.session = None;
            }
        });
        self.core.set_state(MountState::Unmounted);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.core
            .expect_state("kill", &[MountState::Mounted, MountState::Mounting])?;
        let id = self.core.client_id().to_string();
        self.cluster.with_state(|state| {
            if let Some(client) = state.clients.get_mut(&id) {
                client.alive = false;
            }
        });
        self.core.set_state(MountState::Dead);
        Ok(())
    }

    async fn kill_cleanup(&mut self) -> Result<()> {
        let id = self.core.client_id().to_string();
        self.cluster.with_state(|state| {
            if let Some(client) = state.clients.get_mut(&id) {
                client.mounted = false;
                client.alive = false;
                client.session = None;
            }
        });
        self.core.set_state(MountState::Unmounted);
        Ok(())
    }

    async fn is_mounted(&self) -> Result<bool> {
        let id = self.core.client_id();
        Ok(self.cluster.with_state(|state| state.is_mounted(id)))
    }

    async fn session_id(&self) -> Result<u64> {
        let id = self.core.client_id();
        self.cluster
            .with_state(|state| state.clients.get(id).and_then(|c| c.session))
            .ok_or_else(|| HarnessError::NotMounted(id.to_string()))
    }

    async fn create_files(&self) -> Result<()> {
        self.ensure_mounted().await?;
        self.cluster.with_state(|state| {
            for name in TEST_FILES {
                state.files.insert(name.to_string(), String::new());
            }
        });
        Ok(())
    }

    async fn check_files(&self) -> Result<()> {
        self.ensure_mounted().await?;
        let missing = self.cluster.with_state(|state| {
            TEST_FILES
                .iter()
                .find(|name| !state.files.contains_key(**name))
                .copied()
        });
        match missing {
            Some(name) => Err(HarnessError::MissingFile(self.core.path(name))),
            None => Ok(()),
        }
    }

    async fn create_destroy(&self) -> Result<()> {
        self.ensure_mounted().await
    }

    async fn open_background(&mut self, name: &str) -> Result<Arc<BackgroundProcess>> {
        self.ensure_mounted().await?;
        // opening for write truncates whatever an earlier scenario left behind
        self.cluster.with_state(|state| state.files.remove(name));
        let (writer, reader) = tokio::io::duplex(16);
        let waiter = hold(
            self.cluster.clone(),
            self.core.client_id().to_string(),
            self.generation(),
            name.to_string(),
            reader,
        );
        let process = self.start("hold", Some(Box::pin(writer)), waiter);
        let path = self.core.path(name);
        Ok(self.core.track(HoldKind::Hold, path, process))
    }

    async fn write_background(&mut self, name: &str) -> Result<Arc<BackgroundProcess>> {
        self.ensure_mounted().await?;
        let waiter = write_file(
            self.cluster.clone(),
            self.core.client_id().to_string(),
            self.generation(),
            name.to_string(),
        );
        let process = self.start("write", None, waiter);
        let path = self.core.path(name);
        Ok(self.core.track(HoldKind::Write, path, process))
    }

    async fn wait_for_content(&self, name: &str) -> Result<()> {
        let polling = self.core.polling();
        for _ in 0..polling.attempts {
            let written = self
                .cluster
                .with_state(|state| state.files.get(name).is_some_and(|c| !c.is_empty()));
            if written {
                return Ok(());
            }
            tokio::time::sleep(polling.interval).await;
        }
        Err(HarnessError::Timeout {
            what: format!("content in {name}"),
            waited: polling.interval * polling.attempts,
        })
    }
}
