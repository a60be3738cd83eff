//! Recovery scenarios.
//!
//! Every scenario runs against a freshly restarted service with both clients mounted (see
//! [`ScenarioContext::setup`]) and checks one part of the session recovery protocol. Timing
//! expectations are relative to the timeouts the service reports, through [`crate::timing`].

use std::collections::BTreeSet;

use strum::IntoEnumIterator;
use tracing::instrument;

use crate::mount::{DEFAULT_BACKGROUND_FILE, MountState, RemoteMount};
use crate::service::{STATE_ACTIVE, STATE_RECONNECT};
use crate::session::{ServiceTimeouts, SessionQueryClient, SessionRecord, SessionState};
use crate::timing::{self, FAST_PATH_FRACTION, STALE_HANDOVER};
use crate::{HarnessError, Result};

/// How long the service gets to come back after a restart.
pub const RESTART_GRACE: std::time::Duration = std::time::Duration::from_secs(60);

/// A killed client's capability must still be held this long after the kill.
const HOLD_CHECK_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Partition length in session timeouts, long enough for the session to go stale.
const PARTITION_FACTOR: f64 = 1.5;

/// Recovery after the partition heals, in units of the messenger's max backoff.
const RECOVERY_BACKOFF_FACTOR: f64 = 2.0;

/// Upper bound on the reconnect phase, in reconnect timeouts.
const RECONNECT_WAIT_FACTOR: f64 = 2.0;

/// Lower bound on the reconnect phase, in reconnect timeouts.
const RECONNECT_MIN_FRACTION: f64 = 0.5;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Scenario {
    Basic,
    Restart,
    ReconnectTimeout,
    ReconnectEviction,
    StaleCaps,
    EvictedCaps,
    NetworkDeath,
}

impl Scenario {
    /// Every scenario, in the order a full run executes them.
    pub fn all() -> Vec<Scenario> {
        Scenario::iter().collect()
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    #[instrument(skip(ctx))]
    pub async fn run(self, ctx: &mut ScenarioContext) -> Result<()> {
        match self {
            Scenario::Basic => basic(ctx).await,
            Scenario::Restart => restart(ctx).await,
            Scenario::ReconnectTimeout => reconnect_timeout(ctx).await,
            Scenario::ReconnectEviction => reconnect_eviction(ctx).await,
            Scenario::StaleCaps => stale_caps(ctx).await,
            Scenario::EvictedCaps => evicted_caps(ctx).await,
            Scenario::NetworkDeath => network_death(ctx).await,
        }
    }
}

/// Everything a scenario touches: the service and the two client mounts.
pub struct ScenarioContext {
    pub service: SessionQueryClient,
    pub mount_a: Box<dyn RemoteMount>,
    pub mount_b: Box<dyn RemoteMount>,
    pub timeouts: ServiceTimeouts,
    pub restart_grace: std::time::Duration,
}

impl std::fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("mount_a", &self.mount_a.core())
            .field("mount_b", &self.mount_b.core())
            .field("timeouts", &self.timeouts)
            .field("restart_grace", &self.restart_grace)
            .finish()
    }
}

impl ScenarioContext {
    /// Checks the mounts can run every scenario and reads the service timeouts.
    pub async fn new(
        service: SessionQueryClient,
        mount_a: Box<dyn RemoteMount>,
        mount_b: Box<dyn RemoteMount>,
    ) -> Result<Self> {
        for mount in [&mount_a, &mount_b] {
            if !mount.supports_kill() {
                return Err(HarnessError::Precondition(format!(
                    "client.{} is a {} mount, which cannot be killed",
                    mount.client_id(),
                    mount.technology()
                )));
            }
        }
        let daemon_hosts = service.daemon_hostnames().await?;
        let host_a = mount_a.core().hostname();
        if daemon_hosts.iter().any(|host| host == host_a) {
            return Err(HarnessError::Precondition(format!(
                "client.{} runs on service host {}; blocking its network would cut off the service",
                mount_a.client_id(),
                host_a
            )));
        }
        let timeouts = service.fetch_timeouts().await?;
        Ok(Self {
            service,
            mount_a,
            mount_b,
            timeouts,
            restart_grace: RESTART_GRACE,
        })
    }

    pub fn with_restart_grace(mut self, restart_grace: std::time::Duration) -> Self {
        self.restart_grace = restart_grace;
        self
    }

    /// Restarts the service and brings both clients to [`MountState::Mounted`].
    #[instrument(skip(self))]
    pub async fn setup(&mut self) -> Result<()> {
        self.service.clear_firewall().await?;
        self.service.restart().await?;
        for mount in [&mut self.mount_a, &mut self.mount_b] {
            match mount.state() {
                MountState::Mounted | MountState::Mounting => {}
                MountState::Dead => {
                    mount.kill_cleanup().await?;
                    mount.mount().await?;
                }
                MountState::Unmounted => mount.mount().await?,
            }
        }
        self.mount_a.wait_until_mounted().await?;
        self.mount_b.wait_until_mounted().await?;
        Ok(())
    }

    /// Lifts any network block and reaps background processes on both clients.
    ///
    /// Every step runs even when an earlier one failed; the first error is returned.
    #[instrument(skip(self))]
    pub async fn teardown(&mut self) -> Result<()> {
        let mut results = vec![self.service.clear_firewall().await];
        results.push(self.mount_a.teardown().await);
        results.push(self.mount_b.teardown().await);
        results.into_iter().collect()
    }

    /// Exactly `expected` sessions, counting stale and closed ones.
    pub async fn assert_session_count(&self, expected: usize) -> Result<Vec<SessionRecord>> {
        let sessions = self.service.list_sessions().await?;
        check!(
            sessions.len() == expected,
            "expected {expected} sessions, found {}: {sessions:?}",
            sessions.len()
        );
        Ok(sessions)
    }

    /// Exactly `expected` sessions that are neither stale nor closed.
    pub async fn assert_active_session_count(
        &self,
        expected: usize,
    ) -> Result<Vec<SessionRecord>> {
        let sessions = self.service.active_sessions().await?;
        check!(
            sessions.len() == expected,
            "expected {expected} active sessions, found {}: {sessions:?}",
            sessions.len()
        );
        Ok(sessions)
    }

    pub async fn assert_session_state(&self, id: u64, expected: SessionState) -> Result<()> {
        let state = self.service.session_state(id).await?;
        check!(
            state == Some(expected),
            "session {id} expected {expected}, found {state:?}"
        );
        Ok(())
    }

    async fn stop_and_fail(&self) -> Result<()> {
        self.service.stop().await?;
        self.service.fail_out().await
    }

    async fn remount_a(&mut self) -> Result<()> {
        self.mount_a.mount().await?;
        self.mount_a.wait_until_mounted().await
    }
}

/// Smoke I/O across both clients, and the service sees exactly their two sessions.
async fn basic(ctx: &mut ScenarioContext) -> Result<()> {
    ctx.mount_a.create_files().await?;
    ctx.mount_a.check_files().await?;
    ctx.mount_a.umount_wait(false).await?;
    ctx.mount_b.check_files().await?;
    ctx.remount_a().await?;
    let sessions = ctx.assert_active_session_count(2).await?;
    let observed: BTreeSet<u64> = sessions.iter().map(|session| session.id).collect();
    let expected: BTreeSet<u64> = [
        ctx.mount_a.session_id().await?,
        ctx.mount_b.session_id().await?,
    ]
    .into();
    check!(
        observed == expected,
        "session ids {observed:?} do not match the mounted clients {expected:?}"
    );
    Ok(())
}

/// A failed-over service comes back and both clients can do I/O again.
async fn restart(ctx: &mut ScenarioContext) -> Result<()> {
    ctx.stop_and_fail().await?;
    ctx.service.restart().await?;
    ctx.service
        .wait_for_state(STATE_ACTIVE, ctx.restart_grace, None)
        .await?;
    ctx.mount_a.create_destroy().await?;
    ctx.mount_b.create_destroy().await?;
    Ok(())
}

/// Brings the service back while client A is gone and checks A is flagged as reconnecting.
async fn enter_reconnect_without_a(ctx: &mut ScenarioContext) -> Result<u64> {
    ctx.stop_and_fail().await?;
    // the client's own admin interface is gone once it is unmounted
    let id_a = ctx.mount_a.session_id().await?;
    ctx.mount_a.umount_wait(true).await?;
    ctx.service.restart().await?;
    ctx.service
        .wait_for_state(STATE_RECONNECT, ctx.restart_grace, Some(STATE_ACTIVE))
        .await?;
    let sessions = ctx.assert_session_count(2).await?;
    let record = sessions
        .iter()
        .find(|session| session.id == id_a)
        .ok_or_else(|| {
            HarnessError::Assertion(format!("no session for client {id_a}: {sessions:?}"))
        })?;
    check!(
        record.reconnecting,
        "session {id_a} of the unmounted client is not reconnecting: {record:?}"
    );
    Ok(id_a)
}

/// A client that never reconnects is dropped once the reconnect window closes, not sooner.
async fn reconnect_timeout(ctx: &mut ScenarioContext) -> Result<()> {
    enter_reconnect_without_a(ctx).await?;
    let reconnect = ctx.timeouts.reconnect;
    let in_reconnect_for = ctx
        .service
        .wait_for_state(STATE_ACTIVE, reconnect.mul_f64(RECONNECT_WAIT_FACTOR), None)
        .await?;
    check!(
        timing::over_fraction(in_reconnect_for, reconnect, RECONNECT_MIN_FRACTION),
        "should have been in reconnect phase for {} but only took {}",
        timing::format(reconnect),
        timing::format(in_reconnect_for)
    );
    ctx.assert_session_count(1).await?;
    ctx.remount_a().await?;
    ctx.mount_a.create_destroy().await?;
    ctx.assert_session_count(2).await?;
    Ok(())
}

/// Evicting the missing client ends the reconnect phase early.
async fn reconnect_eviction(ctx: &mut ScenarioContext) -> Result<()> {
    let id_a = enter_reconnect_without_a(ctx).await?;
    ctx.service.evict(id_a).await?;
    ctx.assert_session_count(1).await?;
    let reconnect = ctx.timeouts.reconnect;
    let evict_til_active = ctx
        .service
        .wait_for_state(STATE_ACTIVE, ctx.restart_grace, None)
        .await?;
    check!(
        timing::under_fraction(evict_til_active, reconnect, FAST_PATH_FRACTION),
        "reconnect phase lasted {} after eviction, reconnect timeout is {}",
        timing::format(evict_til_active),
        timing::format(reconnect)
    );
    ctx.remount_a().await?;
    ctx.mount_a.create_destroy().await?;
    Ok(())
}

/// A dead client's capability is handed over once its session goes stale.
async fn stale_caps(ctx: &mut ScenarioContext) -> Result<()> {
    let cap_holder = ctx.mount_a.open_background(DEFAULT_BACKGROUND_FILE).await?;
    ctx.mount_a.wait_for_content(DEFAULT_BACKGROUND_FILE).await?;
    ctx.mount_a.kill().await?;

    let cap_waiter = ctx.mount_b.write_background(DEFAULT_BACKGROUND_FILE).await?;
    let started = tokio::time::Instant::now();
    cap_waiter.wait().await?;
    let cap_waited = started.elapsed();
    tracing::info!("cap_waiter waited {}", timing::format(cap_waited));

    let session = ctx.timeouts.session;
    let (low, high) = STALE_HANDOVER.bounds(session);
    check!(
        STALE_HANDOVER.contains(cap_waited, session),
        "capability handover took {}, expected between {} and {}",
        timing::format(cap_waited),
        timing::format(low),
        timing::format(high)
    );

    cap_holder.reap().await?;
    ctx.mount_a.kill_cleanup().await?;
    ctx.remount_a().await
}

/// Evicting a dead client hands its capability over without waiting for the session timeout.
async fn evicted_caps(ctx: &mut ScenarioContext) -> Result<()> {
    let cap_holder = ctx.mount_a.open_background(DEFAULT_BACKGROUND_FILE).await?;
    ctx.mount_a.wait_for_content(DEFAULT_BACKGROUND_FILE).await?;
    let id_a = ctx.mount_a.session_id().await?;
    ctx.mount_a.kill().await?;

    let cap_waiter = ctx.mount_b.write_background(DEFAULT_BACKGROUND_FILE).await?;
    tokio::time::sleep(HOLD_CHECK_DELAY).await;
    check!(
        !cap_waiter.finished(),
        "client.{} wrote while client.{} still held the capability",
        ctx.mount_b.client_id(),
        ctx.mount_a.client_id()
    );

    ctx.service.evict(id_a).await?;
    let started = tokio::time::Instant::now();
    cap_waiter.wait().await?;
    let cap_waited = started.elapsed();
    let session = ctx.timeouts.session;
    check!(
        timing::under_fraction(cap_waited, session, FAST_PATH_FRACTION),
        "capability handover took {} after eviction, session timeout is {}",
        timing::format(cap_waited),
        timing::format(session)
    );

    cap_holder.reap().await?;
    ctx.mount_a.kill_cleanup().await?;
    ctx.remount_a().await
}

/// A partitioned client goes stale, then reconnects within a few backoff periods once the
/// partition heals.
async fn network_death(ctx: &mut ScenarioContext) -> Result<()> {
    ctx.mount_b.umount_wait(false).await?;
    let id_a = ctx.mount_a.session_id().await?;
    let sessions = ctx.assert_active_session_count(1).await?;
    check!(
        sessions[0].id == id_a,
        "only session is {}, expected client {id_a}",
        sessions[0].id
    );
    ctx.assert_session_state(id_a, SessionState::Open).await?;
    ctx.mount_a.create_files().await?;

    ctx.service.set_network_block(true).await?;
    let write_blocked = ctx.mount_a.write_background(DEFAULT_BACKGROUND_FILE).await?;
    check!(
        !write_blocked.finished(),
        "write went through right after the network was blocked"
    );
    ctx.assert_session_state(id_a, SessionState::Open).await?;

    let session = ctx.timeouts.session;
    tokio::time::sleep(session.mul_f64(PARTITION_FACTOR)).await;
    check!(
        !write_blocked.finished(),
        "write went through while the network was blocked"
    );
    ctx.assert_session_state(id_a, SessionState::Stale).await?;

    ctx.service.set_network_block(false).await?;
    let started = tokio::time::Instant::now();
    write_blocked.wait().await?;
    let recovery_time = started.elapsed();
    tracing::info!("recovery time {}", timing::format(recovery_time));
    let max_backoff = ctx.timeouts.max_backoff;
    check!(
        timing::under_fraction(recovery_time, max_backoff, RECOVERY_BACKOFF_FACTOR),
        "recovery took {}, max backoff is {}",
        timing::format(recovery_time),
        timing::format(max_backoff)
    );
    ctx.assert_session_state(id_a, SessionState::Open).await
}
