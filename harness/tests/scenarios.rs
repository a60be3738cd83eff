//! Every recovery scenario against the simulated cluster.
//!
//! The tokio clock is paused, so session and reconnect timeouts of a minute pass instantly
//! while the scenarios still measure them exactly as they would on a real cluster.

mod support;

use harness::HarnessError;
use harness::mount::MountState;
use harness::scenario::{Scenario, ScenarioContext};
use harness::session::SessionState;
use support::{SimCluster, sim};

async fn run(ctx: &mut ScenarioContext, scenario: Scenario) -> harness::Result<()> {
    ctx.setup().await?;
    let result = scenario.run(ctx).await;
    ctx.teardown().await?;
    result
}

async fn passes(scenario: Scenario) -> (SimCluster, ScenarioContext) {
    let cluster = SimCluster::new();
    let mut ctx = support::context(&cluster).await;
    run(&mut ctx, scenario).await.unwrap();
    (cluster, ctx)
}

#[tokio::test(start_paused = true)]
async fn context_reads_service_timeouts() {
    let cluster = SimCluster::new();
    let ctx = support::context(&cluster).await;
    assert_eq!(ctx.timeouts.session, sim::SESSION_TIMEOUT);
    assert_eq!(ctx.timeouts.reconnect, sim::RECONNECT_TIMEOUT);
    assert_eq!(ctx.timeouts.max_backoff, sim::MAX_BACKOFF);
}

#[tokio::test(start_paused = true)]
async fn setup_restarts_and_mounts_both_clients() {
    let cluster = SimCluster::new();
    let mut ctx = support::context(&cluster).await;
    ctx.setup().await.unwrap();
    assert_eq!(cluster.restarts(), 1);
    assert_eq!(ctx.mount_a.state(), MountState::Mounted);
    assert_eq!(ctx.mount_b.state(), MountState::Mounted);
    let sessions = ctx.assert_active_session_count(2).await.unwrap();
    for session in sessions {
        assert_eq!(session.state, SessionState::Open);
        assert!(!session.reconnecting);
    }
    // already mounted clients are left alone by the next setup
    let id_a = ctx.mount_a.session_id().await.unwrap();
    ctx.setup().await.unwrap();
    assert_eq!(ctx.mount_a.session_id().await.unwrap(), id_a);
}

#[tokio::test(start_paused = true)]
async fn basic_passes() {
    passes(Scenario::Basic).await;
}

#[tokio::test(start_paused = true)]
async fn restart_passes() {
    let (cluster, _) = passes(Scenario::Restart).await;
    assert_eq!(cluster.restarts(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_timeout_passes() {
    let (cluster, ctx) = passes(Scenario::ReconnectTimeout).await;
    assert!(cluster.evicted().is_empty());
    ctx.assert_active_session_count(2).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_eviction_passes() {
    let (cluster, _) = passes(Scenario::ReconnectEviction).await;
    assert_eq!(cluster.evicted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_caps_passes() {
    let (_, ctx) = passes(Scenario::StaleCaps).await;
    assert_eq!(ctx.mount_a.state(), MountState::Mounted);
    assert!(ctx.mount_a.core().background().is_empty());
}

#[tokio::test(start_paused = true)]
async fn evicted_caps_passes() {
    let (cluster, _) = passes(Scenario::EvictedCaps).await;
    assert_eq!(cluster.evicted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn network_death_passes() {
    let (cluster, ctx) = passes(Scenario::NetworkDeath).await;
    assert!(!cluster.blocked());
    assert_eq!(ctx.mount_b.state(), MountState::Unmounted);
}

#[tokio::test(start_paused = true)]
async fn slow_handover_fails_stale_caps() {
    let cluster = SimCluster::new();
    cluster.set_stale_factor(3.0);
    let mut ctx = support::context(&cluster).await;
    match run(&mut ctx, Scenario::StaleCaps).await {
        Err(HarnessError::Assertion(message)) => {
            assert!(message.contains("capability handover took 3m"), "{message}")
        }
        other => panic!("expected assertion failure, got {other:?}"),
    }
    // the holder's killed process was reaped by teardown
    assert!(ctx.mount_a.core().background().is_empty());
    assert_eq!(ctx.mount_a.state(), MountState::Dead);
}

async fn assertion_fails(cluster: &SimCluster, scenario: Scenario) -> String {
    let mut ctx = support::context(cluster).await;
    match run(&mut ctx, scenario).await {
        Err(HarnessError::Assertion(message)) => message,
        other => panic!("expected {scenario} to fail an assertion, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn early_write_fails_evicted_caps() {
    let cluster = SimCluster::new();
    cluster.set_caps_enforced(false);
    let message = assertion_fails(&cluster, Scenario::EvictedCaps).await;
    assert!(
        message.contains("client.1 wrote while client.0 still held the capability"),
        "{message}"
    );
    assert!(cluster.evicted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn eviction_without_shortcut_fails_reconnect_eviction() {
    let cluster = SimCluster::new();
    cluster.set_full_reconnect_window(true);
    let message = assertion_fails(&cluster, Scenario::ReconnectEviction).await;
    assert!(message.contains("after eviction"), "{message}");
    assert_eq!(cluster.evicted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn short_reconnect_window_fails_reconnect_timeout() {
    let cluster = SimCluster::new();
    cluster.set_reconnect_factor(0.2);
    let message = assertion_fails(&cluster, Scenario::ReconnectTimeout).await;
    assert!(
        message.contains("should have been in reconnect phase for 45s"),
        "{message}"
    );
}

#[tokio::test(start_paused = true)]
async fn session_that_never_goes_stale_fails_network_death() {
    let cluster = SimCluster::new();
    cluster.set_stale_factor(3.0);
    let message = assertion_fails(&cluster, Scenario::NetworkDeath).await;
    assert!(message.contains("expected stale, found Some(Open)"), "{message}");
    // teardown lifted the partition even though the scenario stopped early
    assert!(!cluster.blocked());
}

#[tokio::test(start_paused = true)]
async fn slow_recovery_fails_network_death() {
    let cluster = SimCluster::new();
    cluster.set_recovery_delay(std::time::Duration::from_secs(40));
    let message = assertion_fails(&cluster, Scenario::NetworkDeath).await;
    assert!(message.contains("recovery took 40s"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn every_scenario_in_sequence() {
    let cluster = SimCluster::new();
    let mut ctx = support::context(&cluster).await;
    for scenario in Scenario::all() {
        run(&mut ctx, scenario)
            .await
            .unwrap_or_else(|error| panic!("{scenario}: {error}"));
    }
    assert_eq!(cluster.restarts(), 7 + 3);
}

#[tokio::test(start_paused = true)]
async fn mount_a_on_service_host_is_rejected() {
    let cluster = SimCluster::new();
    let result = ScenarioContext::new(
        support::service(&cluster),
        Box::new(cluster.mount("0", sim::SERVICE_HOST)),
        Box::new(cluster.mount("1", support::HOST_B)),
    )
    .await;
    match result {
        Err(HarnessError::Precondition(message)) => {
            assert!(message.contains(sim::SERVICE_HOST), "{message}")
        }
        other => panic!("expected precondition failure, got {other:?}"),
    }
}
