#![allow(dead_code)]

pub mod sim;

use harness::scenario::ScenarioContext;
use harness::session::SessionQueryClient;

pub use sim::SimCluster;

pub const HOST_A: &str = "client-host-a";
pub const HOST_B: &str = "client-host-b";

pub fn service(cluster: &SimCluster) -> SessionQueryClient {
    SessionQueryClient::new(cluster.admin())
        .with_poll_interval(std::time::Duration::from_millis(500))
}

/// Clients 0 and 1 on their own hosts, neither shared with the service.
pub async fn context(cluster: &SimCluster) -> ScenarioContext {
    ScenarioContext::new(
        service(cluster),
        Box::new(cluster.mount("0", HOST_A)),
        Box::new(cluster.mount("1", HOST_B)),
    )
    .await
    .unwrap()
}
