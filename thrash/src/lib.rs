//! Pool snapshot churn that runs next to the recovery scenarios.
//!
//! A [`SnapThrasher`] keeps the number of live snapshots between `min_snaps` and `max_snaps`,
//! adding or removing one snapshot on every pool per tick. [`spawn`] drives it from a tokio
//! task until [`ThrashHandle::stop`] is called.

use rand::Rng;
use rand::SeedableRng;

#[derive(Debug, thiserror::Error)]
pub enum ThrashError {
    #[error("invalid thrash configuration: {0}")]
    Config(String),
    #[error("pool snapshot admin failed: {0}")]
    Admin(String),
}

impl From<remote::RemoteError> for ThrashError {
    fn from(error: remote::RemoteError) -> Self {
        ThrashError::Admin(error.to_string())
    }
}

fn default_max_snaps() -> usize {
    10
}

fn default_min_snaps() -> usize {
    5
}

fn default_period() -> u64 {
    30
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct ThrashConfig {
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default = "default_max_snaps")]
    pub max_snaps: usize,
    #[serde(default = "default_min_snaps")]
    pub min_snaps: usize,
    /// Seconds between ticks
    #[serde(default = "default_period")]
    pub period: u64,
}

impl Default for ThrashConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            max_snaps: default_max_snaps(),
            min_snaps: default_min_snaps(),
            period: default_period(),
        }
    }
}

impl ThrashConfig {
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.period)
    }

    pub fn validate(&self) -> Result<(), ThrashError> {
        if self.min_snaps >= self.max_snaps {
            return Err(ThrashError::Config(format!(
                "min_snaps ({}) must be below max_snaps ({})",
                self.min_snaps, self.max_snaps
            )));
        }
        if self.period == 0 {
            return Err(ThrashError::Config("period must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Creates and removes snapshots of a storage pool.
#[async_trait::async_trait]
pub trait PoolSnapshotAdmin: Send + Sync {
    async fn add_pool_snap(&self, pool: &str, snap: &str) -> Result<(), ThrashError>;
    async fn remove_pool_snap(&self, pool: &str, snap: &str) -> Result<(), ThrashError>;
}

/// Runs `ceph osd pool mksnap|rmsnap` on an admin host.
#[derive(Debug)]
pub struct RemotePoolAdmin {
    executor: std::sync::Arc<dyn remote::Executor>,
    sudo: bool,
}

impl RemotePoolAdmin {
    pub fn new(executor: std::sync::Arc<dyn remote::Executor>) -> Self {
        Self {
            executor,
            sudo: true,
        }
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    async fn pool_command(&self, verb: &str, pool: &str, snap: &str) -> Result<(), ThrashError> {
        let mut args = Vec::with_capacity(7);
        if self.sudo {
            args.push("sudo");
        }
        args.extend_from_slice(&["ceph", "osd", "pool", verb, pool, snap]);
        self.executor.run(&args, true).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PoolSnapshotAdmin for RemotePoolAdmin {
    async fn add_pool_snap(&self, pool: &str, snap: &str) -> Result<(), ThrashError> {
        self.pool_command("mksnap", pool, snap).await
    }

    async fn remove_pool_snap(&self, pool: &str, snap: &str) -> Result<(), ThrashError> {
        self.pool_command("rmsnap", pool, snap).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    Added(u64),
    Removed(u64),
}

pub struct SnapThrasher<R = rand::rngs::StdRng> {
    config: ThrashConfig,
    snaps: Vec<u64>,
    index: u64,
    rng: R,
}

impl SnapThrasher<rand::rngs::StdRng> {
    pub fn new(config: ThrashConfig) -> Result<Self, ThrashError> {
        Self::with_rng(config, rand::rngs::StdRng::from_entropy())
    }
}

impl<R: Rng + Send> SnapThrasher<R> {
    pub fn with_rng(config: ThrashConfig, rng: R) -> Result<Self, ThrashError> {
        config.validate()?;
        Ok(Self {
            config,
            snaps: Vec::new(),
            index: 0,
            rng,
        })
    }

    pub fn config(&self) -> &ThrashConfig {
        &self.config
    }

    /// Snapshot ids currently present on every pool.
    pub fn live_snaps(&self) -> &[u64] {
        &self.snaps
    }

    /// Adds or removes one snapshot on every pool.
    ///
    /// A snapshot that failed on some pool is not recorded as live (on add) or stays live (on
    /// remove), so a later tick may retry it.
    pub async fn tick(&mut self, admin: &dyn PoolSnapshotAdmin) -> Result<TickAction, ThrashError> {
        self.index += 1;
        let len = self.snaps.len();
        let add = if len <= self.config.min_snaps {
            true
        } else if len >= self.config.max_snaps {
            false
        } else {
            self.rng.gen_bool(0.5)
        };
        if add {
            let snap = self.index;
            let name = snap.to_string();
            for pool in &self.config.pools {
                tracing::info!("Adding snap {} to pool {}", name, pool);
                admin.add_pool_snap(pool, &name).await?;
            }
            self.snaps.push(snap);
            Ok(TickAction::Added(snap))
        } else {
            let position = self.rng.gen_range(0..len);
            let snap = self.snaps[position];
            let name = snap.to_string();
            for pool in &self.config.pools {
                tracing::info!("Removing snap {} from pool {}", name, pool);
                admin.remove_pool_snap(pool, &name).await?;
            }
            self.snaps.remove(position);
            Ok(TickAction::Removed(snap))
        }
    }
}

/// Running churn loop, see [`spawn`].
pub struct ThrashHandle<R> {
    cancel: tokio_util::sync::CancellationToken,
    join: tokio::task::JoinHandle<SnapThrasher<R>>,
}

impl<R> ThrashHandle<R> {
    /// Cancels the loop and waits for it. A tick already in progress completes first.
    pub async fn stop(self) -> Result<SnapThrasher<R>, ThrashError> {
        self.cancel.cancel();
        self.join
            .await
            .map_err(|error| ThrashError::Admin(format!("thrash task failed: {error}")))
    }
}

/// Starts ticking `thrasher` every `period` on a background task.
pub fn spawn<R>(
    mut thrasher: SnapThrasher<R>,
    admin: std::sync::Arc<dyn PoolSnapshotAdmin>,
) -> ThrashHandle<R>
where
    R: Rng + Send + 'static,
{
    let cancel = tokio_util::sync::CancellationToken::new();
    let token = cancel.clone();
    let period = thrasher.config.period();
    let join = tokio::spawn(async move {
        tracing::info!("pool snapshot thrasher started, period {:?}", period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            if let Err(error) = thrasher.tick(admin.as_ref()).await {
                tracing::error!("pool snapshot tick failed: {:#}", error);
            }
        }
        tracing::info!("Stopping");
        thrasher
    });
    ThrashHandle { cancel, join }
}
