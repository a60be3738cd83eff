use super::{MountCore, MountState, RemoteMount};
use crate::{HarnessError, Result};

/// Filesystem type `stat -f` reports for a FUSE mount.
const FUSE_FSTYPE: &str = "fuseblk";

/// How long a forced unmount waits for the daemon before killing it.
const FORCE_UMOUNT_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// User-space client: the mount is served by a `ceph-fuse` daemon the harness keeps running.
#[derive(Debug)]
pub struct FuseMount {
    core: MountCore,
    daemon: Option<remote::RemoteProcess>,
    extra_args: Vec<String>,
    cluster: String,
}

impl FuseMount {
    pub fn new(core: MountCore) -> Self {
        Self {
            core,
            daemon: None,
            extra_args: Vec::new(),
            cluster: "ceph".to_string(),
        }
    }

    /// Extra arguments passed to `ceph-fuse`.
    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    fn client_name(&self) -> String {
        format!("client.{}", self.core.client_id())
    }

    fn admin_socket(&self) -> String {
        format!("/var/run/ceph/{}-{}.asok", self.cluster, self.client_name())
    }

    /// Command line of the `ceph-fuse` daemon serving this mount.
    fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            "ceph-fuse".to_string(),
            "-f".to_string(),
            "--name".to_string(),
            self.client_name(),
            self.core.mountpoint().to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// `pkill -f` pattern matching this client's daemon and no other client's.
    fn kill_pattern(&self) -> String {
        format!("ceph-fuse.*--name {}( |$)", self.client_name())
    }

    async fn kill_daemon(&self) -> Result<()> {
        let pattern = self.kill_pattern();
        let output = self.core.run_unchecked(&["pkill", "-9", "-f", &pattern]).await?;
        if output.status == Some(1) {
            tracing::warn!("no ceph-fuse process matched {:?}", pattern);
        }
        Ok(())
    }

    async fn reap_daemon(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.close_stdin().await;
            match daemon.wait().await {
                Ok(_) => tracing::debug!("{} daemon exited", self.client_name()),
                Err(error) => tracing::info!("{} daemon: {}", self.client_name(), error),
            }
        }
    }

    async fn remove_mountpoint(&self) -> Result<()> {
        let mountpoint = self.core.mountpoint().to_string();
        let output = self.core.run_unchecked(&["rmdir", "--", &mountpoint]).await?;
        if !output.success() {
            tracing::debug!("rmdir {}: {}", mountpoint, output.stderr.trim());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteMount for FuseMount {
    fn core(&self) -> &MountCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MountCore {
        &mut self.core
    }

    fn technology(&self) -> &'static str {
        "fuse"
    }

    async fn mount(&mut self) -> Result<()> {
        self.core.expect_state("mount", &[MountState::Unmounted])?;
        let mountpoint = self.core.mountpoint().to_string();
        tracing::info!(
            "mounting {} at {} on {}",
            self.client_name(),
            mountpoint,
            self.core.hostname()
        );
        self.core.run(&["mkdir", "-p", "--", &mountpoint]).await?;
        let args = self.daemon_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.daemon = Some(self.core.spawn(&args).await?);
        self.core.set_state(MountState::Mounting);
        Ok(())
    }

    async fn umount_wait(&mut self, force: bool) -> Result<()> {
        let mountpoint = self.core.mountpoint().to_string();
        tracing::info!("unmounting {} (force: {})", mountpoint, force);
        if force {
            match self
                .core
                .run_unchecked(&["fusermount", "-u", "-z", &mountpoint])
                .await
            {
                Ok(output) if !output.success() => {
                    tracing::info!("fusermount on {}: {}", mountpoint, output.stderr.trim())
                }
                Ok(_) => {}
                Err(error) => tracing::info!("fusermount on {}: {}", mountpoint, error),
            }
            let exited = match &self.daemon {
                Some(daemon) => {
                    tokio::time::timeout(FORCE_UMOUNT_GRACE, daemon.wait_output())
                        .await
                        .is_ok()
                }
                None => true,
            };
            if !exited {
                tracing::info!("{} did not exit after unmount, killing it", self.client_name());
                if let Err(error) = self.kill_daemon().await {
                    tracing::info!("killing {}: {}", self.client_name(), error);
                }
            }
            self.reap_daemon().await;
            if let Err(error) = self.remove_mountpoint().await {
                tracing::info!("removing {}: {}", mountpoint, error);
            }
            self.core.set_state(MountState::Unmounted);
            return Ok(());
        }
        self.core
            .expect_state("unmount", &[MountState::Mounted, MountState::Mounting])?;
        self.core.run(&["fusermount", "-u", &mountpoint]).await?;
        if let Some(daemon) = self.daemon.take() {
            daemon.close_stdin().await;
            daemon.wait().await?;
        }
        self.remove_mountpoint().await?;
        self.core.set_state(MountState::Unmounted);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.core
            .expect_state("kill", &[MountState::Mounted, MountState::Mounting])?;
        tracing::info!("killing {}", self.client_name());
        self.kill_daemon().await?;
        self.core.set_state(MountState::Dead);
        Ok(())
    }

    async fn kill_cleanup(&mut self) -> Result<()> {
        let mountpoint = self.core.mountpoint().to_string();
        tracing::info!("cleaning up killed {}", self.client_name());
        let output = self
            .core
            .run_unchecked(&["fusermount", "-u", "-z", &mountpoint])
            .await?;
        if !output.success() {
            tracing::debug!("fusermount on {}: {}", mountpoint, output.stderr.trim());
        }
        self.reap_daemon().await;
        self.remove_mountpoint().await?;
        self.core.set_state(MountState::Unmounted);
        Ok(())
    }

    async fn is_mounted(&self) -> Result<bool> {
        let mountpoint = self.core.mountpoint().to_string();
        let output = self
            .core
            .run_unchecked(&["stat", "--file-system", "--printf=%T\n", "--", &mountpoint])
            .await?;
        Ok(output.success() && output.stdout.trim() == FUSE_FSTYPE)
    }

    async fn session_id(&self) -> Result<u64> {
        let socket = self.admin_socket();
        let output = self
            .core
            .run(&["ceph", "--admin-daemon", &socket, "mds_sessions"])
            .await?;
        parse_mds_sessions(&output.stdout).map_err(|message| HarnessError::AdminOutput {
            command: format!("{socket} mds_sessions"),
            message,
        })
    }
}

/// Session id from the client's `mds_sessions` admin socket reply.
fn parse_mds_sessions(stdout: &str) -> std::result::Result<u64, String> {
    let value: serde_json::Value =
        serde_json::from_str(stdout).map_err(|error| error.to_string())?;
    value
        .get("id")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| "no numeric id".to_string())
}
