use super::{MountCore, MountState, RemoteMount};
use crate::{HarnessError, Result};

const CEPH_FSTYPE: &str = "ceph";
const DEBUGFS_DIR: &str = "/sys/kernel/debug/ceph";

/// In-kernel client. It cannot be killed without taking the host down, so scenarios that kill
/// a client refuse to run with it.
#[derive(Debug)]
pub struct KernelMount {
    core: MountCore,
    monitors: String,
    options: Vec<String>,
}

impl KernelMount {
    /// `monitors` is the comma separated monitor address list, e.g. `10.0.0.1:6789`.
    pub fn new(core: MountCore, monitors: &str) -> Self {
        Self {
            core,
            monitors: monitors.to_string(),
            options: Vec::new(),
        }
    }

    /// Extra `-o` options, appended after `name=<id>`.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    fn mount_options(&self) -> String {
        std::iter::once(format!("name={}", self.core.client_id()))
            .chain(self.options.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
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

/// Picks the global client id out of debugfs entries named `<fsid>.client<id>`.
fn parse_debugfs_client(listing: &str) -> Option<u64> {
    listing
        .split_whitespace()
        .filter_map(|entry| entry.rsplit_once(".client"))
        .find_map(|(_, id)| id.parse().ok())
}

#[async_trait::async_trait]
impl RemoteMount for KernelMount {
    fn core(&self) -> &MountCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MountCore {
        &mut self.core
    }

    fn technology(&self) -> &'static str {
        "kernel"
    }

    fn supports_kill(&self) -> bool {
        false
    }

    async fn mount(&mut self) -> Result<()> {
        self.core.expect_state("mount", &[MountState::Unmounted])?;
        let mountpoint = self.core.mountpoint().to_string();
        let source = format!("{}:/", self.monitors);
        let options = self.mount_options();
        tracing::info!("mounting {} at {} on {}", source, mountpoint, self.core.hostname());
        self.core.run(&["mkdir", "-p", "--", &mountpoint]).await?;
        self.core
            .run(&["mount", "-t", CEPH_FSTYPE, &source, &mountpoint, "-o", &options])
            .await?;
        self.core.set_state(MountState::Mounting);
        Ok(())
    }

    async fn umount_wait(&mut self, force: bool) -> Result<()> {
        let mountpoint = self.core.mountpoint().to_string();
        tracing::info!("unmounting {} (force: {})", mountpoint, force);
        if force {
            match self.core.run_unchecked(&["umount", "-f", &mountpoint]).await {
                Ok(output) if !output.success() => {
                    tracing::info!("umount -f {}: {}", mountpoint, output.stderr.trim())
                }
                Ok(_) => {}
                Err(error) => tracing::info!("umount -f {}: {}", mountpoint, error),
            }
            if let Err(error) = self.remove_mountpoint().await {
                tracing::info!("removing {}: {}", mountpoint, error);
            }
        } else {
            self.core
                .expect_state("unmount", &[MountState::Mounted, MountState::Mounting])?;
            self.core.run(&["umount", &mountpoint]).await?;
            self.remove_mountpoint().await?;
        }
        self.core.set_state(MountState::Unmounted);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        Err(HarnessError::Unsupported {
            technology: self.technology(),
            operation: "kill",
        })
    }

    async fn kill_cleanup(&mut self) -> Result<()> {
        let mountpoint = self.core.mountpoint().to_string();
        let output = self
            .core
            .run_unchecked(&["umount", "-f", "-l", &mountpoint])
            .await?;
        if !output.success() {
            tracing::debug!("umount -f -l {}: {}", mountpoint, output.stderr.trim());
        }
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
        Ok(output.success() && output.stdout.trim() == CEPH_FSTYPE)
    }

    async fn session_id(&self) -> Result<u64> {
        // one kernel mount per host is assumed
        let output = self.core.run(&["ls", DEBUGFS_DIR]).await?;
        parse_debugfs_client(&output.stdout).ok_or_else(|| HarnessError::AdminOutput {
            command: format!("ls {DEBUGFS_DIR}"),
            message: format!("no client entry in {:?}", output.stdout.trim()),
        })
    }
}
