//! Filesystem client mounts on remote hosts.
//!
//! [`RemoteMount`] is the lifecycle every client technology implements: mount, unmount, kill
//! and cleanup. The smoke I/O and background holds are default methods over the shared
//! [`MountCore`], so variants only provide the technology-specific lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{HarnessError, Result};

pub mod fuse;
pub mod kernel;

pub use fuse::FuseMount;
pub use kernel::KernelMount;

/// Files written by [`RemoteMount::create_files`] and verified by [`RemoteMount::check_files`].
pub const TEST_FILES: [&str; 3] = ["a", "b", "c"];

pub const DEFAULT_BACKGROUND_FILE: &str = "background_file";

// writes, flushes, writes again and then keeps the file open until stdin closes
const HOLD_SCRIPT: &str = r#"exec 3>"$1" || exit 1
printf 'content' >&3
printf 'content2' >&3
exec cat >/dev/null"#;

const WRITE_SCRIPT: &str = r#"printf 'content' >"$1""#;

// every level of `hold` keeps one more file open in this shell; a failed open fails the script
const HOLD_MANY_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" || exit 1
i=0
hold() {
    if [ "$i" -ge "$2" ]; then
        cat >/dev/null 3>&-
        return
    fi
    f="$1_$i"
    i=$((i + 1))
    { hold "$@"; } 3>"$f"
}
hold "$@""#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Dead,
}

/// How long [`RemoteMount::wait_until_mounted`] keeps checking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountPolling {
    pub attempts: u32,
    pub interval: std::time::Duration,
}

impl Default for MountPolling {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: std::time::Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HoldKind {
    Hold,
    Write,
    HoldMany,
}

/// A long-running remote command started against a mount.
///
/// Closing its stdin is the only way to ask it to finish. [`BackgroundProcess::reap`] does that
/// and collects the exit status exactly once.
#[derive(Debug)]
pub struct BackgroundProcess {
    kind: HoldKind,
    path: String,
    process: remote::RemoteProcess,
    reaped: AtomicBool,
}

impl BackgroundProcess {
    pub fn new(kind: HoldKind, path: String, process: remote::RemoteProcess) -> Self {
        Self {
            kind,
            path,
            process,
            reaped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> HoldKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn finished(&self) -> bool {
        self.process.finished()
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// Waits for the command to exit; non-zero exit is an error.
    pub async fn wait(&self) -> Result<remote::CommandOutput> {
        Ok(self.process.wait().await?)
    }

    pub async fn release(&self) {
        self.process.close_stdin().await;
    }

    /// Releases the hold and waits for the command to exit.
    ///
    /// A failed exit is expected when the client that ran the command was killed, so it is
    /// logged and dropped. Any other error is returned. Later calls are no-ops.
    pub async fn reap(&self) -> Result<()> {
        if self.reaped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.release().await;
        match self.process.wait().await {
            Ok(_) => Ok(()),
            Err(error) if error.is_command_failed() => {
                tracing::info!(
                    "background {} on {} exited with {:?}, expected after client kill",
                    self.kind,
                    self.path,
                    error.exit_status()
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// State shared by every mount variant.
#[derive(Debug)]
pub struct MountCore {
    client_id: String,
    remote: Arc<dyn remote::Executor>,
    mountpoint: String,
    state: MountState,
    polling: MountPolling,
    sudo: bool,
    background: Vec<Arc<BackgroundProcess>>,
}

impl MountCore {
    /// The mount lives at `<test_dir>/mnt.<client_id>` on the remote host.
    pub fn new(client_id: &str, remote: Arc<dyn remote::Executor>, test_dir: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            remote,
            mountpoint: format!("{}/mnt.{}", test_dir.trim_end_matches('/'), client_id),
            state: MountState::Unmounted,
            polling: MountPolling::default(),
            sudo: true,
            background: Vec::new(),
        }
    }

    pub fn with_polling(mut self, polling: MountPolling) -> Self {
        self.polling = polling;
        self
    }

    /// Whether commands against the mount run under sudo (default: yes).
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn remote(&self) -> &Arc<dyn remote::Executor> {
        &self.remote
    }

    pub fn hostname(&self) -> &str {
        self.remote.hostname()
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn path(&self, name: &str) -> String {
        format!("{}/{}", self.mountpoint, name)
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn set_state(&mut self, state: MountState) {
        tracing::debug!("client.{}: {} -> {}", self.client_id, self.state, state);
        self.state = state;
    }

    pub fn polling(&self) -> MountPolling {
        self.polling
    }

    pub fn background(&self) -> &[Arc<BackgroundProcess>] {
        &self.background
    }

    pub fn expect_state(&self, operation: &'static str, allowed: &[MountState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(HarnessError::InvalidMountState {
            client: self.client_id.clone(),
            operation,
            state: self.state,
        })
    }

    fn command<'a>(&self, args: &[&'a str]) -> Vec<&'a str> {
        let mut command = Vec::with_capacity(args.len() + 1);
        if self.sudo {
            command.push("sudo");
        }
        command.extend_from_slice(args);
        command
    }

    pub async fn run(&self, args: &[&str]) -> Result<remote::CommandOutput> {
        Ok(self.remote.run(&self.command(args), true).await?)
    }

    pub async fn run_unchecked(&self, args: &[&str]) -> Result<remote::CommandOutput> {
        Ok(self.remote.run(&self.command(args), false).await?)
    }

    pub async fn spawn(&self, args: &[&str]) -> Result<remote::RemoteProcess> {
        Ok(self.remote.spawn(&self.command(args)).await?)
    }

    pub fn track(
        &mut self,
        kind: HoldKind,
        path: String,
        process: remote::RemoteProcess,
    ) -> Arc<BackgroundProcess> {
        let background = Arc::new(BackgroundProcess::new(kind, path, process));
        self.background.push(background.clone());
        background
    }

    /// Reaps every background process started on this mount and forgets them.
    pub async fn teardown(&mut self) -> Result<()> {
        let background = std::mem::take(&mut self.background);
        let mut first_error = None;
        for process in background {
            if process.is_reaped() {
                continue;
            }
            tracing::info!(
                "client.{}: terminating background {} on {}",
                self.client_id,
                process.kind(),
                process.path()
            );
            if let Err(error) = process.reap().await {
                tracing::warn!("client.{}: {:#}", self.client_id, error);
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A filesystem client attached to a directory on a remote host.
#[async_trait::async_trait]
pub trait RemoteMount: Send + Sync {
    fn core(&self) -> &MountCore;

    fn core_mut(&mut self) -> &mut MountCore;

    /// Short name of the client technology, e.g. `fuse`.
    fn technology(&self) -> &'static str;

    /// Whether [`RemoteMount::kill`] can simulate abrupt client death.
    fn supports_kill(&self) -> bool {
        true
    }

    /// Starts the client. Requires [`MountState::Unmounted`], leaves [`MountState::Mounting`].
    async fn mount(&mut self) -> Result<()>;

    /// Unmounts and waits for the client to go away. With `force` this never fails.
    async fn umount_wait(&mut self, force: bool) -> Result<()>;

    /// Kills the client without unmounting. Leaves [`MountState::Dead`].
    async fn kill(&mut self) -> Result<()>;

    /// Cleans up after [`RemoteMount::kill`]; safe to call on an already clean mount.
    async fn kill_cleanup(&mut self) -> Result<()>;

    /// Checks whether the filesystem is currently mounted.
    async fn is_mounted(&self) -> Result<bool>;

    /// Id of this client's current session, as known to the service.
    async fn session_id(&self) -> Result<u64>;

    fn client_id(&self) -> &str {
        self.core().client_id()
    }

    fn state(&self) -> MountState {
        self.core().state()
    }

    async fn wait_until_mounted(&mut self) -> Result<()> {
        let polling = self.core().polling();
        for attempt in 1..=polling.attempts {
            if self.is_mounted().await? {
                self.core_mut().set_state(MountState::Mounted);
                return Ok(());
            }
            tracing::debug!(
                "client.{} not mounted yet ({}/{})",
                self.client_id(),
                attempt,
                polling.attempts
            );
            tokio::time::sleep(polling.interval).await;
        }
        Err(HarnessError::Timeout {
            what: format!(
                "client.{} to mount at {}",
                self.client_id(),
                self.core().mountpoint()
            ),
            waited: polling.interval * polling.attempts,
        })
    }

    async fn ensure_mounted(&self) -> Result<()> {
        if self.state() == MountState::Mounted && self.is_mounted().await? {
            return Ok(());
        }
        Err(HarnessError::NotMounted(self.client_id().to_string()))
    }

    async fn create_files(&self) -> Result<()> {
        self.ensure_mounted().await?;
        for name in TEST_FILES {
            let path = self.core().path(name);
            tracing::info!("client.{}: creating {}", self.client_id(), path);
            self.core().run(&["touch", &path]).await?;
        }
        Ok(())
    }

    async fn check_files(&self) -> Result<()> {
        self.ensure_mounted().await?;
        for name in TEST_FILES {
            let path = self.core().path(name);
            tracing::info!("client.{}: checking {}", self.client_id(), path);
            let output = self.core().run_unchecked(&["ls", &path]).await?;
            if !output.success() {
                return Err(HarnessError::MissingFile(path));
            }
        }
        Ok(())
    }

    /// Creates and removes a uniquely named file.
    async fn create_destroy(&self) -> Result<()> {
        self.ensure_mounted().await?;
        let name = format!(
            "{} {}",
            humantime::format_rfc3339_millis(std::time::SystemTime::now()),
            self.client_id()
        );
        let path = self.core().path(&name);
        tracing::info!("client.{}: creating and removing {:?}", self.client_id(), path);
        self.core().run(&["touch", &path]).await?;
        self.core().run(&["rm", "-f", &path]).await?;
        Ok(())
    }

    /// Writes to `name` and keeps it open until the returned process is released.
    async fn open_background(&mut self, name: &str) -> Result<Arc<BackgroundProcess>> {
        self.ensure_mounted().await?;
        let path = self.core().path(name);
        let process = self
            .core()
            .spawn(&["sh", "-c", HOLD_SCRIPT, "sh", &path])
            .await?;
        Ok(self.core_mut().track(HoldKind::Hold, path, process))
    }

    /// Writes to `name` and exits. The process finishes once the write went through.
    async fn write_background(&mut self, name: &str) -> Result<Arc<BackgroundProcess>> {
        self.ensure_mounted().await?;
        let path = self.core().path(name);
        let process = self
            .core()
            .spawn(&["sh", "-c", WRITE_SCRIPT, "sh", &path])
            .await?;
        Ok(self.core_mut().track(HoldKind::Write, path, process))
    }

    /// Opens `<prefix>_0` .. `<prefix>_<count - 1>` and holds all of them open.
    async fn open_n_background(
        &mut self,
        prefix: &str,
        count: usize,
    ) -> Result<Arc<BackgroundProcess>> {
        self.ensure_mounted().await?;
        let path = self.core().path(prefix);
        let count = count.to_string();
        let process = self
            .core()
            .spawn(&["sh", "-c", HOLD_MANY_SCRIPT, "sh", &path, &count])
            .await?;
        Ok(self.core_mut().track(HoldKind::HoldMany, path, process))
    }

    /// Waits until `name` is non-empty, e.g. after [`RemoteMount::open_background`].
    async fn wait_for_content(&self, name: &str) -> Result<()> {
        let path = self.core().path(name);
        let polling = self.core().polling();
        for _ in 0..polling.attempts {
            if self.core().run_unchecked(&["test", "-s", &path]).await?.success() {
                return Ok(());
            }
            tokio::time::sleep(polling.interval).await;
        }
        Err(HarnessError::Timeout {
            what: format!("content in {path}"),
            waited: polling.interval * polling.attempts,
        })
    }

    /// Reaps every background process; a second call does nothing.
    async fn teardown(&mut self) -> Result<()> {
        self.core_mut().teardown().await
    }
}
