//! Remote command execution for the recovery tools.
//!
//! Commands run either on a host reached over SSH ([`SshExecutor`]) or on the local machine
//! ([`LocalExecutor`]). Both implement [`Executor`], which is what the rest of the workspace
//! talks to. Long-running commands are returned as a [`RemoteProcess`] that can be polled,
//! have its stdin closed, and be waited on with a bound.

use tracing::instrument;

mod error;
mod process;

pub use error::RemoteError;
pub use process::{ProcessStdin, RemoteProcess};

/// Upper bound on how long waiting for a background command may take.
pub const DEFAULT_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(900);

/// Captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the command was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turns an unsuccessful exit into [`RemoteError::CommandFailed`].
    pub fn into_checked(self, host: &str, command: &str) -> Result<Self, RemoteError> {
        if self.success() {
            return Ok(self);
        }
        Err(RemoteError::CommandFailed {
            host: host.to_string(),
            command: command.to_string(),
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Something that can run commands on one host.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Name of the host commands run on.
    fn hostname(&self) -> &str;

    /// Runs a command to completion. With `check_status` a non-zero exit is an error.
    async fn run(&self, args: &[&str], check_status: bool) -> Result<CommandOutput, RemoteError>;

    /// Starts a command with piped stdin and returns without waiting for it.
    async fn spawn(&self, args: &[&str]) -> Result<RemoteProcess, RemoteError>;
}

/// Renders an argument vector the way a POSIX shell would need to see it.
pub fn format_command(args: &[&str]) -> String {
    args.iter()
        .map(|arg| shell_escape(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes `arg` for a POSIX shell unless it is made only of safe characters.
pub fn shell_escape(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn split_program<'a>(
    host: &str,
    args: &[&'a str],
) -> Result<(&'a str, Vec<&'a str>), RemoteError> {
    match args.split_first() {
        Some((program, rest)) => Ok((*program, rest.to_vec())),
        None => Err(RemoteError::Launch {
            host: host.to_string(),
            command: String::new(),
            message: "empty command".to_string(),
        }),
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct SshSession {
    #[serde(default)]
    pub user: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl SshSession {
    pub fn new(host: &str) -> Self {
        Self {
            user: None,
            host: host.to_string(),
            port: None,
        }
    }

    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

async fn setup_ssh_session(
    session: &SshSession,
) -> Result<std::sync::Arc<openssh::Session>, RemoteError> {
    let destination = session.destination();
    tracing::debug!("Connecting to SSH destination: {}", destination);
    let connection = openssh::Session::connect(destination, openssh::KnownHosts::Accept)
        .await
        .map_err(|error| RemoteError::Ssh {
            host: session.host.clone(),
            message: error.to_string(),
        })?;
    Ok(std::sync::Arc::new(connection))
}

/// Runs commands on a host over a shared SSH control connection, opened on first use.
#[derive(Debug)]
pub struct SshExecutor {
    session: SshSession,
    connection: tokio::sync::OnceCell<std::sync::Arc<openssh::Session>>,
    wait_timeout: std::time::Duration,
}

impl SshExecutor {
    pub fn new(session: SshSession) -> Self {
        Self {
            session,
            connection: tokio::sync::OnceCell::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: std::time::Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    async fn connection(&self) -> Result<std::sync::Arc<openssh::Session>, RemoteError> {
        let connection = self
            .connection
            .get_or_try_init(|| setup_ssh_session(&self.session))
            .await?;
        Ok(connection.clone())
    }

    fn io_error(&self, command: &str, error: openssh::Error) -> RemoteError {
        RemoteError::Io {
            host: self.session.host.clone(),
            command: command.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Executor for SshExecutor {
    fn hostname(&self) -> &str {
        &self.session.host
    }

    #[instrument(skip(self), fields(host = %self.session.host))]
    async fn run(&self, args: &[&str], check_status: bool) -> Result<CommandOutput, RemoteError> {
        let command = format_command(args);
        let (program, rest) = split_program(&self.session.host, args)?;
        let connection = self.connection().await?;
        tracing::debug!("running: {}", command);
        let output = connection
            .command(program)
            .args(rest)
            .output()
            .await
            .map_err(|error| self.io_error(&command, error))?;
        let output = CommandOutput::from(output);
        if check_status {
            return output.into_checked(&self.session.host, &command);
        }
        Ok(output)
    }

    #[instrument(skip(self), fields(host = %self.session.host))]
    async fn spawn(&self, args: &[&str]) -> Result<RemoteProcess, RemoteError> {
        let command = format_command(args);
        let (program, rest) = split_program(&self.session.host, args)?;
        let connection = self.connection().await?;
        tracing::debug!("spawning: {}", command);
        let mut child = connection
            .arc_command(program.to_string())
            .args(rest)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .map_err(|error| RemoteError::Launch {
                host: self.session.host.clone(),
                command: command.clone(),
                message: error.to_string(),
            })?;
        let stdin = child
            .stdin()
            .take()
            .map(|writer| -> ProcessStdin { Box::pin(writer) });
        let host = self.session.host.clone();
        let waited_command = command.clone();
        let waiter = async move {
            child
                .wait_with_output()
                .await
                .map(CommandOutput::from)
                .map_err(|error| RemoteError::Io {
                    host,
                    command: waited_command,
                    message: error.to_string(),
                })
        };
        Ok(RemoteProcess::start(
            &self.session.host,
            command,
            stdin,
            waiter,
            self.wait_timeout,
        ))
    }
}

/// Runs commands on the machine the tools themselves run on.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    hostname: String,
    wait_timeout: std::time::Duration,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::with_hostname("localhost")
    }

    pub fn with_hostname(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: std::time::Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    fn command(&self, program: &str, rest: &[&str]) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(program);
        command.args(rest).kill_on_drop(true);
        command
    }
}

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    #[instrument(skip(self))]
    async fn run(&self, args: &[&str], check_status: bool) -> Result<CommandOutput, RemoteError> {
        let command = format_command(args);
        let (program, rest) = split_program(&self.hostname, args)?;
        tracing::debug!("running: {}", command);
        let output = self
            .command(program, &rest)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|error| RemoteError::Launch {
                host: self.hostname.clone(),
                command: command.clone(),
                message: error.to_string(),
            })?;
        let output = CommandOutput::from(output);
        if check_status {
            return output.into_checked(&self.hostname, &command);
        }
        Ok(output)
    }

    #[instrument(skip(self))]
    async fn spawn(&self, args: &[&str]) -> Result<RemoteProcess, RemoteError> {
        let command = format_command(args);
        let (program, rest) = split_program(&self.hostname, args)?;
        tracing::debug!("spawning: {}", command);
        let mut child = self
            .command(program, &rest)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|error| RemoteError::Launch {
                host: self.hostname.clone(),
                command: command.clone(),
                message: error.to_string(),
            })?;
        let stdin = child
            .stdin
            .take()
            .map(|writer| -> ProcessStdin { Box::pin(writer) });
        let host = self.hostname.clone();
        let waited_command = command.clone();
        let waiter = async move {
            child
                .wait_with_output()
                .await
                .map(CommandOutput::from)
                .map_err(|error| RemoteError::Io {
                    host,
                    command: waited_command,
                    message: error.to_string(),
                })
        };
        Ok(RemoteProcess::start(
            &self.hostname,
            command,
            stdin,
            waiter,
            self.wait_timeout,
        ))
    }
}
