use tokio::io::AsyncWriteExt;

use crate::{CommandOutput, RemoteError};

/// Write half of a running command's standard input.
pub type ProcessStdin = std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

type Outcome = Option<Result<CommandOutput, RemoteError>>;

/// Handle to a command that keeps running after it was started.
///
/// The exit status is collected by a background task so [`RemoteProcess::finished`] can be
/// polled without blocking. Every method takes `&self`, so a handle can be shared by the
/// code that started the command and the code that later cleans it up.
pub struct RemoteProcess {
    host: String,
    command: String,
    stdin: tokio::sync::Mutex<Option<ProcessStdin>>,
    outcome: tokio::sync::watch::Receiver<Outcome>,
    wait_timeout: std::time::Duration,
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("host", &self.host)
            .field("command", &self.command)
            .field("finished", &self.finished())
            .finish()
    }
}

impl RemoteProcess {
    /// Wraps a started command. `waiter` must resolve once the command exits.
    pub fn start<F>(
        host: &str,
        command: String,
        stdin: Option<ProcessStdin>,
        waiter: F,
        wait_timeout: std::time::Duration,
    ) -> Self
    where
        F: std::future::Future<Output = Result<CommandOutput, RemoteError>> + Send + 'static,
    {
        let (sender, outcome) = tokio::sync::watch::channel(None);
        let task_host = host.to_string();
        let task_command = command.clone();
        tokio::spawn(async move {
            let result = waiter.await;
            match &result {
                Ok(output) => tracing::debug!(
                    "{:?} on {} exited with {:?}",
                    task_command,
                    task_host,
                    output.status
                ),
                Err(error) => {
                    tracing::debug!("{:?} on {} failed: {}", task_command, task_host, error)
                }
            }
            // nobody may be listening anymore
            let _ = sender.send(Some(result));
        });
        Self {
            host: host.to_string(),
            command,
            stdin: tokio::sync::Mutex::new(stdin),
            outcome,
            wait_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-blocking check whether the command has exited.
    pub fn finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Closes standard input. Commands that block on stdin see end-of-file and exit.
    ///
    /// Closing twice, or closing a command that has already exited, is not an error.
    pub async fn close_stdin(&self) {
        let mut stdin = self.stdin.lock().await;
        if let Some(mut writer) = stdin.take() {
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(
                    "closing stdin of {:?} on {}: {}",
                    self.command,
                    self.host,
                    error
                );
            }
        }
    }

    /// Waits for the command to exit and returns its output regardless of the exit status.
    pub async fn wait_output(&self) -> Result<CommandOutput, RemoteError> {
        let mut outcome = self.outcome.clone();
        match tokio::time::timeout(self.wait_timeout, outcome.wait_for(Option::is_some)).await {
            Err(_) => Err(RemoteError::Timeout {
                host: self.host.clone(),
                command: self.command.clone(),
                waited: self.wait_timeout,
            }),
            Ok(Err(_)) => Err(self.lost_waiter()),
            Ok(Ok(value)) => (*value).clone().unwrap_or_else(|| Err(self.lost_waiter())),
        }
    }

    /// Waits for the command to exit; a non-zero exit status is a [`RemoteError::CommandFailed`].
    pub async fn wait(&self) -> Result<CommandOutput, RemoteError> {
        self.wait_output()
            .await?
            .into_checked(&self.host, &self.command)
    }

    fn lost_waiter(&self) -> RemoteError {
        RemoteError::Io {
            host: self.host.clone(),
            command: self.command.clone(),
            message: "exit status collector went away".to_string(),
        }
    }
}
