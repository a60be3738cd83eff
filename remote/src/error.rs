/// Failure talking to a host or running a command on it.
///
/// Errors are `Clone` because a finished [`crate::RemoteProcess`] hands the same outcome to every
/// caller that waits on it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to launch {command:?} on {host}: {message}")]
    Launch {
        host: String,
        command: String,
        message: String,
    },
    #[error(
        "command {command:?} on {host} failed with status {status:?}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    CommandFailed {
        host: String,
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("i/o error while running {command:?} on {host}: {message}")]
    Io {
        host: String,
        command: String,
        message: String,
    },
    #[error("{command:?} on {host} did not exit within {waited:?}")]
    Timeout {
        host: String,
        command: String,
        waited: std::time::Duration,
    },
    #[error("ssh connection to {host} failed: {message}")]
    Ssh { host: String, message: String },
}

impl RemoteError {
    /// True when the command ran to completion but exited unsuccessfully.
    pub fn is_command_failed(&self) -> bool {
        matches!(self, RemoteError::CommandFailed { .. })
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            RemoteError::CommandFailed { status, .. } => *status,
            _ => None,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            RemoteError::Launch { host, .. }
            | RemoteError::CommandFailed { host, .. }
            | RemoteError::Io { host, .. }
            | RemoteError::Timeout { host, .. }
            | RemoteError::Ssh { host, .. } => host,
        }
    }
}
