use crate::mount::MountState;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Transport(#[from] remote::RemoteError),
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        what: String,
        waited: std::time::Duration,
    },
    #[error("service reached {observed} while waiting for {expected}")]
    ProtocolViolation { expected: String, observed: String },
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("expected file {0} is missing")]
    MissingFile(String),
    #[error("client.{0} is not mounted")]
    NotMounted(String),
    #[error("client.{client} cannot {operation} while {state}")]
    InvalidMountState {
        client: String,
        operation: &'static str,
        state: MountState,
    },
    #[error("{technology} mounts do not support {operation}")]
    Unsupported {
        technology: &'static str,
        operation: &'static str,
    },
    #[error("unexpected output from {command:?}: {message}")]
    AdminOutput { command: String, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("{} of {total} scenarios did not pass: {}", failed.len(), failed.join(", "))]
    RunFailed { failed: Vec<String>, total: usize },
}

impl HarnessError {
    /// Assertion failures are reported as scenario failures; every other error as an error.
    pub fn is_assertion(&self) -> bool {
        matches!(self, HarnessError::Assertion(_))
    }
}

impl From<thrash::ThrashError> for HarnessError {
    fn from(error: thrash::ThrashError) -> Self {
        HarnessError::Config(error.to_string())
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
