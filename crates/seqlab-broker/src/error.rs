//! Broker error taxonomy.
//!
//! Every failure is terminal for the current process. The category
//! determines the exit code the parent sees; the message goes to the
//! inherited stderr as a human-readable diagnostic.

use thiserror::Error;

use seqlab_protocol::frame::FrameError;
use seqlab_protocol::request::RequestError;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that terminate the broker, by category.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed, oversized or unterminated request or frame.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Unknown user, wrong secret, or disallowed uid/gid.
    #[error("authentication: {0}")]
    Auth(String),

    /// Group-init, setgid, setuid or chdir failure.
    #[error("privilege: {0}")]
    Privilege(String),

    /// No progress within the operation's wall-clock budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Executable not found or the spawn itself failed.
    #[error("spawn: {0}")]
    Spawn(String),

    /// Create/delete/rename/stat failure on the scoped path.
    #[error("filesystem: {0}")]
    Fs(String),

    /// The sequence-description collaborator failed.
    #[error("describe: {0}")]
    Describe(String),
}

impl BrokerError {
    /// Process exit code for this error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            BrokerError::Protocol(_) => 2,
            BrokerError::Auth(_) => 3,
            BrokerError::Privilege(_) => 4,
            BrokerError::Timeout(_) => 5,
            BrokerError::Spawn(_) => 6,
            BrokerError::Fs(_) => 7,
            BrokerError::Describe(_) => 8,
        }
    }
}

impl From<FrameError> for BrokerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Timeout(d) => BrokerError::Timeout(format!("frame I/O after {d:?}")),
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}

impl From<RequestError> for BrokerError {
    fn from(err: RequestError) -> Self {
        BrokerError::Protocol(err.to_string())
    }
}
