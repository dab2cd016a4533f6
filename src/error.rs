use crate::cp::{OpError, SessionId};
use thiserror::Error;

/// Errors surfaced by the primitives and the owner protocol
#[derive(Debug, Error)]
pub enum CpError {
    /// Bad input, e.g. a malformed pet selector or a latch count of zero. Fatal.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// No quorum could be reached within the attempt window. Retry with backoff.
    #[error("cluster unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    /// Concurrent writers kept moving the value on before a compare-and-set could land. Retry with backoff.
    #[error("lost {attempts} compare-and-set races in a row")]
    Contention { attempts: u32 },

    /// Unlock or fenced operation by a session that does not hold the lock. A programming error.
    #[error("session does not hold lock '{name}'")]
    NotOwner { name: String },

    /// The session behind this call has expired; the caller must start over with a new session.
    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    /// A write presented a fencing token that is no longer current.
    #[error("stale fencing token for lock '{lock}': presented {presented}, current {current}")]
    StaleFence {
        lock: String,
        presented: u64,
        current: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cluster answered with a reply that does not fit the request
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl CpError {
    /// Transient failures, worth retrying the whole acquire-and-run cycle after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, CpError::Unavailable { .. } | CpError::Contention { .. })
    }

    /// Failures that invalidate the session and everything learned under it
    pub fn is_session_loss(&self) -> bool {
        matches!(self, CpError::SessionExpired(_) | CpError::StaleFence { .. })
    }

    /// Failures that should terminate the process
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_session_loss()
    }

    /// Short name of the failure class, for logs
    pub fn class(&self) -> &'static str {
        match self {
            CpError::Validation(_) => "validation",
            CpError::Unavailable { .. } => "unavailable",
            CpError::Contention { .. } => "contention",
            CpError::NotOwner { .. } => "not-owner",
            CpError::SessionExpired(_) => "session-expired",
            CpError::StaleFence { .. } => "stale-fence",
            CpError::Serialization(_) => "serialization",
            CpError::UnexpectedReply(_) => "unexpected-reply",
        }
    }
}

impl From<OpError> for CpError {
    fn from(err: OpError) -> Self {
        match err {
            OpError::SessionExpired(session) => CpError::SessionExpired(session),
            OpError::NotOwner { name } => CpError::NotOwner { name },
            OpError::StaleFence {
                lock,
                presented,
                current,
            } => CpError::StaleFence {
                lock,
                presented,
                current,
            },
            OpError::InvalidArgument(reason) => CpError::Validation(reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
