//! Error types for the strand runtime

use std::io;
use thiserror::Error;

/// Result type for scheduler and processor operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced by the scheduler lifecycle and task submission.
///
/// Misuse (cross-thread access to processor-owned state, a second waiter
/// on an fd direction, swapping into a terminated coroutine) is not an
/// error value: it aborts the process with a diagnostic.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Task or timer submitted before `start` or after `stop`
    #[error("scheduler is not running")]
    NotRunning,

    /// `start` called twice
    #[error("scheduler already started")]
    AlreadyStarted,

    /// Worker count must include the main thread (n >= 1)
    #[error("worker count must be at least 1, got {0}")]
    InvalidWorkerCount(usize),

    /// Poller / wakeup / stack construction failed
    #[error("runtime setup failed: {0}")]
    Setup(#[source] io::Error),
}

/// Result type for hooked I/O and connection operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors surfaced by the hook layer and the connection facade.
///
/// Transient conditions (`EAGAIN`, `EINTR`) are retried internally and
/// never appear here.
#[derive(Debug, Error)]
pub enum NetError {
    /// The socket's receive/send deadline elapsed before readiness
    #[error("operation timed out")]
    TimedOut,

    /// Peer closed: `EPIPE`/`ECONNRESET`, or a send after EOF was seen
    #[error("peer closed the connection")]
    PeerClosed,

    /// The waiter was cancelled: fd closed under it or runtime stopping
    #[error("operation cancelled")]
    Cancelled,

    /// Any other socket error; the connection is marked quit
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetError {
    /// Build from the current `errno`.
    pub fn last_os_error() -> Self {
        NetError::Io(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(NetError::TimedOut.to_string(), "operation timed out");
        assert_eq!(
            NetError::PeerClosed.to_string(),
            "peer closed the connection"
        );
        assert_eq!(
            SchedError::InvalidWorkerCount(0).to_string(),
            "worker count must be at least 1, got 0"
        );
    }

    #[test]
    fn io_conversion() {
        let e: NetError = io::Error::from_raw_os_error(9).into();
        assert!(matches!(e, NetError::Io(_)));
    }
}
