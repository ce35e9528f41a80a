//! Error types for the event machine
//!
//! These cover construction, startup, and internal-consistency paths.
//! Recoverable conditions (closed, busy, syscall failures, parse errors)
//! are never surfaced through this type; they travel back to the calling
//! task as ordinary result values.

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur building or driving the runtime
#[derive(Debug)]
pub enum RtError {
    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// Task is already present in the run queue
    AlreadyQueued,

    /// Operation requires a task context (called outside resume)
    NoCurrentTask,

    /// Failed to spawn a worker thread
    ThreadSpawn(std::io::Error),

    /// Wakeup-channel setup failed (eventfd/pipe creation)
    WakeupSetup(i32),

    /// Broken internal invariant
    Internal(&'static str),

    /// Platform-specific error with errno
    Os(i32),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            RtError::AlreadyQueued => write!(f, "task already queued"),
            RtError::NoCurrentTask => write!(f, "no task is currently running"),
            RtError::ThreadSpawn(e) => write!(f, "failed to spawn worker thread: {}", e),
            RtError::WakeupSetup(errno) => write!(f, "wakeup channel setup failed: errno {}", errno),
            RtError::Internal(msg) => write!(f, "internal inconsistency: {}", msg),
            RtError::Os(errno) => write!(f, "OS error: errno {}", errno),
        }
    }
}

impl std::error::Error for RtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RtError::AlreadyQueued;
        assert_eq!(format!("{}", e), "task already queued");

        let e = RtError::InvalidConfig("pool max must be at least 1");
        assert_eq!(
            format!("{}", e),
            "invalid configuration: pool max must be at least 1"
        );
    }
}
