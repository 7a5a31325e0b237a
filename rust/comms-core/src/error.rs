// rust/comms-core/src/error.rs

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::context::ContextState;
use crate::session::{Rank, SessionId, WorkerAddress};

/// Failure detail for a single worker during bootstrap or teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker: WorkerAddress,
    pub rank: Rank,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(worker: WorkerAddress, rank: Rank, message: impl Into<String>) -> Self {
        Self {
            worker,
            rank,
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rank {}): {}", self.worker, self.rank, self.message)
    }
}

struct FailureList<'a>(&'a [WorkerFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum CommsError {

    #[error("No workers available to form a session")]
    EmptyCluster,

    #[error("Worker '{address}' appears more than once in the session")]
    DuplicateWorker {
        address: WorkerAddress,
    },

    #[error("Bootstrap of session {session_id} failed on {} worker(s): {}", failures.len(), FailureList(failures))]
    Bootstrap {
        session_id: SessionId,
        failures: Vec<WorkerFailure>,
    },

    #[error("Session {session_id} not found on worker '{worker}'")]
    SessionNotFound {
        session_id: SessionId,
        worker: WorkerAddress,
    },

    #[error("Cannot {operation} while context is {state}")]
    InvalidState {
        operation: String,
        state: ContextState,
    },

    #[error("Teardown of session {session_id} failed on {} worker(s): {}", failures.len(), FailureList(failures))]
    TeardownPartialFailure {
        session_id: SessionId,
        failures: Vec<WorkerFailure>,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Cluster error for worker '{worker}': {message}")]
    Cluster {
        worker: WorkerAddress,
        message: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, CommsError>;

// Convenience constructors
impl CommsError {

    pub fn duplicate_worker(address: WorkerAddress) -> Self {
        Self::DuplicateWorker { address }
    }

    pub fn bootstrap(session_id: SessionId, failures: Vec<WorkerFailure>) -> Self {
        Self::Bootstrap {
            session_id,
            failures,
        }
    }

    pub fn session_not_found(session_id: SessionId, worker: WorkerAddress) -> Self {
        Self::SessionNotFound { session_id, worker }
    }

    pub fn invalid_state(operation: impl Into<String>, state: ContextState) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state,
        }
    }

    pub fn teardown_partial(session_id: SessionId, failures: Vec<WorkerFailure>) -> Self {
        Self::TeardownPartialFailure {
            session_id,
            failures,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn cluster(worker: WorkerAddress, message: impl Into<String>) -> Self {
        Self::Cluster {
            worker,
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Per-worker detail carried by bootstrap and teardown failures.
    pub fn worker_failures(&self) -> &[WorkerFailure] {
        match self {
            Self::Bootstrap { failures, .. } | Self::TeardownPartialFailure { failures, .. } => {
                failures
            }
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_error_lists_every_worker() {
        let err = CommsError::bootstrap(
            SessionId::generate(),
            vec![
                WorkerFailure::new(WorkerAddress::new("local://worker-1"), 1, "no device"),
                WorkerFailure::new(WorkerAddress::new("local://worker-3"), 3, "timed out"),
            ],
        );

        let message = err.to_string();
        assert!(message.contains("2 worker(s)"));
        assert!(message.contains("local://worker-1 (rank 1): no device"));
        assert!(message.contains("local://worker-3 (rank 3): timed out"));
        assert_eq!(err.worker_failures().len(), 2);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = CommsError::invalid_state("init", ContextState::Destroyed);
        assert_eq!(err.to_string(), "Cannot init while context is destroyed");
        assert!(err.worker_failures().is_empty());
    }
}
