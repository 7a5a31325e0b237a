//! Task and result messages exchanged between the coordinator and workers.
//!
//! All messages are plain serde types so that a remote cluster layer can
//! carry them; the in-process [`LocalCluster`](super::LocalCluster) passes
//! them through channels as-is.

use serde::{Deserialize, Serialize};

use crate::error::{CommsError, Result};
use crate::session::{Rank, SessionDescriptor, SessionId, WorkerAddress};

/// Bootstrap instruction for a single rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub session_id: SessionId,
    pub rank: Rank,
    /// Full peer list in rank order.
    pub worker_addresses: Vec<WorkerAddress>,
    pub p2p_requested: bool,
}

impl BootstrapRequest {
    /// Build the request for `rank` of `descriptor`.
    pub fn for_rank(descriptor: &SessionDescriptor, rank: Rank) -> Self {
        Self {
            session_id: descriptor.session_id(),
            rank,
            worker_addresses: descriptor.worker_addresses().to_vec(),
            p2p_requested: descriptor.p2p_requested(),
        }
    }
}

/// Confirmation returned by a worker after bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfirmation {
    pub rank: Rank,
    pub collective_ok: bool,
    pub p2p_ok: bool,
    /// The worker already held the session and did nothing.
    pub attached: bool,
}

/// Snapshot of a worker's handle, as seen from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub session_id: SessionId,
    pub rank: Rank,
    pub size: u32,
    pub p2p: bool,
}

/// Work item placed on a specific worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerTask {
    /// Build (or attach to) the session's communicator.
    Bootstrap(BootstrapRequest),
    /// Remove the session's registry entry and release its handle.
    Teardown { session_id: SessionId },
    /// Resolve the session's handle.
    Lookup { session_id: SessionId },
    /// Run the all-reduce check over the session's handle.
    Allreduce { session_id: SessionId },
    /// Run the send/receive check over the session's handle.
    SendRecv { session_id: SessionId, n_trials: u32 },
    /// List the sessions registered on the worker.
    ListSessions,
}

impl WorkerTask {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bootstrap(_) => "bootstrap",
            Self::Teardown { .. } => "teardown",
            Self::Lookup { .. } => "lookup",
            Self::Allreduce { .. } => "allreduce",
            Self::SendRecv { .. } => "send_recv",
            Self::ListSessions => "list_sessions",
        }
    }
}

/// Successful result of a [`WorkerTask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutput {
    Bootstrapped(BootstrapConfirmation),
    TornDown { removed: bool },
    Handle(HandleInfo),
    Check(bool),
    Sessions(Vec<SessionId>),
}

impl TaskOutput {
    fn unexpected(&self, worker: &WorkerAddress, expected: &str) -> CommsError {
        CommsError::cluster(
            worker.clone(),
            format!("expected {} result, got {:?}", expected, self),
        )
    }

    pub fn into_confirmation(self, worker: &WorkerAddress) -> Result<BootstrapConfirmation> {
        match self {
            Self::Bootstrapped(confirmation) => Ok(confirmation),
            other => Err(other.unexpected(worker, "bootstrap")),
        }
    }

    pub fn into_removed(self, worker: &WorkerAddress) -> Result<bool> {
        match self {
            Self::TornDown { removed } => Ok(removed),
            other => Err(other.unexpected(worker, "teardown")),
        }
    }

    pub fn into_handle(self, worker: &WorkerAddress) -> Result<HandleInfo> {
        match self {
            Self::Handle(info) => Ok(info),
            other => Err(other.unexpected(worker, "lookup")),
        }
    }

    pub fn into_check(self, worker: &WorkerAddress) -> Result<bool> {
        match self {
            Self::Check(ok) => Ok(ok),
            other => Err(other.unexpected(worker, "check")),
        }
    }

    pub fn into_sessions(self, worker: &WorkerAddress) -> Result<Vec<SessionId>> {
        match self {
            Self::Sessions(ids) => Ok(ids),
            other => Err(other.unexpected(worker, "session list")),
        }
    }
}
