// rust/comms-core/src/session.rs

//! Session identity and membership.
//!
//! A [`SessionDescriptor`] names one communicator group: a random session
//! identifier, the ordered snapshot of participating workers and the
//! direct-transport request. A worker's rank is its index in that snapshot.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CommsError, Result};

/// Position of a worker within a session's worker list.
pub type Rank = u32;

/// Unique identifier of one communicator group.
///
/// Backed by a random (v4) UUID so that concurrent sessions in the same
/// cluster never address each other's registry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of a worker process as known to the cluster layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerAddress(String);

impl WorkerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for WorkerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Identity of a coordinating client, used to key default contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Capabilities that actually came up for a session.
///
/// Resolved once at bootstrap and never re-probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Mandatory collective substrate is ready.
    pub collective: bool,
    /// Optional direct-transport substrate is ready.
    pub p2p: bool,
}

/// Value object identifying one communicator group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    session_id: SessionId,
    worker_addresses: Vec<WorkerAddress>,
    p2p_requested: bool,
}

impl SessionDescriptor {
    /// Create a descriptor for a new session over `worker_addresses`.
    ///
    /// # Errors
    ///
    /// Returns [`CommsError::EmptyCluster`] if no workers are given and
    /// [`CommsError::DuplicateWorker`] if an address repeats.
    pub fn new(p2p_requested: bool, worker_addresses: Vec<WorkerAddress>) -> Result<Self> {
        Self::with_session_id(SessionId::generate(), p2p_requested, worker_addresses)
    }

    /// Create a descriptor for a known session identifier.
    pub fn with_session_id(
        session_id: SessionId,
        p2p_requested: bool,
        worker_addresses: Vec<WorkerAddress>,
    ) -> Result<Self> {
        if worker_addresses.is_empty() {
            return Err(CommsError::EmptyCluster);
        }

        let mut seen = HashSet::with_capacity(worker_addresses.len());
        for address in &worker_addresses {
            if !seen.insert(address) {
                return Err(CommsError::duplicate_worker(address.clone()));
            }
        }

        Ok(Self {
            session_id,
            worker_addresses,
            p2p_requested,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Workers in rank order.
    pub fn worker_addresses(&self) -> &[WorkerAddress] {
        &self.worker_addresses
    }

    pub fn p2p_requested(&self) -> bool {
        self.p2p_requested
    }

    /// Number of ranks in the session.
    pub fn size(&self) -> u32 {
        self.worker_addresses.len() as u32
    }

    /// Rank of `address`, if it participates in this session.
    pub fn rank_of(&self, address: &WorkerAddress) -> Option<Rank> {
        self.worker_addresses
            .iter()
            .position(|a| a == address)
            .map(|i| i as Rank)
    }

    /// Iterate over `(rank, address)` pairs in rank order.
    pub fn ranks(&self) -> impl Iterator<Item = (Rank, &WorkerAddress)> {
        self.worker_addresses
            .iter()
            .enumerate()
            .map(|(i, a)| (i as Rank, a))
    }
}

/// Create a descriptor for a fresh session.
///
/// Shorthand for [`SessionDescriptor::new`].
pub fn new_session(
    p2p_requested: bool,
    worker_addresses: Vec<WorkerAddress>,
) -> Result<SessionDescriptor> {
    SessionDescriptor::new(p2p_requested, worker_addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(n: usize) -> Vec<WorkerAddress> {
        (0..n)
            .map(|i| WorkerAddress::new(format!("local://worker-{}", i)))
            .collect()
    }

    #[test]
    fn test_new_session_assigns_ranks_by_position() {
        let descriptor = new_session(false, addresses(4)).unwrap();

        assert_eq!(descriptor.size(), 4);
        assert!(!descriptor.p2p_requested());
        assert_eq!(descriptor.rank_of(&WorkerAddress::new("local://worker-0")), Some(0));
        assert_eq!(descriptor.rank_of(&WorkerAddress::new("local://worker-3")), Some(3));
        assert_eq!(descriptor.rank_of(&WorkerAddress::new("local://worker-9")), None);

        let ranks: Vec<_> = descriptor.ranks().map(|(r, _)| r).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rank_follows_snapshot_order_not_address_order() {
        let workers = vec![
            WorkerAddress::new("local://b"),
            WorkerAddress::new("local://a"),
        ];
        let descriptor = new_session(true, workers).unwrap();

        assert_eq!(descriptor.rank_of(&WorkerAddress::new("local://b")), Some(0));
        assert_eq!(descriptor.rank_of(&WorkerAddress::new("local://a")), Some(1));
    }

    #[test]
    fn test_empty_cluster_rejected() {
        let result = new_session(false, Vec::new());
        assert!(matches!(result, Err(CommsError::EmptyCluster)));
    }

    #[test]
    fn test_duplicate_worker_rejected() {
        let mut workers = addresses(2);
        workers.push(WorkerAddress::new("local://worker-0"));

        let err = new_session(false, workers).unwrap_err();
        assert!(matches!(err, CommsError::DuplicateWorker { .. }));
        assert!(err.to_string().contains("local://worker-0"));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_with_session_id_keeps_identifier() {
        let id = SessionId::generate();
        let descriptor = SessionDescriptor::with_session_id(id, false, addresses(1)).unwrap();
        assert_eq!(descriptor.session_id(), id);
    }
}
