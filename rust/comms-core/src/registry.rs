// rust/comms-core/src/registry.rs

//! Process-local session store of a worker.
//!
//! Each worker owns exactly one [`WorkerRegistry`]. Entries are created by
//! bootstrap tasks, read by operation tasks and removed by teardown tasks,
//! all of which run on the owning worker, so the registry needs no locking.

use std::collections::HashMap;

use crate::error::{CommsError, Result};
use crate::session::{Capabilities, SessionId, WorkerAddress};
use crate::transport::CommsHandle;

/// State a worker keeps for one active session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub handle: CommsHandle,
    /// Capability request the session was created with.
    pub p2p_requested: bool,
    /// What actually came up on this worker.
    pub capabilities: Capabilities,
}

/// Session id to session state map for one worker process.
#[derive(Debug)]
pub struct WorkerRegistry {
    worker: WorkerAddress,
    entries: HashMap<SessionId, SessionEntry>,
}

impl WorkerRegistry {
    pub fn new(worker: WorkerAddress) -> Self {
        Self {
            worker,
            entries: HashMap::new(),
        }
    }

    /// Address of the worker owning this registry.
    pub fn worker(&self) -> &WorkerAddress {
        &self.worker
    }

    /// Store `entry` under `session_id`, returning any entry it replaced.
    pub fn put(&mut self, session_id: SessionId, entry: SessionEntry) -> Option<SessionEntry> {
        self.entries.insert(session_id, entry)
    }

    /// Look up the entry for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CommsError::SessionNotFound`] if the session is unknown on
    /// this worker.
    pub fn get(&self, session_id: SessionId) -> Result<&SessionEntry> {
        self.entries
            .get(&session_id)
            .ok_or_else(|| CommsError::session_not_found(session_id, self.worker.clone()))
    }

    /// Handle stored for `session_id`.
    pub fn handle(&self, session_id: SessionId) -> Result<&CommsHandle> {
        self.get(session_id).map(|entry| &entry.handle)
    }

    pub fn remove(&mut self, session_id: SessionId) -> Option<SessionEntry> {
        self.entries.remove(&session_id)
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.entries.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all sessions held, in no particular order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.entries.keys().copied().collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(SessionId, SessionEntry)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::transport::{LoopbackFabric, LoopbackOptions, LoopbackTransport, Transport};

    async fn entry(fabric: &Arc<LoopbackFabric>, session_id: SessionId) -> SessionEntry {
        let peers = vec![WorkerAddress::new("local://worker-0")];
        let transport = LoopbackTransport::new(fabric.clone(), LoopbackOptions::default());
        let collective = transport
            .build_collective(session_id, 0, &peers)
            .await
            .unwrap();

        SessionEntry {
            handle: CommsHandle::new(session_id, 0, peers, collective, None),
            p2p_requested: false,
            capabilities: Capabilities {
                collective: true,
                p2p: false,
            },
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut registry = WorkerRegistry::new(WorkerAddress::new("local://worker-0"));
        let session = SessionId::generate();

        assert!(registry.is_empty());
        assert!(registry.put(session, entry(&fabric, session).await).is_none());
        assert!(registry.contains(session));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.session_ids(), vec![session]);

        let handle = registry.handle(session).unwrap();
        assert_eq!(handle.session_id(), session);
        assert_eq!(handle.rank(), 0);

        let removed = registry.remove(session).unwrap();
        removed.handle.release().unwrap();
        assert!(registry.remove(session).is_none());
        assert!(!fabric.contains(session));
    }

    #[test]
    fn test_missing_session_is_reportable() {
        let registry = WorkerRegistry::new(WorkerAddress::new("local://worker-2"));
        let session = SessionId::generate();

        let err = registry.get(session).unwrap_err();
        match err {
            CommsError::SessionNotFound { session_id, worker } => {
                assert_eq!(session_id, session);
                assert_eq!(worker.as_str(), "local://worker-2");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
