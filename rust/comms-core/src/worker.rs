// rust/comms-core/src/worker.rs

//! Worker-side task execution.
//!
//! A [`Worker`] owns the process-local [`WorkerRegistry`] and the transport
//! used to build session handles. The cluster layer feeds it one
//! [`WorkerTask`] at a time.

use std::sync::Arc;

use crate::cluster::protocol::{
    BootstrapConfirmation, BootstrapRequest, HandleInfo, TaskOutput, WorkerTask,
};
use crate::context::ContextState;
use crate::error::{CommsError, Result};
use crate::ops;
use crate::registry::{SessionEntry, WorkerRegistry};
use crate::session::{Capabilities, SessionId, WorkerAddress};
use crate::transport::{CommsHandle, Transport};

pub struct Worker {
    address: WorkerAddress,
    transport: Arc<dyn Transport>,
    registry: WorkerRegistry,
}

impl Worker {
    pub fn new(address: WorkerAddress, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry: WorkerRegistry::new(address.clone()),
            address,
            transport,
        }
    }

    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Resolve the handle stored for `session_id`.
    ///
    /// This is the entry point operation tasks use; a miss surfaces as
    /// [`CommsError::SessionNotFound`].
    pub fn worker_handle_lookup(&self, session_id: SessionId) -> Result<&CommsHandle> {
        self.registry.handle(session_id)
    }

    /// Execute one task against this worker's state.
    pub async fn handle(&mut self, task: WorkerTask) -> Result<TaskOutput> {
        match task {
            WorkerTask::Bootstrap(request) => {
                self.bootstrap(request).await.map(TaskOutput::Bootstrapped)
            }
            WorkerTask::Teardown { session_id } => self
                .teardown(session_id)
                .map(|removed| TaskOutput::TornDown { removed }),
            WorkerTask::Lookup { session_id } => {
                let entry = self.registry.get(session_id)?;
                Ok(TaskOutput::Handle(HandleInfo {
                    session_id,
                    rank: entry.handle.rank(),
                    size: entry.handle.size(),
                    p2p: entry.handle.has_p2p(),
                }))
            }
            WorkerTask::Allreduce { session_id } => {
                let handle = self.worker_handle_lookup(session_id)?.clone();
                ops::perform_allreduce_check(&handle)
                    .await
                    .map(TaskOutput::Check)
            }
            WorkerTask::SendRecv {
                session_id,
                n_trials,
            } => {
                let handle = self.worker_handle_lookup(session_id)?.clone();
                ops::perform_send_recv_check(&handle, n_trials)
                    .await
                    .map(TaskOutput::Check)
            }
            WorkerTask::ListSessions => Ok(TaskOutput::Sessions(self.registry.session_ids())),
        }
    }

    async fn bootstrap(&mut self, request: BootstrapRequest) -> Result<BootstrapConfirmation> {
        let session_id = request.session_id;
        let rank = request.rank;

        if let Ok(existing) = self.registry.get(session_id) {
            if existing.p2p_requested != request.p2p_requested {
                return Err(CommsError::invalid_state(
                    format!(
                        "attach to session {} with p2p_requested={} (created with {})",
                        session_id, request.p2p_requested, existing.p2p_requested
                    ),
                    ContextState::Ready,
                ));
            }
            if existing.handle.rank() != rank {
                return Err(CommsError::cluster(
                    self.address.clone(),
                    format!(
                        "session {} holds rank {} here, attach requested rank {}",
                        session_id,
                        existing.handle.rank(),
                        rank
                    ),
                ));
            }

            tracing::debug!("Worker {} already holds session {}", self.address, session_id);
            return Ok(BootstrapConfirmation {
                rank,
                collective_ok: existing.capabilities.collective,
                p2p_ok: existing.capabilities.p2p,
                attached: true,
            });
        }

        match request.worker_addresses.get(rank as usize) {
            Some(address) if *address == self.address => {}
            _ => {
                return Err(CommsError::cluster(
                    self.address.clone(),
                    format!("rank {} of session {} is not placed on this worker", rank, session_id),
                ));
            }
        }

        let peers = request.worker_addresses;
        let collective = self
            .transport
            .build_collective(session_id, rank, &peers)
            .await?;
        let p2p = if request.p2p_requested {
            self.transport.try_build_p2p(session_id, rank, &peers).await
        } else {
            None
        };

        let capabilities = Capabilities {
            collective: true,
            p2p: p2p.is_some(),
        };
        let handle = CommsHandle::new(session_id, rank, peers, collective, p2p);
        self.registry.put(
            session_id,
            SessionEntry {
                handle,
                p2p_requested: request.p2p_requested,
                capabilities,
            },
        );

        tracing::debug!(
            "Worker {} joined session {} as rank {} (p2p: {})",
            self.address,
            session_id,
            rank,
            capabilities.p2p
        );

        Ok(BootstrapConfirmation {
            rank,
            collective_ok: capabilities.collective,
            p2p_ok: capabilities.p2p,
            attached: false,
        })
    }

    /// Remove the session's entry and release its handle.
    ///
    /// Returns whether an entry existed. The entry is gone even if the
    /// release reports an error.
    fn teardown(&mut self, session_id: SessionId) -> Result<bool> {
        match self.registry.remove(session_id) {
            Some(entry) => {
                tracing::debug!("Worker {} leaving session {}", self.address, session_id);
                entry.handle.release()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release every remaining session. Used when the worker stops.
    pub fn shutdown(&mut self) -> usize {
        let entries = self.registry.drain();
        for (session_id, entry) in &entries {
            if let Err(e) = entry.handle.release() {
                tracing::warn!(
                    "Worker {} failed to release session {}: {}",
                    self.address,
                    session_id,
                    e
                );
            }
        }
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionDescriptor;
    use crate::transport::{LoopbackFabric, LoopbackOptions, LoopbackTransport};

    fn worker(fabric: &Arc<LoopbackFabric>, address: &str) -> Worker {
        let transport = LoopbackTransport::new(fabric.clone(), LoopbackOptions::default());
        Worker::new(WorkerAddress::new(address), Arc::new(transport))
    }

    fn single_worker_session(p2p: bool) -> SessionDescriptor {
        SessionDescriptor::new(p2p, vec![WorkerAddress::new("local://worker-0")]).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_then_attach_is_noop() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut worker = worker(&fabric, "local://worker-0");
        let descriptor = single_worker_session(true);
        let request = BootstrapRequest::for_rank(&descriptor, 0);

        let first = worker
            .handle(WorkerTask::Bootstrap(request.clone()))
            .await
            .unwrap()
            .into_confirmation(worker.address())
            .unwrap();
        assert!(!first.attached);
        assert!(first.collective_ok);
        assert!(first.p2p_ok);

        let second = worker
            .handle(WorkerTask::Bootstrap(request))
            .await
            .unwrap()
            .into_confirmation(worker.address())
            .unwrap();
        assert!(second.attached);
        assert_eq!(second.p2p_ok, first.p2p_ok);
        assert_eq!(worker.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_with_different_capabilities_rejected() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut worker = worker(&fabric, "local://worker-0");
        let descriptor = single_worker_session(false);
        let mut request = BootstrapRequest::for_rank(&descriptor, 0);

        worker
            .handle(WorkerTask::Bootstrap(request.clone()))
            .await
            .unwrap();

        request.p2p_requested = true;
        let err = worker
            .handle(WorkerTask::Bootstrap(request))
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::InvalidState { .. }));

        let handle = worker.worker_handle_lookup(descriptor.session_id()).unwrap();
        assert!(!handle.has_p2p());
    }

    #[tokio::test]
    async fn test_misrouted_bootstrap_rejected() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut worker = worker(&fabric, "local://worker-9");
        let descriptor = single_worker_session(false);

        let err = worker
            .handle(WorkerTask::Bootstrap(BootstrapRequest::for_rank(&descriptor, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::Cluster { .. }));
        assert!(worker.registry().is_empty());
        assert_eq!(fabric.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_teardown_removes_entry_and_is_idempotent() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut worker = worker(&fabric, "local://worker-0");
        let descriptor = single_worker_session(false);
        let session_id = descriptor.session_id();

        worker
            .handle(WorkerTask::Bootstrap(BootstrapRequest::for_rank(&descriptor, 0)))
            .await
            .unwrap();

        let removed = worker
            .handle(WorkerTask::Teardown { session_id })
            .await
            .unwrap();
        assert_eq!(removed, TaskOutput::TornDown { removed: true });

        let removed = worker
            .handle(WorkerTask::Teardown { session_id })
            .await
            .unwrap();
        assert_eq!(removed, TaskOutput::TornDown { removed: false });

        let err = worker
            .handle(WorkerTask::Lookup { session_id })
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::SessionNotFound { .. }));
        assert!(!fabric.contains(session_id));
    }

    #[tokio::test]
    async fn test_single_rank_allreduce() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut worker = worker(&fabric, "local://worker-0");
        let descriptor = single_worker_session(false);
        let session_id = descriptor.session_id();

        worker
            .handle(WorkerTask::Bootstrap(BootstrapRequest::for_rank(&descriptor, 0)))
            .await
            .unwrap();

        let output = worker
            .handle(WorkerTask::Allreduce { session_id })
            .await
            .unwrap();
        assert_eq!(output, TaskOutput::Check(true));

        assert_eq!(worker.shutdown(), 1);
        assert!(worker.registry().is_empty());
    }
}
