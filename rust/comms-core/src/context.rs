// rust/comms-core/src/context.rs

//! Coordinator-side communicator context.
//!
//! A [`CommsContext`] owns one session for its whole lifetime:
//!
//! ```text
//! Created --init--> Initializing --ok--> Ready --destroy--> Destroyed
//!                        |
//!                        +--error or cancel--> Failed --destroy--> Destroyed
//! ```
//!
//! The session identifier is fixed at construction. The worker snapshot
//! and capability flags are fixed by the first successful `init`.
//!
//! The bootstrap itself runs on a spawned task, so dropping an `init`
//! future (for instance under `tokio::time::timeout`) fails the context and
//! rolls back whatever that bootstrap created.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::bootstrap::{BootstrapFailure, Bootstrapped, Bootstrapper};
use crate::cluster::{dispatch_all, Cluster, HandleInfo, TaskOutput, WorkerTask};
use crate::config::SessionConfig;
use crate::error::{CommsError, Result};
use crate::session::{Capabilities, Rank, SessionDescriptor, SessionId, WorkerAddress};

/// Lifecycle state of a [`CommsContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Created,
    Initializing,
    Ready,
    /// Bootstrap failed; terminal apart from `destroy`.
    Failed,
    Destroyed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

pub struct CommsContext {
    cluster: Arc<dyn Cluster>,
    config: SessionConfig,
    session_id: SessionId,
    p2p_requested: bool,
    state: ContextState,
    descriptor: Option<SessionDescriptor>,
    capabilities: Capabilities,
    // Workers a failed bootstrap could not roll back.
    unreleased: Vec<(Rank, WorkerAddress)>,
}

impl CommsContext {
    /// Create a context for a fresh session with default timeouts.
    pub fn new(cluster: Arc<dyn Cluster>, p2p: bool) -> Self {
        let config = SessionConfig {
            p2p,
            ..Default::default()
        };
        Self::with_config(cluster, config)
    }

    /// Create a context for a fresh session. `config.p2p` is the capability
    /// request.
    pub fn with_config(cluster: Arc<dyn Cluster>, config: SessionConfig) -> Self {
        Self::build(cluster, config, SessionId::generate())
    }

    /// Create a context for an existing session.
    ///
    /// `init` attaches to whatever the workers already hold for
    /// `session_id` and bootstraps the rest. Workers holding the session
    /// with a different `p2p` request reject the attach.
    pub fn attach(cluster: Arc<dyn Cluster>, session_id: SessionId, p2p: bool) -> Self {
        let config = SessionConfig {
            p2p,
            ..Default::default()
        };
        Self::build(cluster, config, session_id)
    }

    fn build(cluster: Arc<dyn Cluster>, config: SessionConfig, session_id: SessionId) -> Self {
        Self {
            cluster,
            p2p_requested: config.p2p,
            config,
            session_id,
            state: ContextState::Created,
            descriptor: None,
            capabilities: Capabilities::default(),
            unreleased: Vec::new(),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn p2p_requested(&self) -> bool {
        self.p2p_requested
    }

    /// Workers in rank order.
    ///
    /// Empty until the context has been ready; kept after `destroy`.
    pub fn worker_addresses(&self) -> &[WorkerAddress] {
        match (self.state, &self.descriptor) {
            (ContextState::Ready | ContextState::Destroyed, Some(descriptor)) => {
                descriptor.worker_addresses()
            }
            _ => &[],
        }
    }

    pub fn collective_initialized(&self) -> bool {
        self.state == ContextState::Ready && self.capabilities.collective
    }

    pub fn p2p_initialized(&self) -> bool {
        self.state == ContextState::Ready && self.capabilities.p2p
    }

    /// Session descriptor, once `init` has taken the worker snapshot.
    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// Bootstrap the session on every current worker.
    ///
    /// Calling `init` on a ready context does nothing.
    ///
    /// # Errors
    ///
    /// - [`CommsError::EmptyCluster`] if there are no workers.
    /// - [`CommsError::Bootstrap`] if any worker fails; the context is then
    ///   [`ContextState::Failed`] and no worker holds an entry for it.
    /// - [`CommsError::InvalidState`] after failure or destruction.
    ///
    /// Cancelling the returned future leaves the context
    /// [`ContextState::Failed`]; entries created by the abandoned bootstrap
    /// are torn down in the background.
    pub async fn init(&mut self) -> Result<()> {
        match self.state {
            ContextState::Created => {}
            ContextState::Ready => {
                tracing::debug!("Session {} already initialized", self.session_id);
                return Ok(());
            }
            state => return Err(CommsError::invalid_state("init", state)),
        }

        let descriptor = match self.snapshot().await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!("Cannot form session {}: {}", self.session_id, e);
                self.state = ContextState::Failed;
                return Err(e);
            }
        };

        self.state = ContextState::Initializing;
        self.descriptor = Some(descriptor.clone());

        let (reply, outcome) = oneshot::channel();
        let (ack, acked) = oneshot::channel();
        tokio::spawn(run_bootstrap(
            self.cluster.clone(),
            self.config.clone(),
            descriptor,
            reply,
            acked,
        ));

        let guard = InitGuard {
            session_id: self.session_id,
            state: &mut self.state,
            ack: Some(ack),
        };

        match outcome.await {
            Ok(Ok(bootstrapped)) => {
                self.capabilities = bootstrapped.capabilities;
                guard.finish(ContextState::Ready);
                Ok(())
            }
            Ok(Err(failure)) => {
                self.unreleased = failure.unreleased;
                guard.finish(ContextState::Failed);
                Err(failure.error)
            }
            Err(_) => {
                guard.finish(ContextState::Failed);
                Err(CommsError::transport(format!(
                    "bootstrap task for session {} ended without a result",
                    self.session_id
                )))
            }
        }
    }

    async fn snapshot(&self) -> Result<SessionDescriptor> {
        let workers = self.cluster.worker_addresses().await?;
        SessionDescriptor::with_session_id(self.session_id, self.p2p_requested, workers)
    }

    /// Tear the session down and make the context unusable.
    ///
    /// A ready context tears down every worker. A failed one only revisits
    /// workers its rollback could not clean up; one that never got past
    /// `Created` dispatches nothing.
    ///
    /// The context is [`ContextState::Destroyed`] afterwards even if some
    /// workers fail to release their handles; those are reported as
    /// [`CommsError::TeardownPartialFailure`]. Destroying twice is a no-op.
    pub async fn destroy(&mut self) -> Result<()> {
        let previous = self.state;
        self.state = ContextState::Destroyed;
        self.capabilities = Capabilities::default();

        let targets: Vec<_> = match (previous, &self.descriptor) {
            (ContextState::Ready, Some(descriptor)) => descriptor
                .ranks()
                .map(|(rank, worker)| (rank, worker.clone()))
                .collect(),
            (ContextState::Failed, _) => std::mem::take(&mut self.unreleased),
            _ => Vec::new(),
        };

        if targets.is_empty() {
            if previous != ContextState::Destroyed {
                tracing::debug!("Session {} destroyed from {}", self.session_id, previous);
            }
            return Ok(());
        }

        let failures = Bootstrapper::new(self.cluster.as_ref(), &self.config)
            .teardown(self.session_id, &targets)
            .await;

        if failures.is_empty() {
            tracing::info!("Session {} destroyed", self.session_id);
            return Ok(());
        }

        for failure in &failures {
            tracing::warn!("Teardown of session {} failed on {}", self.session_id, failure);
        }
        Err(CommsError::teardown_partial(self.session_id, failures))
    }

    fn ready_descriptor(&self, operation: &str) -> Result<&SessionDescriptor> {
        match (self.state, &self.descriptor) {
            (ContextState::Ready, Some(descriptor)) => Ok(descriptor),
            (state, _) => Err(CommsError::invalid_state(operation, state)),
        }
    }

    /// Place one task per worker and collect the results in rank order.
    async fn run_on_workers<T>(
        &self,
        operation: &str,
        task: WorkerTask,
        extract: impl Fn(TaskOutput, &WorkerAddress) -> Result<T>,
    ) -> Result<Vec<T>> {
        let descriptor = self.ready_descriptor(operation)?;
        let workers = descriptor.worker_addresses();

        let results = dispatch_all(self.cluster.as_ref(), workers, None, |_| task.clone()).await;

        workers
            .iter()
            .zip(results)
            .map(|(worker, result)| result.and_then(|output| extract(output, worker)))
            .collect()
    }

    /// Resolve every worker's handle for this session.
    pub async fn lookup_handles(&self) -> Result<Vec<HandleInfo>> {
        let task = WorkerTask::Lookup {
            session_id: self.session_id,
        };
        self.run_on_workers("look up handles", task, TaskOutput::into_handle)
            .await
    }

    /// Run the all-reduce check once on every worker.
    pub async fn allreduce(&self) -> Result<Vec<bool>> {
        let task = WorkerTask::Allreduce {
            session_id: self.session_id,
        };
        self.run_on_workers("run allreduce", task, TaskOutput::into_check)
            .await
    }

    /// Run the send/receive check on every worker.
    pub async fn send_recv(&self, n_trials: u32) -> Result<Vec<bool>> {
        let task = WorkerTask::SendRecv {
            session_id: self.session_id,
            n_trials,
        };
        self.run_on_workers("run send/recv", task, TaskOutput::into_check)
            .await
    }
}

/// Keeps a context from staying `Initializing` when `init` is dropped.
///
/// Until [`InitGuard::finish`] runs, the bootstrap task waits on `ack`;
/// dropping the guard drops `ack` and the task rolls back.
struct InitGuard<'a> {
    session_id: SessionId,
    state: &'a mut ContextState,
    ack: Option<oneshot::Sender<()>>,
}

impl InitGuard<'_> {
    fn finish(mut self, state: ContextState) {
        *self.state = state;
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.ack.take().is_some() {
            tracing::warn!("Init of session {} was cancelled", self.session_id);
            *self.state = ContextState::Failed;
        }
    }
}

/// Bootstrap `descriptor` and hand the outcome to `reply`.
///
/// A successful bootstrap is rolled back if nobody takes the outcome, or if
/// the caller goes away before acknowledging it.
async fn run_bootstrap(
    cluster: Arc<dyn Cluster>,
    config: SessionConfig,
    descriptor: SessionDescriptor,
    reply: oneshot::Sender<std::result::Result<Bootstrapped, BootstrapFailure>>,
    acked: oneshot::Receiver<()>,
) {
    let bootstrapper = Bootstrapper::new(cluster.as_ref(), &config);
    let bootstrapped = match bootstrapper.bootstrap(&descriptor).await {
        Ok(bootstrapped) => bootstrapped,
        Err(failure) => {
            let _ = reply.send(Err(failure));
            return;
        }
    };

    let created = bootstrapped.created.clone();
    if reply.send(Ok(bootstrapped)).is_ok() && acked.await.is_ok() {
        return;
    }

    let session_id = descriptor.session_id();
    tracing::warn!("Rolling back session {} after a cancelled init", session_id);
    let unreleased = bootstrapper.rollback(&descriptor, &created).await;
    if !unreleased.is_empty() {
        tracing::warn!(
            "Session {} left on {} worker(s) after a cancelled init",
            session_id,
            unreleased.len()
        );
    }
}

impl fmt::Debug for CommsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommsContext")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("p2p_requested", &self.p2p_requested)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;

    #[tokio::test]
    async fn test_accessors_before_init() {
        let cluster = Arc::new(LocalCluster::new(2));
        let context = CommsContext::new(cluster, true);

        assert_eq!(context.state(), ContextState::Created);
        assert!(context.worker_addresses().is_empty());
        assert!(!context.collective_initialized());
        assert!(!context.p2p_initialized());
        assert!(context.p2p_requested());
        assert!(context.descriptor().is_none());
    }

    #[tokio::test]
    async fn test_init_and_destroy() {
        let cluster = Arc::new(LocalCluster::new(2));
        let mut context = CommsContext::new(cluster.clone(), false);

        context.init().await.unwrap();
        assert_eq!(context.state(), ContextState::Ready);
        assert!(context.collective_initialized());
        assert!(!context.p2p_initialized());
        assert_eq!(context.worker_addresses().len(), 2);

        context.destroy().await.unwrap();
        assert_eq!(context.state(), ContextState::Destroyed);
        assert!(!context.collective_initialized());
        assert_eq!(context.worker_addresses().len(), 2);
        assert_eq!(cluster.fabric().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let cluster = Arc::new(LocalCluster::new(1));
        let context = CommsContext::new(cluster, false);

        let err = context.allreduce().await.unwrap_err();
        assert!(matches!(
            err,
            CommsError::InvalidState {
                state: ContextState::Created,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_destroy_before_init_dispatches_nothing() {
        let cluster = Arc::new(LocalCluster::new(1));
        let mut context = CommsContext::new(cluster, false);

        context.destroy().await.unwrap();
        assert_eq!(context.state(), ContextState::Destroyed);
        assert!(context.worker_addresses().is_empty());

        let err = context.init().await.unwrap_err();
        assert!(matches!(err, CommsError::InvalidState { .. }));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ContextState::Initializing.to_string(), "initializing");
        assert_eq!(ContextState::Failed.to_string(), "failed");
    }
}
