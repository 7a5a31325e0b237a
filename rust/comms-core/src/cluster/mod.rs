//! Cluster and task-placement layer.
//!
//! This module provides the seam between the coordinator and the worker
//! processes:
//!
//! - [`Cluster`]: worker discovery and placement of tasks on named workers
//! - [`protocol`]: the task and result messages
//! - [`LocalCluster`]: an in-process cluster whose workers are tokio tasks
//!
//! [`dispatch_all`] implements the fire-all-then-gather-all pattern used by
//! bootstrap, teardown and the operation checks.

mod local;
pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::{CommsError, Result};
use crate::session::{ClientId, Rank, WorkerAddress};

pub use local::{LocalCluster, LocalClusterBuilder};
pub use protocol::{
    BootstrapConfirmation, BootstrapRequest, HandleInfo, TaskOutput, WorkerTask,
};

/// Trait for cluster layer implementations.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Identity of the coordinating client connected to this cluster.
    fn client_id(&self) -> ClientId;

    /// Current workers, in a stable order.
    async fn worker_addresses(&self) -> Result<Vec<WorkerAddress>>;

    /// Run `task` on `worker` and wait for its result.
    ///
    /// Task-side failures are returned as errors.
    async fn submit(&self, worker: &WorkerAddress, task: WorkerTask) -> Result<TaskOutput>;
}

/// Submit one task per worker and wait for all of them.
///
/// `task_for` receives each worker's rank (its index in `workers`). Results
/// come back in the same order as `workers`. With a `timeout`, a worker that
/// does not answer in time yields [`CommsError::Timeout`] for its slot while
/// the others are still collected.
pub async fn dispatch_all<F>(
    cluster: &dyn Cluster,
    workers: &[WorkerAddress],
    timeout: Option<Duration>,
    mut task_for: F,
) -> Vec<Result<TaskOutput>>
where
    F: FnMut(Rank) -> WorkerTask,
{
    let pending = workers.iter().enumerate().map(|(i, worker)| {
        let rank = i as Rank;
        let task = task_for(rank);
        async move {
            let name = task.name();
            tracing::debug!("Dispatching {} to {} (rank {})", name, worker, rank);

            let submitted = cluster.submit(worker, task);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, submitted)
                    .await
                    .unwrap_or_else(|_| {
                        Err(CommsError::timeout(
                            format!("{} on worker '{}'", name, worker),
                            limit,
                        ))
                    }),
                None => submitted.await,
            }
        }
    });

    // Collect eagerly so every task is built before any is awaited.
    let pending: Vec<_> = pending.collect();
    join_all(pending).await
}
