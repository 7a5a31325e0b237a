//! In-process cluster.
//!
//! Every worker is a tokio task that owns a [`Worker`] and drains its own
//! mailbox one task at a time, which gives each worker the same sequential
//! registry semantics as a separate process. All workers share one
//! [`LoopbackFabric`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use super::protocol::{TaskOutput, WorkerTask};
use super::Cluster;
use crate::config::CommsConfig;
use crate::error::{CommsError, Result};
use crate::session::{ClientId, SessionId, WorkerAddress};
use crate::transport::{LoopbackFabric, LoopbackOptions, LoopbackTransport};
use crate::worker::Worker;

type Reply = oneshot::Sender<Result<TaskOutput>>;

struct WorkerSlot {
    address: WorkerAddress,
    mailbox: mpsc::Sender<(WorkerTask, Reply)>,
    task: JoinHandle<usize>,
}

/// Builder for [`LocalCluster`].
#[derive(Debug, Clone)]
pub struct LocalClusterBuilder {
    workers: usize,
    address_prefix: String,
    mailbox_capacity: usize,
    defaults: LoopbackOptions,
    overrides: HashMap<usize, LoopbackOptions>,
}

impl Default for LocalClusterBuilder {
    fn default() -> Self {
        Self {
            workers: 4,
            address_prefix: "local://worker-".to_string(),
            mailbox_capacity: 64,
            defaults: LoopbackOptions::default(),
            overrides: HashMap::new(),
        }
    }
}

impl LocalClusterBuilder {
    /// Builder seeded from the `[cluster]` and `[transport]` sections.
    pub fn from_config(config: &CommsConfig) -> Self {
        Self {
            workers: config.cluster.workers,
            address_prefix: config.cluster.address_prefix.clone(),
            mailbox_capacity: config.cluster.mailbox_capacity,
            defaults: LoopbackOptions::from(&config.transport),
            overrides: HashMap::new(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn address_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.address_prefix = prefix.into();
        self
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Transport options for every worker without an override.
    pub fn transport(mut self, options: LoopbackOptions) -> Self {
        self.defaults = options;
        self
    }

    /// Transport options for the worker at `index`.
    pub fn worker_transport(mut self, index: usize, options: LoopbackOptions) -> Self {
        self.overrides.insert(index, options);
        self
    }

    /// Start the workers. Must be called from within a tokio runtime.
    pub fn build(self) -> LocalCluster {
        let fabric = Arc::new(LoopbackFabric::new());
        let slots = (0..self.workers)
            .map(|i| {
                let address = WorkerAddress::new(format!("{}{}", self.address_prefix, i));
                let options = self
                    .overrides
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                spawn_worker(address, &fabric, options, self.mailbox_capacity)
            })
            .collect();

        tracing::info!("Started local cluster with {} workers", self.workers);

        LocalCluster {
            client_id: ClientId::generate(),
            fabric,
            mailbox_capacity: self.mailbox_capacity,
            workers: RwLock::new(slots),
        }
    }
}

fn spawn_worker(
    address: WorkerAddress,
    fabric: &Arc<LoopbackFabric>,
    options: LoopbackOptions,
    mailbox_capacity: usize,
) -> WorkerSlot {
    let transport = LoopbackTransport::new(fabric.clone(), options);
    let worker = Worker::new(address.clone(), Arc::new(transport));
    let (mailbox, inbox) = mpsc::channel(mailbox_capacity);

    WorkerSlot {
        address,
        mailbox,
        task: tokio::spawn(run_worker(worker, inbox)),
    }
}

async fn run_worker(mut worker: Worker, mut inbox: mpsc::Receiver<(WorkerTask, Reply)>) -> usize {
    tracing::debug!("Worker {} started", worker.address());

    while let Some((task, reply)) = inbox.recv().await {
        let result = worker.handle(task).await;
        // The coordinator may have stopped waiting; the work is done either way.
        let _ = reply.send(result);
    }

    let released = worker.shutdown();
    tracing::debug!(
        "Worker {} stopped ({} sessions released)",
        worker.address(),
        released
    );
    released
}

/// Cluster whose workers run as tasks on the current tokio runtime.
pub struct LocalCluster {
    client_id: ClientId,
    fabric: Arc<LoopbackFabric>,
    mailbox_capacity: usize,
    workers: RwLock<Vec<WorkerSlot>>,
}

impl LocalCluster {
    pub fn builder() -> LocalClusterBuilder {
        LocalClusterBuilder::default()
    }

    /// Start `workers` workers with default transport options.
    pub fn new(workers: usize) -> Self {
        Self::builder().workers(workers).build()
    }

    /// The in-memory network shared by all workers.
    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Start an additional worker at the end of the worker list.
    pub async fn add_worker(&self, address: WorkerAddress, options: LoopbackOptions) -> Result<()> {
        let mut workers = self.workers.write().await;
        if workers.iter().any(|w| w.address == address) {
            return Err(CommsError::duplicate_worker(address));
        }

        tracing::info!("Worker {} joined the local cluster", address);
        workers.push(spawn_worker(address, &self.fabric, options, self.mailbox_capacity));
        Ok(())
    }

    /// Stop a worker. Sessions it still holds are released.
    ///
    /// Returns `false` if no such worker exists.
    pub async fn remove_worker(&self, address: &WorkerAddress) -> bool {
        let slot = {
            let mut workers = self.workers.write().await;
            match workers.iter().position(|w| &w.address == address) {
                Some(pos) => workers.remove(pos),
                None => return false,
            }
        };

        tracing::info!("Worker {} left the local cluster", address);
        stop_worker(slot).await;
        true
    }

    /// Sessions currently registered on `worker`.
    pub async fn registered_sessions(&self, worker: &WorkerAddress) -> Result<Vec<SessionId>> {
        self.submit(worker, WorkerTask::ListSessions)
            .await?
            .into_sessions(worker)
    }

    /// Stop every worker and wait for them to finish.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.workers.write().await.drain(..).collect();
        for slot in slots {
            stop_worker(slot).await;
        }
    }
}

async fn stop_worker(slot: WorkerSlot) {
    let WorkerSlot {
        address,
        mailbox,
        task,
    } = slot;
    // Closing the mailbox ends the worker loop after queued tasks.
    drop(mailbox);
    if let Err(e) = task.await {
        tracing::warn!("Worker {} terminated abnormally: {}", address, e);
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    async fn worker_addresses(&self) -> Result<Vec<WorkerAddress>> {
        let workers = self.workers.read().await;
        Ok(workers.iter().map(|w| w.address.clone()).collect())
    }

    async fn submit(&self, worker: &WorkerAddress, task: WorkerTask) -> Result<TaskOutput> {
        let mailbox = {
            let workers = self.workers.read().await;
            workers
                .iter()
                .find(|w| &w.address == worker)
                .map(|w| w.mailbox.clone())
                .ok_or_else(|| CommsError::cluster(worker.clone(), "unknown worker"))?
        };

        let (reply, response) = oneshot::channel();
        mailbox
            .send((task, reply))
            .await
            .map_err(|_| CommsError::cluster(worker.clone(), "worker is not accepting tasks"))?;

        response
            .await
            .map_err(|_| CommsError::cluster(worker.clone(), "worker dropped the task"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_addresses_follow_worker_order() {
        let cluster = LocalCluster::builder()
            .workers(3)
            .address_prefix("tcp://node-")
            .build();

        let addresses = cluster.worker_addresses().await.unwrap();
        let names: Vec<_> = addresses.iter().map(|a| a.as_str()).collect();
        assert_eq!(names, vec!["tcp://node-0", "tcp://node-1", "tcp://node-2"]);

        cluster.shutdown().await;
        assert_eq!(cluster.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_to_unknown_worker_fails() {
        let cluster = LocalCluster::new(1);
        let err = cluster
            .submit(&WorkerAddress::new("local://nowhere"), WorkerTask::ListSessions)
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::Cluster { .. }));
    }

    #[tokio::test]
    async fn test_add_and_remove_workers() {
        let cluster = LocalCluster::new(1);
        let extra = WorkerAddress::new("local://extra");

        cluster
            .add_worker(extra.clone(), LoopbackOptions::default())
            .await
            .unwrap();
        assert!(cluster
            .add_worker(extra.clone(), LoopbackOptions::default())
            .await
            .is_err());
        assert_eq!(cluster.worker_count().await, 2);

        let addresses = cluster.worker_addresses().await.unwrap();
        assert_eq!(addresses.last(), Some(&extra));

        assert!(cluster.remove_worker(&extra).await);
        assert!(!cluster.remove_worker(&extra).await);
        assert_eq!(cluster.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_fresh_worker_has_no_sessions() {
        let cluster = LocalCluster::new(2);
        for worker in cluster.worker_addresses().await.unwrap() {
            assert!(cluster.registered_sessions(&worker).await.unwrap().is_empty());
        }
    }
}
