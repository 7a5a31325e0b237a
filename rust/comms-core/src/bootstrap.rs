// rust/comms-core/src/bootstrap.rs

//! Two-phase session bootstrap.
//!
//! Phase one places a bootstrap task on every worker of the descriptor,
//! each carrying the full peer list and the worker's rank. Phase two
//! gathers every confirmation before deciding. Any failure fails the whole
//! session and rolls back the entries this bootstrap created.

use std::time::Duration;

use crate::cluster::{dispatch_all, BootstrapRequest, Cluster, TaskOutput, WorkerTask};
use crate::config::SessionConfig;
use crate::error::{CommsError, Result, WorkerFailure};
use crate::session::{Capabilities, Rank, SessionDescriptor, SessionId, WorkerAddress};

/// A failed bootstrap.
#[derive(Debug)]
pub struct BootstrapFailure {
    pub error: CommsError,
    /// Every per-worker failure seen while gathering, including those a
    /// capability mismatch error does not carry.
    pub failures: Vec<WorkerFailure>,
    /// Workers whose rollback teardown failed and may still hold an entry.
    pub unreleased: Vec<(Rank, WorkerAddress)>,
}

/// A successful bootstrap.
#[derive(Debug, Clone)]
pub struct Bootstrapped {
    pub capabilities: Capabilities,
    /// Ranks where this bootstrap stored a new entry rather than attaching.
    pub created: Vec<Rank>,
}

impl From<BootstrapFailure> for CommsError {
    fn from(failure: BootstrapFailure) -> Self {
        failure.error
    }
}

pub struct Bootstrapper<'a> {
    cluster: &'a dyn Cluster,
    bootstrap_timeout: Duration,
    teardown_timeout: Duration,
}

/// What the gather phase learned about the workers.
#[derive(Default)]
struct Gathered {
    /// Ranks where this bootstrap stored a new entry.
    created: Vec<Rank>,
    /// Ranks whose outcome is unknown and may still hold an entry.
    unsettled: Vec<Rank>,
    failures: Vec<WorkerFailure>,
    mismatch: Option<CommsError>,
    p2p_ok: bool,
}

impl<'a> Bootstrapper<'a> {
    pub fn new(cluster: &'a dyn Cluster, config: &SessionConfig) -> Self {
        Self {
            cluster,
            bootstrap_timeout: config.bootstrap_timeout(),
            teardown_timeout: config.teardown_timeout(),
        }
    }

    /// Bring the session up on every worker of `descriptor`.
    ///
    /// # Errors
    ///
    /// The reported error is
    ///
    /// - [`CommsError::Bootstrap`] with one entry per failing worker, or
    /// - [`CommsError::InvalidState`] if a worker already holds the session
    ///   with a different capability request.
    ///
    /// Entries created by this call are rolled back before returning; the
    /// failure lists the workers where that did not succeed.
    pub async fn bootstrap(
        &self,
        descriptor: &SessionDescriptor,
    ) -> std::result::Result<Bootstrapped, BootstrapFailure> {
        let session_id = descriptor.session_id();
        let workers = descriptor.worker_addresses();

        tracing::info!(
            "Bootstrapping session {} on {} workers (p2p requested: {})",
            session_id,
            workers.len(),
            descriptor.p2p_requested()
        );

        let results = dispatch_all(
            self.cluster,
            workers,
            Some(self.bootstrap_timeout),
            |rank| WorkerTask::Bootstrap(BootstrapRequest::for_rank(descriptor, rank)),
        )
        .await;

        let gathered = gather(workers, results);

        if gathered.failures.is_empty() && gathered.mismatch.is_none() {
            let capabilities = Capabilities {
                collective: true,
                p2p: descriptor.p2p_requested() && gathered.p2p_ok,
            };
            tracing::info!(
                "Session {} ready (collective: {}, p2p: {})",
                session_id,
                capabilities.collective,
                capabilities.p2p
            );
            return Ok(Bootstrapped {
                capabilities,
                created: gathered.created,
            });
        }

        for failure in &gathered.failures {
            tracing::warn!("Bootstrap of session {} failed on {}", session_id, failure);
        }

        let mut targets = gathered.created;
        targets.extend(gathered.unsettled);
        targets.sort_unstable();
        let unreleased = self.rollback(descriptor, &targets).await;

        let error = match gathered.mismatch {
            Some(err) => err,
            None => CommsError::bootstrap(session_id, gathered.failures.clone()),
        };
        Err(BootstrapFailure {
            error,
            failures: gathered.failures,
            unreleased,
        })
    }

    /// Tear down the entries held by `ranks` of `descriptor`.
    ///
    /// Returns the workers where the teardown did not succeed.
    pub async fn rollback(
        &self,
        descriptor: &SessionDescriptor,
        ranks: &[Rank],
    ) -> Vec<(Rank, WorkerAddress)> {
        if ranks.is_empty() {
            return Vec::new();
        }

        let session_id = descriptor.session_id();
        tracing::warn!("Rolling back session {} on {} workers", session_id, ranks.len());

        let targets: Vec<_> = ranks
            .iter()
            .filter_map(|&rank| {
                descriptor
                    .worker_addresses()
                    .get(rank as usize)
                    .map(|worker| (rank, worker.clone()))
            })
            .collect();

        self.teardown(session_id, &targets)
            .await
            .into_iter()
            .map(|failure| {
                tracing::warn!("Rollback of session {} incomplete on {}", session_id, failure);
                (failure.rank, failure.worker)
            })
            .collect()
    }

    /// Tear the session down on every `(rank, worker)` target in parallel.
    ///
    /// Workers that never held the session count as success. Returns the
    /// workers whose teardown failed or timed out.
    pub async fn teardown(
        &self,
        session_id: SessionId,
        targets: &[(Rank, WorkerAddress)],
    ) -> Vec<WorkerFailure> {
        let workers: Vec<_> = targets.iter().map(|(_, worker)| worker.clone()).collect();
        let results = dispatch_all(self.cluster, &workers, Some(self.teardown_timeout), |_| {
            WorkerTask::Teardown { session_id }
        })
        .await;

        targets
            .iter()
            .zip(results)
            .filter_map(|((rank, worker), result)| {
                match result.and_then(|output| output.into_removed(worker)) {
                    Ok(removed) => {
                        tracing::debug!(
                            "Worker {} tore down session {} (entry present: {})",
                            worker,
                            session_id,
                            removed
                        );
                        None
                    }
                    Err(e) => Some(WorkerFailure::new(worker.clone(), *rank, e.to_string())),
                }
            })
            .collect()
    }
}

fn gather(workers: &[WorkerAddress], results: Vec<Result<TaskOutput>>) -> Gathered {
    let mut gathered = Gathered {
        p2p_ok: true,
        ..Default::default()
    };

    for (i, (worker, result)) in workers.iter().zip(results).enumerate() {
        let rank = i as Rank;
        let confirmation = match result.and_then(|output| output.into_confirmation(worker)) {
            Ok(confirmation) => confirmation,
            Err(e @ CommsError::InvalidState { .. }) => {
                // The worker kept the existing session untouched.
                gathered.mismatch.get_or_insert(e);
                continue;
            }
            Err(e) => {
                if matches!(e, CommsError::Timeout { .. }) {
                    gathered.unsettled.push(rank);
                }
                gathered
                    .failures
                    .push(WorkerFailure::new(worker.clone(), rank, e.to_string()));
                continue;
            }
        };

        if !confirmation.attached {
            gathered.created.push(rank);
        }

        if confirmation.rank != rank {
            gathered.failures.push(WorkerFailure::new(
                worker.clone(),
                rank,
                format!("confirmed rank {} instead of {}", confirmation.rank, rank),
            ));
        } else if !confirmation.collective_ok {
            gathered.failures.push(WorkerFailure::new(
                worker.clone(),
                rank,
                "collective substrate not initialized",
            ));
        }

        gathered.p2p_ok &= confirmation.p2p_ok;
    }

    gathered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{BootstrapConfirmation, LocalCluster};
    use crate::transport::LoopbackOptions;

    fn addresses(n: usize) -> Vec<WorkerAddress> {
        (0..n)
            .map(|i| WorkerAddress::new(format!("local://worker-{}", i)))
            .collect()
    }

    fn confirmed(rank: Rank, attached: bool) -> Result<TaskOutput> {
        Ok(TaskOutput::Bootstrapped(BootstrapConfirmation {
            rank,
            collective_ok: true,
            p2p_ok: true,
            attached,
        }))
    }

    #[test]
    fn test_gather_all_confirmed() {
        let workers = addresses(3);
        let gathered = gather(
            &workers,
            vec![confirmed(0, false), confirmed(1, false), confirmed(2, true)],
        );

        assert!(gathered.failures.is_empty());
        assert!(gathered.mismatch.is_none());
        assert_eq!(gathered.created, vec![0, 1]);
        assert!(gathered.p2p_ok);
    }

    #[test]
    fn test_gather_flags_rank_mismatch() {
        let workers = addresses(2);
        let gathered = gather(&workers, vec![confirmed(0, false), confirmed(0, false)]);

        assert_eq!(gathered.failures.len(), 1);
        assert_eq!(gathered.failures[0].rank, 1);
        // The entry was created all the same and must be rolled back.
        assert_eq!(gathered.created, vec![0, 1]);
    }

    #[test]
    fn test_gather_separates_timeouts_from_worker_errors() {
        let workers = addresses(3);
        let gathered = gather(
            &workers,
            vec![
                confirmed(0, false),
                Err(CommsError::timeout("bootstrap", Duration::from_millis(5))),
                Err(CommsError::transport("no device")),
            ],
        );

        assert_eq!(gathered.created, vec![0]);
        assert_eq!(gathered.unsettled, vec![1]);
        assert_eq!(gathered.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_created_entries() {
        let cluster = LocalCluster::builder()
            .workers(3)
            .worker_transport(
                2,
                LoopbackOptions {
                    fail_collective: true,
                    ..Default::default()
                },
            )
            .build();
        let descriptor =
            SessionDescriptor::new(false, cluster.worker_addresses().await.unwrap()).unwrap();

        let bootstrapper = Bootstrapper::new(&cluster, &SessionConfig::default());
        let failure = bootstrapper.bootstrap(&descriptor).await.unwrap_err();

        assert!(failure.unreleased.is_empty());
        assert_eq!(failure.failures.len(), 1);
        let failures = failure.error.worker_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].rank, 2);
        for worker in descriptor.worker_addresses() {
            assert!(cluster.registered_sessions(worker).await.unwrap().is_empty());
        }
        assert_eq!(cluster.fabric().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_capability_mismatch_keeps_other_failures() {
        let cluster = LocalCluster::builder()
            .workers(3)
            .worker_transport(
                2,
                LoopbackOptions {
                    fail_collective: true,
                    ..Default::default()
                },
            )
            .build();
        let workers = cluster.worker_addresses().await.unwrap();

        // Worker 0 already holds the session with the direct transport.
        let existing = SessionDescriptor::new(true, workers.clone()).unwrap();
        let session_id = existing.session_id();
        cluster
            .submit(
                &workers[0],
                WorkerTask::Bootstrap(BootstrapRequest::for_rank(&existing, 0)),
            )
            .await
            .unwrap();

        let descriptor = SessionDescriptor::with_session_id(session_id, false, workers.clone())
            .unwrap();
        let bootstrapper = Bootstrapper::new(&cluster, &SessionConfig::default());
        let failure = bootstrapper.bootstrap(&descriptor).await.unwrap_err();

        assert!(matches!(failure.error, CommsError::InvalidState { .. }));
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].rank, 2);
        // Worker 1 was rolled back, worker 0 keeps its session.
        assert_eq!(cluster.registered_sessions(&workers[0]).await.unwrap(), vec![session_id]);
        assert!(cluster.registered_sessions(&workers[1]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_of_unknown_session_succeeds() {
        let cluster = LocalCluster::new(2);
        let targets: Vec<_> = cluster
            .worker_addresses()
            .await
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, w)| (i as Rank, w))
            .collect();

        let bootstrapper = Bootstrapper::new(&cluster, &SessionConfig::default());
        let failures = bootstrapper.teardown(SessionId::generate(), &targets).await;
        assert!(failures.is_empty());
    }
}
