// rust/comms-core/src/transport/mod.rs

//! Transport substrate abstractions.
//!
//! The reduction and point-to-point engines are external collaborators. This
//! module only defines the seams through which a worker builds and releases
//! them, plus the [`CommsHandle`] that bundles the per-session components.
//!
//! An in-memory implementation lives in [`loopback`].

pub mod loopback;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::{Rank, SessionId, WorkerAddress};

pub use loopback::{LoopbackFabric, LoopbackOptions, LoopbackTransport};

/// Collective substrate for one rank of a session.
#[async_trait]
pub trait CollectiveComm: Send + Sync {
    /// This component's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> u32;

    /// Element-wise sum across all ranks. Every rank must call this with a
    /// vector of the same length.
    async fn allreduce_sum(&self, values: Vec<i64>) -> Result<Vec<i64>>;

    /// Release the component. Calling this more than once is a no-op.
    fn release(&self) -> Result<()>;
}

/// Direct-transport substrate for one rank of a session.
#[async_trait]
pub trait PointToPoint: Send + Sync {
    /// Send `payload` to `dest` under `tag`.
    async fn send(&self, dest: Rank, tag: u32, payload: Vec<u8>) -> Result<()>;

    /// Receive the next payload sent by `source` under `tag`.
    async fn recv(&self, source: Rank, tag: u32) -> Result<Vec<u8>>;

    /// Release the component. Calling this more than once is a no-op.
    fn release(&self) -> Result<()>;
}

/// Factory for per-session substrate components on one worker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Build the mandatory collective substrate for `rank` within `peers`.
    async fn build_collective(
        &self,
        session_id: SessionId,
        rank: Rank,
        peers: &[WorkerAddress],
    ) -> Result<Arc<dyn CollectiveComm>>;

    /// Try to build the direct-transport substrate. `None` means the
    /// transport is unavailable here, which is not an error.
    async fn try_build_p2p(
        &self,
        session_id: SessionId,
        rank: Rank,
        peers: &[WorkerAddress],
    ) -> Option<Arc<dyn PointToPoint>>;
}

/// Per-worker communication handle for one session.
#[derive(Clone)]
pub struct CommsHandle {
    session_id: SessionId,
    rank: Rank,
    peers: Arc<[WorkerAddress]>,
    collective: Arc<dyn CollectiveComm>,
    p2p: Option<Arc<dyn PointToPoint>>,
}

impl CommsHandle {
    pub fn new(
        session_id: SessionId,
        rank: Rank,
        peers: Vec<WorkerAddress>,
        collective: Arc<dyn CollectiveComm>,
        p2p: Option<Arc<dyn PointToPoint>>,
    ) -> Self {
        Self {
            session_id,
            rank,
            peers: peers.into(),
            collective,
            p2p,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.peers.len() as u32
    }

    pub fn collective(&self) -> &Arc<dyn CollectiveComm> {
        &self.collective
    }

    pub fn p2p(&self) -> Option<&Arc<dyn PointToPoint>> {
        self.p2p.as_ref()
    }

    pub fn has_p2p(&self) -> bool {
        self.p2p.is_some()
    }

    /// Release every component, direct transport first.
    ///
    /// All components are released even if one fails; the first error is
    /// returned.
    pub fn release(&self) -> Result<()> {
        let p2p_result = match &self.p2p {
            Some(p2p) => p2p.release(),
            None => Ok(()),
        };
        let collective_result = self.collective.release();
        p2p_result.and(collective_result)
    }
}

impl fmt::Debug for CommsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommsHandle")
            .field("session_id", &self.session_id)
            .field("rank", &self.rank)
            .field("size", &self.size())
            .field("p2p", &self.has_p2p())
            .finish()
    }
}
