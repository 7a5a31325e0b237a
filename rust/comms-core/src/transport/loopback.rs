// rust/comms-core/src/transport/loopback.rs

//! In-memory transport shared by workers of a [`LocalCluster`].
//!
//! A [`LoopbackFabric`] plays the role of the network: every session that
//! builds a collective component gets a group on the fabric, and the group
//! disappears again once every rank has released its components. Collective
//! rounds rendezvous on a barrier; point-to-point messages go through one
//! mailbox per rank.
//!
//! [`LocalCluster`]: crate::cluster::LocalCluster

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Barrier};
use tokio::time::Instant;

use super::{CollectiveComm, PointToPoint, Transport};
use crate::config::TransportConfig;
use crate::error::{CommsError, Result};
use crate::session::{Rank, SessionId, WorkerAddress};

/// Per-worker behaviour of a [`LoopbackTransport`].
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Whether the direct transport can be built on this worker.
    pub p2p_available: bool,
    /// Make collective construction fail on this worker.
    pub fail_collective: bool,
    /// Make component release report an error on this worker.
    pub fail_release: bool,
    /// Delay applied before building the collective component.
    pub build_delay: Option<Duration>,
    /// Upper bound for a single collective round or receive.
    pub op_timeout: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            p2p_available: true,
            fail_collective: false,
            fail_release: false,
            build_delay: None,
            op_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&TransportConfig> for LoopbackOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            p2p_available: config.p2p_available,
            op_timeout: config.op_timeout(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Substrate {
    Collective,
    P2p,
}

struct Envelope {
    source: Rank,
    tag: u32,
    payload: Vec<u8>,
}

struct Inbox {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    // Messages that arrived ahead of the (source, tag) being waited for.
    pending: VecDeque<Envelope>,
}

#[derive(Default)]
struct GroupState {
    collective: HashSet<Rank>,
    p2p: HashSet<Rank>,
    rounds: HashMap<u64, Vec<Option<Vec<i64>>>>,
}

impl GroupState {
    fn members_mut(&mut self, substrate: Substrate) -> &mut HashSet<Rank> {
        match substrate {
            Substrate::Collective => &mut self.collective,
            Substrate::P2p => &mut self.p2p,
        }
    }

    fn is_empty(&self) -> bool {
        self.collective.is_empty() && self.p2p.is_empty()
    }
}

struct Group {
    size: u32,
    barrier: Barrier,
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    inboxes: Vec<tokio::sync::Mutex<Inbox>>,
    state: Mutex<GroupState>,
    // Set once a rank gives up on a rendezvous. The barrier still counts
    // that arrival, so later rounds can no longer be paired up.
    broken: AtomicBool,
}

impl Group {
    fn new(size: u32) -> Self {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| {
                let (sender, receiver) = mpsc::unbounded_channel();
                let inbox = Inbox {
                    receiver,
                    pending: VecDeque::new(),
                };
                (sender, tokio::sync::Mutex::new(inbox))
            })
            .unzip();

        Self {
            size,
            barrier: Barrier::new(size as usize),
            senders,
            inboxes,
            state: Mutex::new(GroupState::default()),
            broken: AtomicBool::new(false),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| CommsError::transport("loopback group state poisoned"))
    }
}

/// Shared in-memory network for loopback transports.
#[derive(Default)]
pub struct LoopbackFabric {
    groups: Mutex<HashMap<SessionId, Arc<Group>>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions that still have at least one live component.
    pub fn active_sessions(&self) -> usize {
        self.groups.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether any component of `session_id` is still live.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.groups
            .lock()
            .map(|g| g.contains_key(&session_id))
            .unwrap_or(false)
    }

    fn groups(&self) -> Result<MutexGuard<'_, HashMap<SessionId, Arc<Group>>>> {
        self.groups
            .lock()
            .map_err(|_| CommsError::transport("loopback fabric poisoned"))
    }

    fn join(
        &self,
        session_id: SessionId,
        rank: Rank,
        size: u32,
        substrate: Substrate,
    ) -> Result<Arc<Group>> {
        if rank >= size {
            return Err(CommsError::transport(format!(
                "rank {} is outside session {} of size {}",
                rank, session_id, size
            )));
        }

        let mut groups = self.groups()?;
        let group = match substrate {
            Substrate::Collective => groups
                .entry(session_id)
                .or_insert_with(|| Arc::new(Group::new(size)))
                .clone(),
            Substrate::P2p => groups.get(&session_id).cloned().ok_or_else(|| {
                CommsError::transport(format!(
                    "session {} has no collective group to attach to",
                    session_id
                ))
            })?,
        };

        if group.size != size {
            return Err(CommsError::transport(format!(
                "session {} was formed with {} ranks, not {}",
                session_id, group.size, size
            )));
        }

        {
            let mut state = group.state()?;
            if !state.members_mut(substrate).insert(rank) {
                return Err(CommsError::transport(format!(
                    "rank {} already joined session {}",
                    rank, session_id
                )));
            }
        }

        Ok(group)
    }

    fn leave(&self, session_id: SessionId, rank: Rank, substrate: Substrate) {
        let Ok(mut groups) = self.groups.lock() else {
            return;
        };

        let now_empty = match groups.get(&session_id) {
            Some(group) => match group.state.lock() {
                Ok(mut state) => {
                    state.members_mut(substrate).remove(&rank);
                    state.is_empty()
                }
                Err(_) => true,
            },
            None => false,
        };

        if now_empty {
            groups.remove(&session_id);
        }
    }
}

struct LoopbackCollective {
    fabric: Arc<LoopbackFabric>,
    session_id: SessionId,
    rank: Rank,
    group: Arc<Group>,
    round: AtomicU64,
    released: AtomicBool,
    op_timeout: Duration,
    fail_release: bool,
}

impl LoopbackCollective {
    fn ensure_active(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CommsError::transport(format!(
                "collective for session {} rank {} has been released",
                self.session_id, self.rank
            )));
        }
        Ok(())
    }

    fn ensure_intact(&self) -> Result<()> {
        if self.group.broken.load(Ordering::SeqCst) {
            return Err(CommsError::transport(format!(
                "collective group of session {} is broken by an earlier timed-out round",
                self.session_id
            )));
        }
        Ok(())
    }

    /// Wait for every rank; returns whether this rank is the barrier leader.
    async fn barrier(&self) -> Result<bool> {
        match tokio::time::timeout(self.op_timeout, self.group.barrier.wait()).await {
            Ok(result) => {
                self.ensure_intact()?;
                Ok(result.is_leader())
            }
            Err(_) => {
                self.group.broken.store(true, Ordering::SeqCst);
                tracing::warn!(
                    "Allreduce on session {} timed out on rank {}, group is now broken",
                    self.session_id,
                    self.rank
                );
                Err(CommsError::timeout(
                    format!("allreduce on session {} rank {}", self.session_id, self.rank),
                    self.op_timeout,
                ))
            }
        }
    }

    fn reduce_round(&self, round: u64) -> Result<Vec<i64>> {
        let state = self.group.state()?;
        let slots = state.rounds.get(&round).ok_or_else(|| {
            CommsError::transport(format!("allreduce round {} vanished", round))
        })?;

        let expected_len = slots.iter().flatten().next().map(Vec::len).unwrap_or(0);
        let mut reduced = vec![0i64; expected_len];

        for (rank, slot) in slots.iter().enumerate() {
            let values = slot.as_ref().ok_or_else(|| {
                CommsError::transport(format!(
                    "rank {} did not contribute to allreduce round {}",
                    rank, round
                ))
            })?;
            if values.len() != expected_len {
                return Err(CommsError::transport(format!(
                    "rank {} contributed {} values, expected {}",
                    rank,
                    values.len(),
                    expected_len
                )));
            }
            for (acc, value) in reduced.iter_mut().zip(values) {
                *acc = acc.checked_add(*value).ok_or_else(|| {
                    CommsError::transport(format!("allreduce round {} overflowed i64", round))
                })?;
            }
        }

        Ok(reduced)
    }
}

#[async_trait]
impl CollectiveComm for LoopbackCollective {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.group.size
    }

    async fn allreduce_sum(&self, values: Vec<i64>) -> Result<Vec<i64>> {
        self.ensure_active()?;
        self.ensure_intact()?;

        let round = self.round.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.group.state()?;
            let size = self.group.size as usize;
            let slots = state
                .rounds
                .entry(round)
                .or_insert_with(|| vec![None; size]);
            slots[self.rank as usize] = Some(values);
        }

        self.barrier().await?;
        let reduced = self.reduce_round(round);

        // Second rendezvous keeps the round alive until every rank has read it.
        if self.barrier().await? {
            if let Ok(mut state) = self.group.state() {
                state.rounds.remove(&round);
            }
        }

        reduced
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.fabric
            .leave(self.session_id, self.rank, Substrate::Collective);

        if self.fail_release {
            return Err(CommsError::transport(format!(
                "failed to release collective for session {} rank {}",
                self.session_id, self.rank
            )));
        }
        Ok(())
    }
}

struct LoopbackEndpoint {
    fabric: Arc<LoopbackFabric>,
    session_id: SessionId,
    rank: Rank,
    group: Arc<Group>,
    released: AtomicBool,
    op_timeout: Duration,
}

impl LoopbackEndpoint {
    fn ensure_active(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CommsError::transport(format!(
                "endpoint for session {} rank {} has been released",
                self.session_id, self.rank
            )));
        }
        Ok(())
    }

    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer >= self.group.size {
            return Err(CommsError::transport(format!(
                "rank {} is outside session {} of size {}",
                peer, self.session_id, self.group.size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PointToPoint for LoopbackEndpoint {
    async fn send(&self, dest: Rank, tag: u32, payload: Vec<u8>) -> Result<()> {
        self.ensure_active()?;
        self.check_peer(dest)?;

        let envelope = Envelope {
            source: self.rank,
            tag,
            payload,
        };
        self.group.senders[dest as usize]
            .send(envelope)
            .map_err(|_| CommsError::transport(format!("mailbox of rank {} is closed", dest)))
    }

    async fn recv(&self, source: Rank, tag: u32) -> Result<Vec<u8>> {
        self.ensure_active()?;
        self.check_peer(source)?;

        let deadline = Instant::now() + self.op_timeout;
        let mut inbox = self.group.inboxes[self.rank as usize].lock().await;

        if let Some(pos) = inbox
            .pending
            .iter()
            .position(|e| e.source == source && e.tag == tag)
        {
            if let Some(envelope) = inbox.pending.remove(pos) {
                return Ok(envelope.payload);
            }
        }

        loop {
            let received = tokio::time::timeout_at(deadline, inbox.receiver.recv()).await;
            match received {
                Ok(Some(envelope)) if envelope.source == source && envelope.tag == tag => {
                    return Ok(envelope.payload);
                }
                Ok(Some(envelope)) => inbox.pending.push_back(envelope),
                Ok(None) => {
                    return Err(CommsError::transport(format!(
                        "mailbox of rank {} is closed",
                        self.rank
                    )));
                }
                Err(_) => {
                    return Err(CommsError::timeout(
                        format!(
                            "recv from rank {} (tag {}) on session {}",
                            source, tag, self.session_id
                        ),
                        self.op_timeout,
                    ));
                }
            }
        }
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.fabric.leave(self.session_id, self.rank, Substrate::P2p);
        Ok(())
    }
}

/// [`Transport`] backed by a shared [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackTransport {
    fabric: Arc<LoopbackFabric>,
    options: LoopbackOptions,
}

impl LoopbackTransport {
    pub fn new(fabric: Arc<LoopbackFabric>, options: LoopbackOptions) -> Self {
        Self { fabric, options }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn build_collective(
        &self,
        session_id: SessionId,
        rank: Rank,
        peers: &[WorkerAddress],
    ) -> Result<Arc<dyn CollectiveComm>> {
        if let Some(delay) = self.options.build_delay {
            tokio::time::sleep(delay).await;
        }
        if self.options.fail_collective {
            return Err(CommsError::transport(format!(
                "collective substrate unavailable for session {} rank {}",
                session_id, rank
            )));
        }

        let group = self
            .fabric
            .join(session_id, rank, peers.len() as u32, Substrate::Collective)?;

        Ok(Arc::new(LoopbackCollective {
            fabric: self.fabric.clone(),
            session_id,
            rank,
            group,
            round: AtomicU64::new(0),
            released: AtomicBool::new(false),
            op_timeout: self.options.op_timeout,
            fail_release: self.options.fail_release,
        }))
    }

    async fn try_build_p2p(
        &self,
        session_id: SessionId,
        rank: Rank,
        peers: &[WorkerAddress],
    ) -> Option<Arc<dyn PointToPoint>> {
        if !self.options.p2p_available {
            return None;
        }

        match self
            .fabric
            .join(session_id, rank, peers.len() as u32, Substrate::P2p)
        {
            Ok(group) => Some(Arc::new(LoopbackEndpoint {
                fabric: self.fabric.clone(),
                session_id,
                rank,
                group,
                released: AtomicBool::new(false),
                op_timeout: self.options.op_timeout,
            })),
            Err(e) => {
                tracing::debug!("Direct transport unavailable for session {}: {}", session_id, e);
                None
            }
        }
    }
}
