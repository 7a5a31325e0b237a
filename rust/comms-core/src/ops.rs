// rust/comms-core/src/ops.rs

//! Collective-operation checks run on workers.
//!
//! Both checks resolve nothing themselves: they receive a handle already
//! looked up from the worker registry and delegate to its components.

use crate::error::{CommsError, Result};
use crate::session::Rank;
use crate::transport::CommsHandle;

/// Every rank contributes `1`; the reduced value must equal the session size.
pub async fn perform_allreduce_check(handle: &CommsHandle) -> Result<bool> {
    let reduced = handle.collective().allreduce_sum(vec![1]).await?;
    let expected = handle.size() as i64;

    let ok = reduced.first() == Some(&expected);
    if !ok {
        tracing::warn!(
            "Allreduce check failed on rank {} of session {}: got {:?}, expected [{}]",
            handle.rank(),
            handle.session_id(),
            reduced,
            expected
        );
    }
    Ok(ok)
}

/// Exchange one tagged message with every other rank per trial and verify
/// where each received message came from.
///
/// # Errors
///
/// Fails with a transport error if the handle has no direct-transport
/// component.
pub async fn perform_send_recv_check(handle: &CommsHandle, n_trials: u32) -> Result<bool> {
    let p2p = handle.p2p().ok_or_else(|| {
        CommsError::transport(format!(
            "point-to-point substrate not initialized for session {}",
            handle.session_id()
        ))
    })?;

    let rank = handle.rank();
    let size = handle.size();

    for trial in 0..n_trials {
        for peer in (0..size).filter(|&p| p != rank) {
            p2p.send(peer, trial, encode(rank, trial)).await?;
        }

        for peer in (0..size).filter(|&p| p != rank) {
            let payload = p2p.recv(peer, trial).await?;
            if decode(&payload) != Some((peer, trial)) {
                tracing::warn!(
                    "Send/recv check failed on rank {} of session {}: bad payload from rank {} in trial {}",
                    rank,
                    handle.session_id(),
                    peer,
                    trial
                );
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn encode(rank: Rank, trial: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&rank.to_le_bytes());
    payload.extend_from_slice(&trial.to_le_bytes());
    payload
}

fn decode(payload: &[u8]) -> Option<(Rank, u32)> {
    if payload.len() != 8 {
        return None;
    }
    let rank = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let trial = u32::from_le_bytes(payload[4..8].try_into().ok()?);
    Some((rank, trial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::session::{SessionId, WorkerAddress};
    use crate::transport::{LoopbackFabric, LoopbackOptions, LoopbackTransport, Transport};

    async fn handles(n: u32, p2p: bool) -> Vec<CommsHandle> {
        let fabric = Arc::new(LoopbackFabric::new());
        let transport = LoopbackTransport::new(fabric, LoopbackOptions::default());
        let session = SessionId::generate();
        let peers: Vec<_> = (0..n)
            .map(|i| WorkerAddress::new(format!("local://worker-{}", i)))
            .collect();

        let mut handles = Vec::new();
        for rank in 0..n {
            let collective = transport
                .build_collective(session, rank, &peers)
                .await
                .unwrap();
            let endpoint = if p2p {
                transport.try_build_p2p(session, rank, &peers).await
            } else {
                None
            };
            handles.push(CommsHandle::new(session, rank, peers.clone(), collective, endpoint));
        }
        handles
    }

    #[tokio::test]
    async fn test_allreduce_check_all_ranks() {
        let handles = handles(4, false).await;
        let results =
            futures::future::join_all(handles.iter().map(|h| perform_allreduce_check(h))).await;

        assert!(results.into_iter().all(|r| r.unwrap()));
    }

    #[tokio::test]
    async fn test_send_recv_check_all_ranks() {
        let handles = handles(3, true).await;
        let results = futures::future::join_all(
            handles.iter().map(|h| perform_send_recv_check(h, 4)),
        )
        .await;

        assert!(results.into_iter().all(|r| r.unwrap()));
    }

    #[tokio::test]
    async fn test_send_recv_requires_p2p() {
        let handles = handles(1, false).await;
        let err = perform_send_recv_check(&handles[0], 1).await.unwrap_err();
        assert!(err.to_string().contains("point-to-point"));
    }

    #[test]
    fn test_payload_decoding() {
        assert_eq!(decode(&encode(3, 11)), Some((3, 11)));
        assert_eq!(decode(&[1, 2, 3]), None);
    }
}
