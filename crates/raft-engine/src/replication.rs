//! # replication
//!
//! why: keep every follower moving independently of the others and of the
//! heartbeat cadence
//! relations: owned by engine.rs; rpc results come back as mailbox events
//! what: per-peer progress (one AppendEntries in flight, failure count) and the
//! tasks that carry requests to peers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use raft_core::{Address, AppendEntriesRequest, RequestVoteRequest};
use raft_transport::ProtocolClient;

use crate::event::Event;

/// Leader-side bookkeeping for one follower
#[derive(Debug, Default)]
pub(crate) struct PeerProgress {
    /// An AppendEntries is outstanding; at most one per peer
    pub in_flight: bool,
    /// Consecutive transport failures, reset on any answer
    pub failures: u32,
}

/// Progress for every replication target of the current leadership
#[derive(Debug, Default)]
pub(crate) struct Replicators {
    peers: HashMap<Address, PeerProgress>,
}

impl Replicators {
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Claim the peer's send slot; false when a request is already outstanding
    pub fn try_begin(&mut self, peer: &str) -> bool {
        let progress = self.peers.entry(peer.to_string()).or_default();
        if progress.in_flight {
            return false;
        }
        progress.in_flight = true;
        true
    }

    pub fn failures(&self, peer: &str) -> u32 {
        self.peers.get(peer).map_or(0, |p| p.failures)
    }

    pub fn succeeded(&mut self, peer: &str) {
        let progress = self.peers.entry(peer.to_string()).or_default();
        progress.in_flight = false;
        progress.failures = 0;
    }

    pub fn failed(&mut self, peer: &str) {
        let progress = self.peers.entry(peer.to_string()).or_default();
        progress.in_flight = false;
        progress.failures = progress.failures.saturating_add(1);
    }

    /// Forget peers that are no longer replication targets
    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.peers.retain(|peer, _| keep(peer));
    }
}

/// Send one AppendEntries to `peer` and post the outcome to the mailbox.
///
/// On a transport failure the task waits `retry_after` before reporting,
/// so the engine's immediate resend is already backed off.
pub(crate) fn send_append(
    client: Arc<dyn ProtocolClient>,
    events: mpsc::Sender<Event>,
    peer: Address,
    request: AppendEntriesRequest,
    rpc_timeout: Duration,
    retry_after: Duration,
) {
    let term = request.term;
    let last_sent = request.last_index();
    tokio::spawn(async move {
        let result = tokio::time::timeout(rpc_timeout, client.append_entries(&peer, request)).await;
        let event = match result {
            Ok(Ok(response)) => Event::ReplicationResult {
                term,
                peer,
                last_sent,
                response,
            },
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, retry_ms = retry_after.as_millis() as u64, "append entries failed");
                tokio::time::sleep(retry_after).await;
                Event::ReplicationFailed { term, peer }
            }
            Err(_) => {
                debug!(peer = %peer, "append entries timed out");
                tokio::time::sleep(retry_after).await;
                Event::ReplicationFailed { term, peer }
            }
        };
        let _ = events.send(event).await;
    });
}

/// Ask every voter for its vote concurrently; each answer is posted on its own
pub(crate) fn request_votes(
    client: Arc<dyn ProtocolClient>,
    events: mpsc::Sender<Event>,
    voters: Vec<Address>,
    request: RequestVoteRequest,
    rpc_timeout: Duration,
) {
    for peer in voters {
        let client = client.clone();
        let events = events.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let term = request.term;
            match tokio::time::timeout(rpc_timeout, client.request_vote(&peer, request)).await {
                Ok(Ok(response)) => {
                    let _ = events.send(Event::VoteResult { term, peer, response }).await;
                }
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "vote request failed"),
                Err(_) => debug!(peer = %peer, "vote request timed out"),
            }
        });
    }
}
