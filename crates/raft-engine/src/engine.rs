//! # engine
//!
//! why: give the sans-io RaftNode a clock, durable storage and a network
//! relations: wraps raft-core's RaftNode, persists through raft-storage, talks to
//! peers through a raft-transport ProtocolClient; driven by handle.rs
//! what: the engine task: mailbox loop, timers, persistence, apply, pending submits

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use raft_core::{Committed, HardState, LogEntry, NodeState, RaftNode, SubmitError};
use raft_storage::Storage;
use raft_transport::ProtocolClient;

use crate::event::Event;
use crate::handle::{RaftHandle, Status};
use crate::replication::{self, Replicators};
use crate::{EngineConfig, Result, StateMachine};

/// Requests from handles queued before senders wait
const MAILBOX: usize = 1024;
/// Outbound rpc results queued before reporting tasks wait
const RESULTS: usize = 1024;

/// Someone waiting for the entry at an index to commit
struct Pending {
    term: u64,
    reply: PendingReply,
}

enum PendingReply {
    Command(oneshot::Sender<std::result::Result<Committed, SubmitError>>),
    Configuration(oneshot::Sender<std::result::Result<u64, SubmitError>>),
}

impl Pending {
    /// The submitter stopped waiting, usually after its timeout
    fn abandoned(&self) -> bool {
        match &self.reply {
            PendingReply::Command(tx) => tx.is_closed(),
            PendingReply::Configuration(tx) => tx.is_closed(),
        }
    }

    fn fail(self, error: SubmitError) {
        match self.reply {
            PendingReply::Command(tx) => {
                let _ = tx.send(Err(error));
            }
            PendingReply::Configuration(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// One consensus engine. Runs as a single task; everything it owns is only
/// touched from that task.
pub(crate) struct Engine {
    node: RaftNode,
    storage: Box<dyn Storage>,
    state_machine: Box<dyn StateMachine>,
    client: Arc<dyn ProtocolClient>,
    config: EngineConfig,

    mailbox: mpsc::Receiver<Event>,
    results: mpsc::Receiver<Event>,
    results_tx: mpsc::Sender<Event>,

    /// what storage currently holds
    saved: HardState,
    saved_commit: u64,

    pending: BTreeMap<u64, Pending>,
    replicators: Replicators,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl Engine {
    /// Restore an engine from `storage` and run it on the current runtime.
    ///
    /// The returned task finishes when the engine is shut down, when every
    /// handle is dropped, or with the storage error that stopped it.
    pub fn spawn(
        config: EngineConfig,
        storage: Box<dyn Storage>,
        state_machine: Box<dyn StateMachine>,
        client: Arc<dyn ProtocolClient>,
    ) -> Result<(RaftHandle, JoinHandle<Result<()>>)> {
        config.validate()?;

        let (current_term, voted_for) = storage.load_term_and_vote()?;
        let entries = storage.load_log()?;
        let commit_index = storage.load_commit_index()?;
        let saved = HardState {
            current_term,
            voted_for,
        };

        let node = RaftNode::with_config(
            config.address.clone(),
            config.members.iter().cloned(),
            config.raft.clone(),
        )
        .restore(saved.clone(), entries, commit_index);

        info!(
            node = %node.id,
            term = node.current_term,
            last_log_index = node.last_log_index(),
            commit_index = node.commit_index,
            "engine starting"
        );

        let (tx, mailbox) = mpsc::channel(MAILBOX);
        let (results_tx, results) = mpsc::channel(RESULTS);
        let now = Instant::now();
        let election_deadline = now + config.raft.random_election_timeout();
        let handle = RaftHandle::new(config.address.clone(), tx, config.submit_timeout());

        let engine = Engine {
            saved_commit: node.commit_index,
            node,
            storage,
            state_machine,
            client,
            config,
            mailbox,
            results,
            results_tx,
            saved,
            pending: BTreeMap::new(),
            replicators: Replicators::default(),
            election_deadline,
            heartbeat_deadline: now,
        };

        Ok((handle, tokio::spawn(engine.run())))
    }

    async fn run(mut self) -> Result<()> {
        // replay what was committed before the restart
        self.apply_committed();

        let outcome = self.event_loop().await;
        if let Err(e) = &outcome {
            error!(node = %self.node.id, error = %e, "engine stopped on error");
        }
        self.fail_pending(SubmitError::Unavailable("engine stopped".into()));
        self.replicators.clear();
        info!(node = %self.node.id, "engine stopped");
        outcome
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let deadline = if self.node.is_leader() {
                self.heartbeat_deadline
            } else {
                self.election_deadline
            };

            tokio::select! {
                event = self.mailbox.recv() => match event {
                    Some(Event::Shutdown { reply }) => {
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(event) => self.step(event)?,
                    None => return Ok(()),
                },
                Some(event) = self.results.recv() => self.step(event)?,
                _ = sleep_until(deadline) => self.tick()?,
            }
        }
    }

    fn step(&mut self, event: Event) -> Result<()> {
        let was_leader = self.node.is_leader();
        let term_before = self.node.current_term;
        match event {
            Event::AppendEntries { request, reply } => {
                let (response, reset) = self.node.handle_append_entries(request);
                if reset {
                    self.reset_election_timer();
                }
                self.settle(was_leader)?;
                let _ = reply.send(response);
            }
            Event::RequestVote { request, reply } => {
                let (response, reset) = self.node.handle_vote_request(&request);
                if reset {
                    self.reset_election_timer();
                }
                self.settle(was_leader)?;
                let _ = reply.send(response);
            }
            Event::Submit { command, reply } => match self.node.append_command(command) {
                Ok(index) => {
                    debug!(node = %self.node.id, index, "command appended");
                    self.pending.insert(
                        index,
                        Pending {
                            term: self.node.current_term,
                            reply: PendingReply::Command(reply),
                        },
                    );
                    self.settle(was_leader)?;
                    self.replicate_all();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Event::ChangeMembership { members, reply } => {
                match self.node.propose_configuration(members) {
                    Ok(index) => {
                        self.pending.insert(
                            index,
                            Pending {
                                term: self.node.current_term,
                                reply: PendingReply::Configuration(reply),
                            },
                        );
                        self.settle(was_leader)?;
                        self.replicate_all();
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Event::VoteResult {
                term,
                peer,
                response,
            } => {
                if term == self.node.current_term || response.term > self.node.current_term {
                    self.node.handle_vote_response(&peer, &response);
                }
                self.settle(was_leader)?;
            }
            Event::ReplicationResult {
                term,
                peer,
                last_sent,
                response,
            } => {
                if response.term > self.node.current_term {
                    self.node.become_follower(response.term);
                } else if term == self.node.current_term && self.node.is_leader() {
                    self.replicators.succeeded(&peer);
                    self.node
                        .handle_append_entries_response(&peer, &response, last_sent);
                    let behind = self.node.next_index.get(&peer).copied().unwrap_or(0)
                        <= self.node.last_log_index();
                    if (behind || !response.success) && self.is_target(&peer) {
                        self.replicate(&peer);
                    }
                }
                self.settle(was_leader)?;
            }
            Event::ReplicationFailed { term, peer } => {
                if term == self.node.current_term && self.node.is_leader() {
                    self.replicators.failed(&peer);
                    if self.is_target(&peer) {
                        self.replicate(&peer);
                    }
                }
            }
            Event::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Event::Entries { reply } => {
                let entries = self
                    .node
                    .log
                    .range(1, self.node.last_log_index())
                    .map(|(_, e)| e.clone())
                    .collect();
                let _ = reply.send(entries);
            }
            // intercepted by the event loop
            Event::Shutdown { .. } => {}
        }
        if self.node.current_term > term_before && !self.node.is_leader() {
            self.reset_election_timer();
        }
        Ok(())
    }

    /// Timer fired: heartbeat as leader, otherwise campaign
    fn tick(&mut self) -> Result<()> {
        self.prune_pending();
        if self.node.is_leader() {
            self.replicate_all();
            self.heartbeat_deadline = Instant::now() + self.config.raft.heartbeat();
            return Ok(());
        }

        self.reset_election_timer();
        if !self.node.can_campaign() {
            return Ok(());
        }

        let request = self.node.start_election();
        self.settle(false)?;
        if self.node.state == NodeState::Candidate {
            replication::request_votes(
                self.client.clone(),
                self.results_tx.clone(),
                self.node.voters(),
                request,
                self.config.rpc_timeout(),
            );
        }
        Ok(())
    }

    /// Persist, apply and react to role changes after the node was stepped
    fn settle(&mut self, was_leader: bool) -> Result<()> {
        self.persist()?;
        self.apply_committed();

        let is_leader = self.node.is_leader();
        if !was_leader && is_leader {
            info!(node = %self.node.id, term = self.node.current_term, "leading");
            self.replicators.clear();
            self.replicate_all();
            self.heartbeat_deadline = Instant::now() + self.config.raft.heartbeat();
        } else if was_leader && !is_leader {
            info!(node = %self.node.id, term = self.node.current_term, "lost leadership");
            self.replicators.clear();
            self.reset_election_timer();
            self.fail_pending(SubmitError::not_leader(self.node.leader_id.clone()));
        } else if is_leader {
            let targets = self.node.replication_targets();
            self.replicators.retain(|peer| targets.contains(peer));
        }
        Ok(())
    }

    /// Make term, vote, log changes and commit index durable
    fn persist(&mut self) -> Result<()> {
        let hard_state = self.node.hard_state();
        if hard_state != self.saved {
            self.storage
                .save_term_and_vote(hard_state.current_term, hard_state.voted_for.as_deref())?;
            self.saved = hard_state;
        }

        {
            let write = self.node.log.unstable();
            if !write.is_empty() {
                self.storage.apply_log_write(&write)?;
            }
        }
        self.node.log.mark_stable();

        if self.node.commit_index != self.saved_commit {
            self.storage.save_commit_index(self.node.commit_index)?;
            self.saved_commit = self.node.commit_index;
        }
        Ok(())
    }

    /// Hand newly committed commands to the state machine and answer their submitters
    fn apply_committed(&mut self) {
        for (index, entry) in self.node.get_entries_to_apply() {
            let output = match &entry {
                LogEntry::Command { payload, .. } => self.state_machine.apply(index, payload),
                _ => Vec::new(),
            };

            let Some(pending) = self.pending.remove(&index) else {
                continue;
            };
            if pending.term != entry.term() {
                // our entry was overwritten by another leader's
                pending.fail(SubmitError::not_leader(self.node.leader_id.clone()));
                continue;
            }
            match pending.reply {
                PendingReply::Command(tx) => {
                    let _ = tx.send(Ok(Committed { index, output }));
                }
                PendingReply::Configuration(tx) => {
                    let _ = tx.send(Ok(index));
                }
            }
        }
    }

    fn prune_pending(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, pending| !pending.abandoned());
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(node = %self.node.id, dropped, "dropped abandoned submissions");
        }
    }

    fn fail_pending(&mut self, error: SubmitError) {
        if !self.pending.is_empty() {
            warn!(node = %self.node.id, count = self.pending.len(), error = %error, "failing pending submissions");
        }
        for (_, pending) in std::mem::take(&mut self.pending) {
            pending.fail(error.clone());
        }
    }

    fn is_target(&self, peer: &str) -> bool {
        self.node.replication_targets().contains(peer)
    }

    fn replicate_all(&mut self) {
        for peer in self.node.replication_targets() {
            self.replicate(&peer);
        }
    }

    /// Send the next AppendEntries to `peer` unless one is already outstanding
    fn replicate(&mut self, peer: &str) {
        if !self.node.is_leader() || !self.replicators.try_begin(peer) {
            return;
        }
        let Some(request) = self.node.create_append_entries(peer) else {
            self.replicators.succeeded(peer);
            return;
        };
        let retry_after = self.config.backoff(self.replicators.failures(peer));
        replication::send_append(
            self.client.clone(),
            self.results_tx.clone(),
            peer.to_string(),
            request,
            self.config.rpc_timeout(),
            retry_after,
        );
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.raft.random_election_timeout();
    }

    fn status(&self) -> Status {
        Status {
            address: self.node.id.clone(),
            term: self.node.current_term,
            role: self.node.state,
            leader: self.node.leader_id.clone(),
            commit_index: self.node.commit_index,
            last_applied: self.node.last_applied,
            last_log_index: self.node.last_log_index(),
            pending: self.pending.len(),
            members: self.node.membership.members().clone(),
        }
    }
}
