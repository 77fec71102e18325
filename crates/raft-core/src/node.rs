//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management,
//! membership.rs for quorum; driven by raft-engine which owns timers and i/o
//! what: NodeState enum, RaftConfig, RaftNode election/replication/commit logic

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::message::Rejection;
use crate::{
    Address, AppendEntriesRequest, AppendEntriesResponse, ClusterConfiguration, Log, LogEntry,
    RequestVoteRequest, RequestVoteResponse, SubmitError,
};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Timing and batching knobs for a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout, in milliseconds
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout, in milliseconds
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats, in milliseconds
    pub heartbeat_interval: u64,
    /// Maximum entries carried by one AppendEntries
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    /// Pick a fresh election timeout; randomizing it keeps split votes rare
    pub fn random_election_timeout(&self) -> Duration {
        let max = self.election_timeout_max.max(self.election_timeout_min);
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// The part of node state that must survive a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<Address>,
}

/// A single Raft node in the cluster
///
/// Pure state: no clocks, no sockets. Every handler returns what the caller
/// must send and whether the election timer must be reset.
#[derive(Debug)]
pub struct RaftNode {
    /// Address identifying this node
    pub id: Address,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Candidate that received our vote in the current term (if any)
    pub voted_for: Option<Address>,
    /// The replicated log
    pub log: Log,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the application
    pub last_applied: u64,
    /// Committed cluster configuration
    pub membership: ClusterConfiguration,
    /// Leader of the current term, when known
    pub leader_id: Option<Address>,
    /// Votes collected while Candidate
    pub votes_received: BTreeSet<Address>,
    /// Leader-only: next index to send to each peer
    pub next_index: HashMap<Address, u64>,
    /// Leader-only: highest index known replicated on each peer
    pub match_index: HashMap<Address, u64>,
    pub config: RaftConfig,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new<I, A>(id: impl Into<Address>, members: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self::with_config(id, members, RaftConfig::default())
    }

    /// Create a new node with custom timing
    pub fn with_config<I, A>(id: impl Into<Address>, members: I, config: RaftConfig) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self {
            id: id.into(),
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            membership: ClusterConfiguration::new(members),
            leader_id: None,
            votes_received: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            config,
        }
    }

    /// Rebuild a node from durable state after a restart.
    ///
    /// The committed configuration is the newest Configuration entry at or
    /// below `commit_index`, falling back to the bootstrap members. Entries up
    /// to `commit_index` are re-applied, since `last_applied` starts at 0.
    pub fn restore(
        mut self,
        hard_state: HardState,
        entries: Vec<LogEntry>,
        commit_index: u64,
    ) -> Self {
        self.current_term = hard_state.current_term;
        self.voted_for = hard_state.voted_for;
        self.log = Log::from_stable(entries);
        self.commit_index = commit_index.min(self.log.last_index());
        self.apply_configurations(0, self.commit_index);
        self
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- quorum --

    pub fn quorum_size(&self) -> usize {
        self.membership.quorum_size()
    }

    /// Whether the votes received so far form a majority of the committed configuration
    pub fn has_quorum(&self) -> bool {
        self.membership.is_quorum(&self.votes_received)
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.entry_at(index)
    }

    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index)
    }

    /// The newest appended-but-uncommitted configuration, with its index
    pub fn pending_configuration(&self) -> Option<(u64, &BTreeSet<Address>)> {
        self.log
            .range(self.commit_index + 1, self.log.last_index())
            .filter_map(|(i, e)| e.members().map(|m| (i, m)))
            .last()
    }

    /// Peers the leader replicates to: committed members plus any pending
    /// members, so a joining node catches up before it counts toward quorum
    pub fn replication_targets(&self) -> BTreeSet<Address> {
        let mut targets: BTreeSet<Address> = self.membership.members().clone();
        if let Some((_, pending)) = self.pending_configuration() {
            targets.extend(pending.iter().cloned());
        }
        targets.remove(&self.id);
        targets
    }

    /// Committed members this node asks for votes
    pub fn voters(&self) -> Vec<Address> {
        self.membership.peers(&self.id).cloned().collect()
    }

    /// A node outside the committed configuration never campaigns
    pub fn can_campaign(&self) -> bool {
        self.membership.contains(&self.id)
    }

    // -- elections --

    /// Become a candidate for the next term and build the vote request
    pub fn start_election(&mut self) -> RequestVoteRequest {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.next_index.clear();
        self.match_index.clear();

        info!(node = %self.id, term = self.current_term, "starting election");

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Answer a vote request; the bool says whether to reset the election timer
    pub fn handle_vote_request(&mut self, req: &RequestVoteRequest) -> (RequestVoteResponse, bool) {
        if req.term < self.current_term {
            debug!(node = %self.id, candidate = %req.candidate_id, term = req.term, "rejecting stale vote request");
            return (self.vote_response(false), false);
        }
        if req.term > self.current_term {
            self.become_follower(req.term);
        }

        let log_ok = (req.last_log_term, req.last_log_index)
            >= (self.last_log_term(), self.last_log_index());
        let can_vote = match &self.voted_for {
            None => true,
            Some(v) => *v == req.candidate_id,
        };

        if log_ok && can_vote {
            self.voted_for = Some(req.candidate_id.clone());
            debug!(node = %self.id, candidate = %req.candidate_id, term = req.term, "granting vote");
            (self.vote_response(true), true)
        } else {
            (self.vote_response(false), false)
        }
    }

    fn vote_response(&self, vote_granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote response; returns true when it made this node leader
    pub fn handle_vote_response(&mut self, from: &str, resp: &RequestVoteResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term {
            return false;
        }
        if resp.vote_granted {
            self.votes_received.insert(from.to_string());
            if self.has_quorum() {
                self.become_leader();
                return true;
            }
        }
        false
    }

    /// Take leadership: reset follower progress and write a NoOp for this term
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.replication_targets() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, 0);
        }

        info!(node = %self.id, term = self.current_term, "became leader");
        self.log.append([LogEntry::noop(self.current_term)]);
        self.maybe_advance_commit();
    }

    /// Revert to follower, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node = %self.id, term = self.current_term, from = ?self.state, "stepping down");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    // -- leader writes --

    /// Append a client command; returns its index
    pub fn append_command(&mut self, payload: Vec<u8>) -> Result<u64, SubmitError> {
        self.ensure_leader()?;
        let index = self.log.append([LogEntry::command(self.current_term, payload)]);
        self.maybe_advance_commit();
        Ok(index)
    }

    /// Append a new membership; only one may be outstanding at a time
    pub fn propose_configuration(&mut self, members: BTreeSet<Address>) -> Result<u64, SubmitError> {
        self.ensure_leader()?;
        if self.pending_configuration().is_some() {
            return Err(SubmitError::ConfigurationChangeInProgress);
        }
        let index = self.log.append([LogEntry::configuration(self.current_term, members)]);
        for peer in self.replication_targets() {
            self.next_index.entry(peer.clone()).or_insert(index);
            self.match_index.entry(peer).or_insert(0);
        }
        info!(node = %self.id, index, "proposed configuration change");
        self.maybe_advance_commit();
        Ok(index)
    }

    fn ensure_leader(&self) -> Result<(), SubmitError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(SubmitError::not_leader(self.leader_id.clone()))
        }
    }

    /// Build the next AppendEntries for `peer` from its `next_index`
    pub fn create_append_entries(&mut self, peer: &str) -> Option<AppendEntriesRequest> {
        if !self.is_leader() {
            return None;
        }
        let last = self.last_log_index();
        let next = *self
            .next_index
            .entry(peer.to_string())
            .or_insert(last + 1);
        self.match_index.entry(peer.to_string()).or_insert(0);

        let prev_log_index = next - 1;
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: self
                .log
                .slice(next, self.config.max_entries_per_append)
                .to_vec(),
            leader_commit: self.commit_index,
        })
    }

    // -- follower side --

    /// Apply an AppendEntries; the bool says whether to reset the election timer
    pub fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        if req.term < self.current_term {
            return (AppendEntriesResponse::stale_term(self.current_term), false);
        }
        self.become_follower(req.term);
        self.leader_id = Some(req.leader_id.clone());

        // consistency check on the entry preceding the new ones
        if req.prev_log_index > self.last_log_index() {
            return (
                AppendEntriesResponse::inconsistent(self.current_term, self.last_log_index() + 1),
                true,
            );
        }
        if req.prev_log_index > 0 {
            let local_term = self.log.term_at(req.prev_log_index);
            if local_term != req.prev_log_term {
                let hint = self
                    .log
                    .first_index_of_term(local_term, req.prev_log_index)
                    .max(self.commit_index + 1);
                return (
                    AppendEntriesResponse::inconsistent(self.current_term, hint),
                    true,
                );
            }
        }

        let last_new = req.last_index();
        let mut index = req.prev_log_index;
        let mut entries = req.entries.into_iter();
        for entry in entries.by_ref() {
            index += 1;
            match self.log.entry_at(index) {
                Some(existing) if existing.term() == entry.term() => continue,
                Some(_) => {
                    if index <= self.commit_index {
                        warn!(node = %self.id, index, "refusing to truncate a committed entry");
                        return (
                            AppendEntriesResponse::inconsistent(self.current_term, self.commit_index + 1),
                            true,
                        );
                    }
                    debug!(node = %self.id, index, "truncating conflicting suffix");
                    self.log.truncate_from(index);
                    self.log.append([entry]);
                    break;
                }
                None => {
                    self.log.append([entry]);
                    break;
                }
            }
        }
        self.log.append(entries);

        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.set_commit_index(new_commit);
            }
        }

        (AppendEntriesResponse::accepted(self.current_term), true)
    }

    /// Record a follower's answer; returns true when the commit index advanced
    pub fn handle_append_entries_response(
        &mut self,
        peer: &str,
        resp: &AppendEntriesResponse,
        last_sent: u64,
    ) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if !self.is_leader() || resp.term < self.current_term {
            return false;
        }

        let matched = self.match_index.get(peer).copied().unwrap_or(0);
        if resp.success {
            let matched = matched.max(last_sent);
            self.match_index.insert(peer.to_string(), matched);
            self.next_index.insert(peer.to_string(), matched + 1);
            return self.maybe_advance_commit();
        }

        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1);
        let backed_off = match resp.rejection {
            Some(Rejection::LogInconsistency { next_index_hint }) => {
                next.saturating_sub(1).min(next_index_hint)
            }
            _ => next.saturating_sub(1),
        };
        self.next_index
            .insert(peer.to_string(), backed_off.max(matched + 1).max(1));
        false
    }

    /// Advance the commit index to the highest current-term entry held by a
    /// majority of the committed configuration
    pub fn maybe_advance_commit(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let mut n = self.last_log_index();
        while n > self.commit_index {
            let term = self.log.term_at(n);
            if term < self.current_term {
                // entries from earlier terms only commit underneath one of ours
                break;
            }
            if term == self.current_term {
                let holders: Vec<&Address> = self
                    .membership
                    .members()
                    .iter()
                    .filter(|m| {
                        if **m == self.id {
                            true
                        } else {
                            self.match_index.get(*m).copied().unwrap_or(0) >= n
                        }
                    })
                    .collect();
                if self.membership.is_quorum(holders) {
                    self.set_commit_index(n);
                    return true;
                }
            }
            n -= 1;
        }
        false
    }

    fn set_commit_index(&mut self, index: u64) {
        let previous = self.commit_index;
        self.commit_index = index;
        debug!(node = %self.id, commit_index = index, "commit index advanced");
        self.apply_configurations(previous, index);
    }

    /// Adopt any configuration committed in `(from, to]`
    fn apply_configurations(&mut self, from: u64, to: u64) {
        let latest = self
            .log
            .range(from + 1, to)
            .filter_map(|(_, e)| e.members())
            .last()
            .cloned();
        let Some(members) = latest else {
            return;
        };

        info!(node = %self.id, members = ?members, "configuration committed");
        self.membership = ClusterConfiguration::from(members);
        if self.is_leader() && !self.membership.contains(&self.id) {
            info!(node = %self.id, "removed from configuration, stepping down");
            self.become_follower(self.current_term);
        }
    }

    /// Committed entries not yet handed to the application, in index order
    pub fn get_entries_to_apply(&mut self) -> Vec<(u64, LogEntry)> {
        let entries: Vec<(u64, LogEntry)> = self
            .log
            .range(self.last_applied + 1, self.commit_index)
            .map(|(i, e)| (i, e.clone()))
            .collect();
        if let Some((last, _)) = entries.last() {
            self.last_applied = *last;
        }
        entries
    }
}
