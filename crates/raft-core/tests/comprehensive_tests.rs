//! # comprehensive raft tests
//!
//! why: verify all raft consensus scenarios work correctly
//! relations: tests raft-core without any runtime or transport
//! what: election, replication, partition, quorum, membership, commit-safety scenarios

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, HardState, LogEntry, NodeState, RaftConfig,
    RaftNode, Rejection, RequestVoteRequest, RequestVoteResponse, SubmitError,
};
use std::collections::BTreeSet;

fn vote_req(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64) -> RequestVoteRequest {
    RequestVoteRequest {
        term,
        candidate_id: candidate.to_string(),
        last_log_index,
        last_log_term,
    }
}

fn granted(term: u64) -> RequestVoteResponse {
    RequestVoteResponse {
        term,
        vote_granted: true,
    }
}

fn denied(term: u64) -> RequestVoteResponse {
    RequestVoteResponse {
        term,
        vote_granted: false,
    }
}

fn append_req(
    term: u64,
    leader: &str,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: u64,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: leader.to_string(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    }
}

fn three_nodes(id: &str) -> RaftNode {
    RaftNode::new(id, ["a", "b", "c"])
}

/// Elect `a` as leader of a three node cluster in term 1
fn leader_a() -> RaftNode {
    let mut node = three_nodes("a");
    node.start_election();
    assert!(node.handle_vote_response("b", &granted(1)));
    node
}

// =============================================================================
// SECTION 1: INITIALIZATION TESTS
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = three_nodes("a");
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert!(node.log.is_empty());
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.last_applied, 0);
    }

    #[test]
    fn node_knows_cluster_membership() {
        let node = three_nodes("a");
        assert_eq!(node.membership.len(), 3);
        assert!(node.membership.contains("c"));
        assert_eq!(node.id, "a");
    }

    #[test]
    fn custom_config_is_applied() {
        let config = RaftConfig {
            election_timeout_min: 200,
            election_timeout_max: 400,
            heartbeat_interval: 100,
            max_entries_per_append: 8,
        };
        let node = RaftNode::with_config("a", ["a", "b", "c"], config);
        assert_eq!(node.config.election_timeout_min, 200);
        assert_eq!(node.config.election_timeout_max, 400);
        assert_eq!(node.config.heartbeat_interval, 100);
        assert_eq!(node.config.max_entries_per_append, 8);
    }

    #[test]
    fn default_config_values() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout_min, 150);
        assert_eq!(config.election_timeout_max, 300);
        assert_eq!(config.heartbeat_interval, 50);
    }

    #[test]
    fn restore_brings_back_hard_state_and_log() {
        let node = three_nodes("a").restore(
            HardState {
                current_term: 4,
                voted_for: Some("b".into()),
            },
            vec![LogEntry::noop(1), LogEntry::command(3, b"x".to_vec())],
            1,
        );
        assert_eq!(node.current_term, 4);
        assert_eq!(node.voted_for.as_deref(), Some("b"));
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.commit_index, 1);
        assert!(node.log.unstable().is_empty());
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION TESTS
// =============================================================================

mod quorum {
    use super::*;

    #[test]
    fn quorum_for_3_node_cluster() {
        assert_eq!(three_nodes("a").quorum_size(), 2);
    }

    #[test]
    fn quorum_for_5_node_cluster() {
        let node = RaftNode::new("a", ["a", "b", "c", "d", "e"]);
        assert_eq!(node.quorum_size(), 3);
    }

    #[test]
    fn quorum_for_1_node_cluster() {
        let node = RaftNode::new("a", ["a"]);
        assert_eq!(node.quorum_size(), 1);
    }

    #[test]
    fn has_quorum_with_majority() {
        let mut node = three_nodes("a");
        node.votes_received = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert!(node.has_quorum());
    }

    #[test]
    fn no_quorum_with_minority() {
        let mut node = three_nodes("a");
        node.votes_received = ["a"].iter().map(|s| s.to_string()).collect();
        assert!(!node.has_quorum());
    }

    #[test]
    fn votes_from_non_members_do_not_count() {
        let mut node = three_nodes("a");
        node.votes_received = ["a", "z"].iter().map(|s| s.to_string()).collect();
        assert!(!node.has_quorum());
    }
}

// =============================================================================
// SECTION 3: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn start_election_becomes_candidate() {
        let mut node = three_nodes("a");
        node.start_election();

        assert_eq!(node.state, NodeState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for.as_deref(), Some("a"));
        assert_eq!(node.votes_received.len(), 1);
    }

    #[test]
    fn start_election_increments_term() {
        let mut node = three_nodes("a");
        node.current_term = 5;
        node.start_election();
        assert_eq!(node.current_term, 6);
    }

    #[test]
    fn vote_request_includes_log_info() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, vec![1]), LogEntry::command(2, vec![2])]);
        node.current_term = 2;

        let req = node.start_election();

        assert_eq!(req.term, 3);
        assert_eq!(req.candidate_id, "a");
        assert_eq!(req.last_log_index, 2);
        assert_eq!(req.last_log_term, 2);
    }

    #[test]
    fn majority_vote_wins_election() {
        let mut node = three_nodes("a");
        node.start_election();

        assert!(node.handle_vote_response("b", &granted(1)));
        assert_eq!(node.state, NodeState::Leader);
        assert_eq!(node.leader_id.as_deref(), Some("a"));
    }

    #[test]
    fn single_vote_not_enough_for_quorum() {
        let mut node = RaftNode::new("a", ["a", "b", "c", "d", "e"]);
        node.start_election();

        assert!(!node.handle_vote_response("b", &granted(1)));
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn rejected_votes_dont_count() {
        let mut node = three_nodes("a");
        node.start_election();

        assert!(!node.handle_vote_response("b", &denied(1)));
        assert_eq!(node.state, NodeState::Candidate);
        assert_eq!(node.votes_received.len(), 1);
    }

    #[test]
    fn stale_vote_response_ignored() {
        let mut node = three_nodes("a");
        node.start_election(); // term 1
        node.start_election(); // term 2

        assert!(!node.handle_vote_response("b", &granted(1)));
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn vote_response_with_higher_term_steps_down() {
        let mut node = three_nodes("a");
        node.start_election();

        node.handle_vote_response("b", &denied(5));

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn only_candidate_processes_vote_responses() {
        let mut node = three_nodes("a");
        assert!(!node.handle_vote_response("b", &granted(0)));
        assert_eq!(node.state, NodeState::Follower);
    }

    #[test]
    fn single_node_wins_election_immediately() {
        let mut node = RaftNode::new("a", ["a"]);
        node.start_election();
        assert_eq!(node.state, NodeState::Leader);
        // the new-term noop commits on its own
        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn non_member_cannot_campaign() {
        let node = RaftNode::new("d", ["a", "b", "c"]);
        assert!(!node.can_campaign());
        assert!(three_nodes("a").can_campaign());
    }
}

// =============================================================================
// SECTION 4: VOTE REQUEST HANDLING TESTS
// =============================================================================

mod vote_requests {
    use super::*;

    #[test]
    fn grant_vote_to_valid_candidate() {
        let mut node = three_nodes("a");

        let (response, should_reset) = node.handle_vote_request(&vote_req(1, "b", 0, 0));

        assert_eq!(response.term, 1);
        assert!(response.vote_granted);
        assert!(should_reset);
        assert_eq!(node.voted_for.as_deref(), Some("b"));
    }

    #[test]
    fn reject_vote_for_lower_term() {
        let mut node = three_nodes("a");
        node.current_term = 5;

        let (response, should_reset) = node.handle_vote_request(&vote_req(3, "b", 0, 0));

        assert_eq!(response.term, 5);
        assert!(!response.vote_granted);
        assert!(!should_reset);
    }

    #[test]
    fn update_term_on_higher_term_vote_request() {
        let mut node = three_nodes("a");
        node.current_term = 1;

        node.handle_vote_request(&vote_req(5, "b", 0, 0));

        assert_eq!(node.current_term, 5);
        assert_eq!(node.state, NodeState::Follower);
    }

    #[test]
    fn leader_steps_down_on_higher_term_vote_request() {
        let mut node = leader_a();
        node.handle_vote_request(&vote_req(7, "b", 10, 7));
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 7);
    }

    #[test]
    fn reject_vote_if_already_voted() {
        let mut node = three_nodes("a");
        node.handle_vote_request(&vote_req(1, "b", 0, 0));

        let (response, should_reset) = node.handle_vote_request(&vote_req(1, "c", 0, 0));

        assert!(!response.vote_granted);
        assert!(!should_reset);
    }

    #[test]
    fn can_revote_for_same_candidate() {
        let mut node = three_nodes("a");
        node.handle_vote_request(&vote_req(1, "b", 0, 0));

        let (response, _) = node.handle_vote_request(&vote_req(1, "b", 0, 0));
        assert!(response.vote_granted);
    }

    #[test]
    fn reject_candidate_with_stale_log_lower_term() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(5, vec![1])]);
        node.current_term = 5;

        let (response, _) = node.handle_vote_request(&vote_req(5, "b", 1, 3));
        assert!(!response.vote_granted, "should reject candidate with stale log");
    }

    #[test]
    fn reject_candidate_with_shorter_log_same_term() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, vec![1]), LogEntry::command(1, vec![2])]);
        node.current_term = 1;

        let (response, _) = node.handle_vote_request(&vote_req(1, "b", 1, 1));
        assert!(!response.vote_granted, "should reject candidate with shorter log");
    }

    #[test]
    fn grant_vote_to_candidate_with_longer_log() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, vec![1])]);
        node.current_term = 1;

        let (response, _) = node.handle_vote_request(&vote_req(1, "b", 2, 1));
        assert!(response.vote_granted);
    }

    #[test]
    fn grant_vote_to_candidate_with_higher_term_log() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, vec![1])]);
        node.current_term = 2;

        let (response, _) = node.handle_vote_request(&vote_req(2, "b", 1, 5));
        assert!(response.vote_granted);
    }

    #[test]
    fn term_never_decreases() {
        let mut node = three_nodes("a");
        node.current_term = 10;
        node.handle_vote_request(&vote_req(5, "b", 0, 0));
        assert_eq!(node.current_term, 10);
    }

    #[test]
    fn voted_for_resets_on_term_change() {
        let mut node = three_nodes("a");
        node.handle_vote_request(&vote_req(1, "b", 0, 0));
        node.handle_vote_request(&vote_req(2, "c", 0, 0));
        assert_eq!(node.voted_for.as_deref(), Some("c"));
    }
}

// =============================================================================
// SECTION 5: LEADER ELECTION STATE MANAGEMENT
// =============================================================================

mod leader_state {
    use super::*;

    #[test]
    fn become_leader_clears_votes() {
        let node = leader_a();
        assert!(node.votes_received.is_empty());
    }

    #[test]
    fn become_leader_initializes_next_index() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, vec![1])]);
        node.start_election();
        node.handle_vote_response("b", &granted(1));

        // next_index is last_log_index + 1 as of the election
        assert_eq!(node.next_index.get("b"), Some(&2));
        assert_eq!(node.next_index.get("c"), Some(&2));
    }

    #[test]
    fn become_leader_initializes_match_index_to_zero() {
        let node = leader_a();
        assert_eq!(node.match_index.get("b"), Some(&0));
        assert_eq!(node.match_index.get("c"), Some(&0));
    }

    #[test]
    fn become_leader_appends_noop_for_its_term() {
        let node = leader_a();
        assert_eq!(node.last_log_index(), 1);
        assert_eq!(node.get_entry(1), Some(&LogEntry::noop(1)));
    }

    #[test]
    fn become_follower_clears_election_state() {
        let mut node = three_nodes("a");
        node.start_election();
        node.votes_received.insert("b".into());

        node.become_follower(5);

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
        assert!(node.votes_received.is_empty());
    }
}

// =============================================================================
// SECTION 6: LOG REPLICATION TESTS
// =============================================================================

mod log_replication {
    use super::*;

    #[test]
    fn append_command_adds_to_log() {
        let mut node = leader_a();

        let index = node.append_command(b"SET key value".to_vec()).unwrap();

        assert_eq!(index, 2);
        assert_eq!(
            node.get_entry(2),
            Some(&LogEntry::command(1, b"SET key value".to_vec()))
        );
    }

    #[test]
    fn append_command_requires_leadership() {
        let mut node = three_nodes("a");
        node.handle_append_entries(append_req(1, "b", 0, 0, vec![], 0));

        let err = node.append_command(b"x".to_vec()).unwrap_err();
        assert_eq!(err, SubmitError::not_leader(Some("b".into())));
    }

    #[test]
    fn heartbeat_when_follower_is_caught_up() {
        let mut node = leader_a();
        node.next_index.insert("b".into(), 2);

        let req = node.create_append_entries("b").unwrap();

        assert_eq!(req.term, 1);
        assert_eq!(req.leader_id, "a");
        assert_eq!(req.prev_log_index, 1);
        assert!(req.entries.is_empty());
    }

    #[test]
    fn create_append_entries_includes_pending_entries() {
        let mut node = leader_a();
        node.append_command(b"cmd1".to_vec()).unwrap();
        node.append_command(b"cmd2".to_vec()).unwrap();

        let req = node.create_append_entries("b").unwrap();

        // noop plus both commands
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.entries.len(), 3);
    }

    #[test]
    fn append_entries_batches_are_bounded() {
        let mut node = leader_a();
        node.config.max_entries_per_append = 2;
        for i in 0..5u8 {
            node.append_command(vec![i]).unwrap();
        }
        let req = node.create_append_entries("b").unwrap();
        assert_eq!(req.entries.len(), 2);
    }

    #[test]
    fn non_leader_cannot_create_append_entries() {
        let mut node = three_nodes("a");
        assert!(node.create_append_entries("b").is_none());
    }
}

// =============================================================================
// SECTION 7: APPEND ENTRIES HANDLING TESTS
// =============================================================================

mod append_entries_handling {
    use super::*;

    #[test]
    fn reject_append_entries_with_lower_term() {
        let mut node = three_nodes("a");
        node.current_term = 5;

        let (response, should_reset) = node.handle_append_entries(append_req(3, "b", 0, 0, vec![], 0));

        assert_eq!(response, AppendEntriesResponse::stale_term(5));
        assert!(!should_reset);
    }

    #[test]
    fn accept_heartbeat_from_valid_leader() {
        let mut node = three_nodes("a");

        let (response, should_reset) = node.handle_append_entries(append_req(1, "b", 0, 0, vec![], 0));

        assert!(response.success);
        assert!(should_reset);
        assert_eq!(node.leader_id.as_deref(), Some("b"));
    }

    #[test]
    fn candidate_steps_down_on_append_entries() {
        let mut node = three_nodes("a");
        node.start_election();

        node.handle_append_entries(append_req(1, "b", 0, 0, vec![], 0));

        assert_eq!(node.state, NodeState::Follower);
        // same term: the vote already cast stands
        assert_eq!(node.voted_for.as_deref(), Some("a"));
    }

    #[test]
    fn reject_when_prev_index_is_missing() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, vec![1])]);

        let (response, _) = node.handle_append_entries(append_req(1, "b", 5, 1, vec![], 0));

        assert!(!response.success);
        assert_eq!(
            response.rejection,
            Some(Rejection::LogInconsistency { next_index_hint: 2 })
        );
    }

    #[test]
    fn reject_when_prev_term_mismatches() {
        let mut node = three_nodes("a");
        node.log.append([
            LogEntry::command(1, vec![1]),
            LogEntry::command(2, vec![2]),
            LogEntry::command(2, vec![3]),
        ]);
        node.current_term = 2;

        let (response, _) = node.handle_append_entries(append_req(3, "b", 3, 3, vec![], 0));

        // hint skips back to the first entry of the conflicting term
        assert_eq!(
            response.rejection,
            Some(Rejection::LogInconsistency { next_index_hint: 2 })
        );
    }

    #[test]
    fn append_entries_adds_new_entries() {
        let mut node = three_nodes("a");
        let entries = vec![
            LogEntry::command(1, b"cmd1".to_vec()),
            LogEntry::command(1, b"cmd2".to_vec()),
        ];

        node.handle_append_entries(append_req(1, "b", 0, 0, entries, 0));

        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.get_entry(2).and_then(|e| e.payload()), Some(&b"cmd2"[..]));
    }

    #[test]
    fn append_entries_truncates_conflicting_entries() {
        let mut node = three_nodes("a");
        node.log.append([
            LogEntry::command(1, b"old1".to_vec()),
            LogEntry::command(1, b"old2".to_vec()),
            LogEntry::command(1, b"old3".to_vec()),
        ]);
        node.current_term = 1;

        let entries = vec![LogEntry::command(2, b"new2".to_vec())];
        node.handle_append_entries(append_req(2, "b", 1, 1, entries, 0));

        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.get_term_at(2), 2);
        assert_eq!(node.get_entry(2).and_then(|e| e.payload()), Some(&b"new2"[..]));
    }

    #[test]
    fn duplicate_append_keeps_longer_log() {
        let mut node = three_nodes("a");
        let entries = vec![LogEntry::command(1, vec![1]), LogEntry::command(1, vec![2])];
        node.handle_append_entries(append_req(1, "b", 0, 0, entries, 0));

        // a delayed copy of an earlier, shorter request must not truncate
        node.handle_append_entries(append_req(1, "b", 0, 0, vec![LogEntry::command(1, vec![1])], 0));

        assert_eq!(node.last_log_index(), 2);
    }

    #[test]
    fn append_entries_updates_commit_index() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, b"cmd".to_vec())]);

        node.handle_append_entries(append_req(1, "b", 1, 1, vec![], 1));

        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn commit_index_capped_at_last_new_entry() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, b"cmd".to_vec())]);

        node.handle_append_entries(append_req(1, "b", 1, 1, vec![], 100));

        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn commit_index_never_decreases() {
        let mut node = three_nodes("a");
        let entries = vec![LogEntry::command(1, vec![1]), LogEntry::command(1, vec![2])];
        node.handle_append_entries(append_req(1, "b", 0, 0, entries, 2));
        assert_eq!(node.commit_index, 2);

        node.handle_append_entries(append_req(1, "b", 1, 1, vec![], 1));
        assert_eq!(node.commit_index, 2);
    }
}

// =============================================================================
// SECTION 8: APPEND ENTRIES RESPONSE HANDLING
// =============================================================================

mod append_entries_response {
    use super::*;

    #[test]
    fn success_response_updates_match_index() {
        let mut node = leader_a();
        node.append_command(b"cmd".to_vec()).unwrap();

        node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(1), 2);

        assert_eq!(node.match_index.get("b"), Some(&2));
        assert_eq!(node.next_index.get("b"), Some(&3));
    }

    #[test]
    fn failure_response_decrements_next_index() {
        let mut node = leader_a();
        node.append_command(b"cmd".to_vec()).unwrap();
        node.next_index.insert("b".into(), 5);

        let resp = AppendEntriesResponse {
            term: 1,
            success: false,
            rejection: None,
        };
        node.handle_append_entries_response("b", &resp, 0);

        assert_eq!(node.next_index.get("b"), Some(&4));
    }

    #[test]
    fn rejection_hint_skips_back_further() {
        let mut node = leader_a();
        node.next_index.insert("b".into(), 9);

        node.handle_append_entries_response("b", &AppendEntriesResponse::inconsistent(1, 3), 0);

        assert_eq!(node.next_index.get("b"), Some(&3));
    }

    #[test]
    fn next_index_never_drops_below_one() {
        let mut node = leader_a();
        node.next_index.insert("b".into(), 1);

        node.handle_append_entries_response("b", &AppendEntriesResponse::inconsistent(1, 0), 0);

        assert_eq!(node.next_index.get("b"), Some(&1));
    }

    #[test]
    fn higher_term_response_causes_step_down() {
        let mut node = leader_a();

        node.handle_append_entries_response("b", &AppendEntriesResponse::stale_term(5), 0);

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
    }

    #[test]
    fn non_leader_ignores_append_entries_response() {
        let mut node = three_nodes("a");
        assert!(!node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(0), 1));
    }
}

// =============================================================================
// SECTION 9: COMMIT INDEX ADVANCEMENT
// =============================================================================

mod commit_advancement {
    use super::*;

    #[test]
    fn commit_on_majority_replication() {
        let mut node = leader_a();
        node.append_command(b"cmd".to_vec()).unwrap();

        let advanced = node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(1), 2);

        assert!(advanced);
        assert_eq!(node.commit_index, 2);
    }

    #[test]
    fn no_commit_without_quorum() {
        let mut node = RaftNode::new("a", ["a", "b", "c", "d", "e"]);
        node.start_election();
        node.handle_vote_response("b", &granted(1));
        node.handle_vote_response("c", &granted(1));
        node.append_command(b"cmd".to_vec()).unwrap();

        let advanced = node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(1), 2);

        assert!(!advanced);
        assert_eq!(node.commit_index, 0);
    }

    #[test]
    fn cannot_commit_entries_from_previous_term_by_counting() {
        // log has an entry from term 1; leader of term 2 has not yet replicated its noop
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, b"old".to_vec())]);
        node.current_term = 1;
        node.start_election(); // term 2, noop at index 2
        node.handle_vote_response("b", &granted(2));

        // b holds only the old entry
        node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(2), 1);
        assert_eq!(node.commit_index, 0);

        // once the term-2 noop is on a majority, both commit together
        node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(2), 2);
        assert_eq!(node.commit_index, 2);
    }
}

// =============================================================================
// SECTION 10: LOG HELPER FUNCTIONS
// =============================================================================

mod log_helpers {
    use super::*;

    #[test]
    fn last_log_index_and_term() {
        let mut node = three_nodes("a");
        assert_eq!(node.last_log_index(), 0);
        assert_eq!(node.last_log_term(), 0);
        node.log.append([LogEntry::noop(3), LogEntry::noop(5)]);
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.last_log_term(), 5);
    }

    #[test]
    fn get_entry_invalid_index() {
        let node = three_nodes("a");
        assert!(node.get_entry(1).is_none());
        assert!(node.get_entry(0).is_none());
        assert_eq!(node.get_term_at(100), 0);
    }

    #[test]
    fn round_trip_preserves_order_and_content() {
        let mut node = three_nodes("a");
        let entries: Vec<LogEntry> = (0..20u8).map(|i| LogEntry::command(1, vec![i])).collect();
        node.log.append(entries.clone());

        for (i, expected) in entries.iter().enumerate() {
            assert_eq!(node.get_entry(i as u64 + 1), Some(expected));
        }
    }
}

// =============================================================================
// SECTION 11: STATE MACHINE APPLICATION
// =============================================================================

mod state_machine {
    use super::*;

    #[test]
    fn get_entries_to_apply_returns_committed() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, b"cmd1".to_vec()), LogEntry::command(1, b"cmd2".to_vec())]);
        node.commit_index = 2;

        let entries = node.get_entries_to_apply();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 1);
        assert_eq!(node.last_applied, 2);
    }

    #[test]
    fn get_entries_to_apply_idempotent() {
        let mut node = three_nodes("a");
        node.log.append([LogEntry::command(1, b"cmd".to_vec())]);
        node.commit_index = 1;

        assert_eq!(node.get_entries_to_apply().len(), 1);
        assert!(node.get_entries_to_apply().is_empty());
    }
}

// =============================================================================
// SECTION 12: MEMBERSHIP CHANGES
// =============================================================================

mod membership {
    use super::*;

    fn members(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn only_one_configuration_change_outstanding() {
        let mut node = leader_a();
        node.propose_configuration(members(&["a", "b", "c", "d"])).unwrap();

        let err = node.propose_configuration(members(&["a", "b"])).unwrap_err();
        assert_eq!(err, SubmitError::ConfigurationChangeInProgress);
    }

    #[test]
    fn joining_node_is_replicated_to_but_not_counted() {
        let mut node = leader_a();
        let index = node.propose_configuration(members(&["a", "b", "c", "d"])).unwrap();

        assert!(node.replication_targets().contains("d"));

        // d alone acknowledging does not commit: quorum is still 2 of {a,b,c}
        node.handle_append_entries_response("d", &AppendEntriesResponse::accepted(1), index);
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.membership.len(), 3);

        // b acknowledging commits under the original configuration
        node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(1), index);
        assert_eq!(node.commit_index, index);
        assert_eq!(node.membership.len(), 4);
        assert_eq!(node.quorum_size(), 3);
        assert!(node.pending_configuration().is_none());
    }

    #[test]
    fn follower_adopts_configuration_only_on_commit() {
        let mut node = three_nodes("b");
        let entries = vec![LogEntry::noop(1), LogEntry::configuration(1, ["a", "b", "c", "d"])];
        node.handle_append_entries(append_req(1, "a", 0, 0, entries, 1));
        assert_eq!(node.membership.len(), 3);

        node.handle_append_entries(append_req(1, "a", 2, 1, vec![], 2));
        assert_eq!(node.membership.len(), 4);
    }

    #[test]
    fn truncated_configuration_is_no_longer_pending() {
        let mut node = three_nodes("b");
        let entries = vec![LogEntry::noop(1), LogEntry::configuration(1, ["a", "b"])];
        node.handle_append_entries(append_req(1, "a", 0, 0, entries, 1));
        assert!(node.pending_configuration().is_some());

        node.handle_append_entries(append_req(2, "c", 1, 1, vec![LogEntry::noop(2)], 1));
        assert!(node.pending_configuration().is_none());
    }

    #[test]
    fn leader_removed_from_configuration_steps_down() {
        let mut node = leader_a();
        let index = node.propose_configuration(members(&["b", "c"])).unwrap();
        node.handle_append_entries_response("b", &AppendEntriesResponse::accepted(1), index);

        assert_eq!(node.commit_index, index);
        assert_eq!(node.state, NodeState::Follower);
    }
}

// =============================================================================
// SECTION 13: CLUSTER SCENARIOS (synchronous message delivery)
// =============================================================================

mod scenarios {
    use super::*;
    use std::collections::BTreeMap;

    /// A tiny deterministic cluster: messages are delivered immediately,
    /// except to and from isolated nodes.
    struct Cluster {
        nodes: BTreeMap<String, RaftNode>,
        isolated: BTreeSet<String>,
    }

    impl Cluster {
        fn new(names: &[&str]) -> Self {
            let nodes = names
                .iter()
                .map(|n| (n.to_string(), RaftNode::new(*n, names.iter().copied())))
                .collect();
            Self {
                nodes,
                isolated: BTreeSet::new(),
            }
        }

        fn connected(&self, a: &str, b: &str) -> bool {
            !self.isolated.contains(a) && !self.isolated.contains(b)
        }

        fn node(&mut self, name: &str) -> &mut RaftNode {
            self.nodes.get_mut(name).unwrap()
        }

        /// Run an election for `candidate` against every reachable voter
        fn elect(&mut self, candidate: &str) -> bool {
            let req = self.node(candidate).start_election();
            let voters = self.node(candidate).voters();
            for voter in voters {
                if !self.connected(candidate, &voter) {
                    continue;
                }
                let (resp, _) = self.node(&voter).handle_vote_request(&req);
                self.node(candidate).handle_vote_response(&voter, &resp);
            }
            self.node(candidate).is_leader()
        }

        /// Replicate from `leader` until every reachable follower is caught up
        fn replicate(&mut self, leader: &str) {
            for _ in 0..50 {
                let targets = self.node(leader).replication_targets();
                for peer in targets {
                    if !self.connected(leader, &peer) {
                        continue;
                    }
                    let Some(req) = self.node(leader).create_append_entries(&peer) else {
                        return;
                    };
                    let last = req.last_index();
                    let (resp, _) = self.node(&peer).handle_append_entries(req);
                    self.node(leader).handle_append_entries_response(&peer, &resp, last);
                }
            }
        }

        fn leaders_in_term(&self, term: u64) -> usize {
            self.nodes
                .values()
                .filter(|n| n.is_leader() && n.current_term == term)
                .count()
        }
    }

    #[test]
    fn scenario_a_command_commits_everywhere() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        assert!(cluster.elect("a"));
        let index = cluster.node("a").append_command(b"X".to_vec()).unwrap();
        cluster.replicate("a");

        for name in ["a", "b", "c"] {
            let node = cluster.node(name);
            assert_eq!(node.commit_index, index, "node {name}");
            assert_eq!(node.get_entry(index).and_then(|e| e.payload()), Some(&b"X"[..]));
        }
    }

    #[test]
    fn scenario_b_isolated_leader_loses_uncommitted_entry() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        assert!(cluster.elect("a"));
        cluster.replicate("a");

        cluster.isolated.insert("a".into());
        let x_index = cluster.node("a").append_command(b"X".to_vec()).unwrap();
        cluster.replicate("a");
        assert!(cluster.node("a").commit_index < x_index);

        assert!(cluster.elect("b"));
        let y_index = cluster.node("b").append_command(b"Y".to_vec()).unwrap();
        cluster.replicate("b");
        assert_eq!(cluster.node("c").commit_index, y_index);

        cluster.isolated.clear();
        cluster.replicate("b");

        let a = cluster.node("a");
        assert_eq!(a.state, NodeState::Follower);
        assert_eq!(a.commit_index, y_index);
        let payloads: Vec<_> = a
            .log
            .range(1, a.last_log_index())
            .filter_map(|(_, e)| e.payload().map(|p| p.to_vec()))
            .collect();
        assert_eq!(payloads, vec![b"Y".to_vec()]);
    }

    #[test]
    fn scenario_c_split_vote_then_single_leader() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);

        // a and b time out together; each votes for itself and c is unreachable
        cluster.isolated.insert("c".into());
        let req_a = cluster.node("a").start_election();
        let req_b = cluster.node("b").start_election();
        let (resp_b, _) = cluster.node("b").handle_vote_request(&req_a);
        let (resp_a, _) = cluster.node("a").handle_vote_request(&req_b);
        cluster.node("a").handle_vote_response("b", &resp_b);
        cluster.node("b").handle_vote_response("a", &resp_a);
        assert_eq!(cluster.leaders_in_term(1), 0);

        // randomized timeouts: a retries first in term 2
        cluster.isolated.clear();
        assert!(cluster.elect("a"));
        assert_eq!(cluster.node("a").current_term, 2);
        assert_eq!(cluster.leaders_in_term(2), 1);
    }

    #[test]
    fn scenario_d_fourth_node_counts_after_commit() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster
            .nodes
            .insert("d".into(), RaftNode::new("d", ["a", "b", "c"]));
        assert!(cluster.elect("a"));
        cluster.replicate("a");

        let members: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        cluster.isolated.insert("b".into());
        cluster.isolated.insert("c".into());
        let index = cluster.node("a").propose_configuration(members).unwrap();
        cluster.replicate("a");

        // only a and d hold it: not a majority of {a,b,c}
        assert!(cluster.node("a").commit_index < index);

        cluster.isolated.clear();
        cluster.replicate("a");
        assert_eq!(cluster.node("a").commit_index, index);
        assert_eq!(cluster.node("a").quorum_size(), 3);
        assert!(cluster.node("d").can_campaign());
    }

    #[test]
    fn election_safety_one_leader_per_term() {
        let mut cluster = Cluster::new(&["a", "b", "c", "d", "e"]);
        for candidate in ["a", "b", "c", "d", "e", "a", "c"] {
            cluster.elect(candidate);
            cluster.replicate(candidate);
        }
        let max_term = cluster.nodes.values().map(|n| n.current_term).max().unwrap();
        for term in 1..=max_term {
            assert!(cluster.leaders_in_term(term) <= 1, "term {term}");
        }
    }

    #[test]
    fn log_matching_after_leader_changes() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        assert!(cluster.elect("a"));
        cluster.node("a").append_command(b"1".to_vec()).unwrap();
        cluster.replicate("a");

        cluster.isolated.insert("c".into());
        assert!(cluster.elect("b"));
        cluster.node("b").append_command(b"2".to_vec()).unwrap();
        cluster.replicate("b");
        cluster.isolated.clear();
        cluster.replicate("b");

        let logs: Vec<Vec<LogEntry>> = cluster
            .nodes
            .values()
            .map(|n| n.log.entries_from(1).to_vec())
            .collect();
        assert_eq!(logs[0], logs[1]);
        assert_eq!(logs[1], logs[2]);
    }
}
