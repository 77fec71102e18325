//! Everything that can wake the engine task.

use std::collections::BTreeSet;
use tokio::sync::oneshot;

use raft_core::{
    Address, AppendEntriesRequest, AppendEntriesResponse, Committed, LogEntry, RequestVoteRequest,
    RequestVoteResponse, SubmitError,
};

use crate::handle::Status;

pub(crate) enum Event {
    // inbound rpcs
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        request: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },

    // client requests
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<Committed, SubmitError>>,
    },
    ChangeMembership {
        members: BTreeSet<Address>,
        reply: oneshot::Sender<Result<u64, SubmitError>>,
    },

    // results of outbound rpcs, tagged with the term they were sent in
    VoteResult {
        term: u64,
        peer: Address,
        response: RequestVoteResponse,
    },
    ReplicationResult {
        term: u64,
        peer: Address,
        last_sent: u64,
        response: AppendEntriesResponse,
    },
    ReplicationFailed {
        term: u64,
        peer: Address,
    },

    // introspection and lifecycle
    Status {
        reply: oneshot::Sender<Status>,
    },
    Entries {
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
