//! # handle
//!
//! why: the only way in to a running engine, from the application and from peers
//! relations: posts events to engine.rs; EngineHandler is what raft-transport
//! servers dispatch to
//! what: RaftHandle, Status snapshot, EngineHandler (ProtocolHandler impl)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use raft_core::{
    Address, AppendEntriesRequest, AppendEntriesResponse, Committed, LogEntry, NodeState,
    RequestVoteRequest, RequestVoteResponse, SubmitCommandRequest, SubmitCommandResponse,
    SubmitError,
};
use raft_transport::{ProtocolError, ProtocolHandler};

use crate::event::Event;
use crate::{EngineError, Result};

/// A point-in-time view of one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub address: Address,
    pub term: u64,
    pub role: NodeState,
    /// Leader of the current term, when known
    pub leader: Option<Address>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    /// Submissions and configuration changes waiting to commit
    pub pending: usize,
    /// Committed configuration
    pub members: BTreeSet<Address>,
}

impl Status {
    pub fn is_leader(&self) -> bool {
        self.role == NodeState::Leader
    }
}

/// Cheap, cloneable handle to a running engine.
///
/// The engine stops once it is shut down or every handle is gone.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    address: Address,
    events: mpsc::Sender<Event>,
    submit_timeout: Duration,
}

fn stopped() -> SubmitError {
    SubmitError::Unavailable("engine stopped".into())
}

impl RaftHandle {
    pub(crate) fn new(address: Address, events: mpsc::Sender<Event>, submit_timeout: Duration) -> Self {
        Self {
            address,
            events,
            submit_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the engine task has stopped
    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }

    /// Replicate `command` and wait for it to commit and apply.
    ///
    /// Fails with `NotLeader` on a follower or when leadership is lost before
    /// the entry commits, and with `Timeout` when no majority commits it
    /// within the submit timeout. A timed out command may still commit.
    pub async fn submit(&self, command: impl Into<Vec<u8>>) -> std::result::Result<Committed, SubmitError> {
        let command = command.into();
        let (reply, rx) = oneshot::channel();
        self.wait_for_commit(Event::Submit { command, reply }, rx).await
    }

    /// Propose a new member set and wait until it commits; returns its index.
    ///
    /// Only one change may be outstanding; a second fails with
    /// `ConfigurationChangeInProgress`.
    pub async fn change_membership<I, A>(&self, members: I) -> std::result::Result<u64, SubmitError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        let members = members.into_iter().map(Into::into).collect();
        let (reply, rx) = oneshot::channel();
        self.wait_for_commit(Event::ChangeMembership { members, reply }, rx)
            .await
    }

    async fn wait_for_commit<T>(
        &self,
        event: Event,
        rx: oneshot::Receiver<std::result::Result<T, SubmitError>>,
    ) -> std::result::Result<T, SubmitError> {
        let wait = async {
            self.events.send(event).await.map_err(|_| stopped())?;
            rx.await.map_err(|_| stopped())?
        };
        match tokio::time::timeout(self.submit_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout),
        }
    }

    pub async fn status(&self) -> Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.request(Event::Status { reply }, rx).await
    }

    /// A copy of the whole log
    pub async fn entries(&self) -> Result<Vec<LogEntry>> {
        let (reply, rx) = oneshot::channel();
        self.request(Event::Entries { reply }, rx).await
    }

    /// Stop the engine; pending submissions fail with `Unavailable`
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        match self.request(Event::Shutdown { reply }, rx).await {
            Ok(()) | Err(EngineError::Stopped) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request<T>(&self, event: Event, rx: oneshot::Receiver<T>) -> Result<T> {
        self.events
            .send(event)
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// A protocol handler that feeds this engine
    pub fn handler(&self) -> Arc<dyn ProtocolHandler> {
        Arc::new(EngineHandler {
            handle: self.clone(),
        })
    }
}

/// Serves the three protocol operations from an engine's mailbox
#[derive(Debug, Clone)]
pub struct EngineHandler {
    handle: RaftHandle,
}

impl EngineHandler {
    pub fn new(handle: RaftHandle) -> Self {
        Self { handle }
    }

    async fn ask<T>(&self, event: Event, rx: oneshot::Receiver<T>) -> raft_transport::Result<T> {
        self.handle
            .request(event, rx)
            .await
            .map_err(|_| self.gone())
    }

    /// A stopped engine looks the same as no handler at all
    fn gone(&self) -> ProtocolError {
        ProtocolError::NoHandler {
            address: self.handle.address.clone(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for EngineHandler {
    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> raft_transport::Result<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.ask(Event::AppendEntries { request, reply }, rx).await
    }

    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> raft_transport::Result<RequestVoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.ask(Event::RequestVote { request, reply }, rx).await
    }

    async fn submit_command(
        &self,
        request: SubmitCommandRequest,
    ) -> raft_transport::Result<SubmitCommandResponse> {
        if self.handle.is_stopped() {
            return Err(self.gone());
        }
        let result = self.handle.submit(request.command).await;
        Ok(SubmitCommandResponse { result })
    }
}
