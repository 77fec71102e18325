//! # handler
//!
//! why: one contract for every transport binding, so the engine runs unchanged
//! over the local registry or tcp
//! relations: implemented by raft-engine (handler) and by local.rs / tcp (server, client)
//! what: ProtocolHandler, ProtocolServer, ProtocolClient, request dispatch

use async_trait::async_trait;
use std::sync::Arc;

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, Request, RequestVoteRequest, RequestVoteResponse,
    Response, SubmitCommandRequest, SubmitCommandResponse,
};

use crate::{ProtocolError, Result};

/// Receives the three raft operations on behalf of one node
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse>;

    async fn submit_command(&self, request: SubmitCommandRequest) -> Result<SubmitCommandResponse>;
}

/// Route a tagged request to the matching handler operation
pub async fn dispatch(handler: &dyn ProtocolHandler, request: Request) -> Result<Response> {
    match request {
        Request::AppendEntries(req) => handler.append_entries(req).await.map(Response::AppendEntries),
        Request::RequestVote(req) => handler.request_vote(req).await.map(Response::RequestVote),
        Request::SubmitCommand(req) => handler.submit_command(req).await.map(Response::SubmitCommand),
    }
}

/// Accepts requests addressed to one node and hands them to its handler.
///
/// `start` and `stop` are idempotent. A handler may be bound before or
/// after `start`; requests arriving while none is bound fail with
/// [`ProtocolError::NoHandler`].
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// The address peers use to reach this server
    fn address(&self) -> String;

    fn bind_handler(&self, handler: Arc<dyn ProtocolHandler>);

    fn unbind_handler(&self);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Sends the three raft operations to a target address
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    /// Deliver one request and wait for its response
    async fn call(&self, target: &str, request: Request) -> Result<Response>;

    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(target, Request::AppendEntries(request)).await? {
            Response::AppendEntries(resp) => Ok(resp),
            _ => Err(ProtocolError::UnexpectedResponse {
                expected: "append_entries",
            }),
        }
    }

    async fn request_vote(
        &self,
        target: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.call(target, Request::RequestVote(request)).await? {
            Response::RequestVote(resp) => Ok(resp),
            _ => Err(ProtocolError::UnexpectedResponse {
                expected: "request_vote",
            }),
        }
    }

    async fn submit_command(
        &self,
        target: &str,
        request: SubmitCommandRequest,
    ) -> Result<SubmitCommandResponse> {
        match self.call(target, Request::SubmitCommand(request)).await? {
            Response::SubmitCommand(resp) => Ok(resp),
            _ => Err(ProtocolError::UnexpectedResponse {
                expected: "submit_command",
            }),
        }
    }

    /// Release any connections held by the client
    async fn close(&self) {}
}
