//! Client proxy: routes calls to the cluster, follows redirects to the
//! current leader, and refreshes its cached leader on NOT_LEADER.

use crate::error::{Error, Result};
use crate::kv::KvCommand;
use crate::log::EntryKind;
use crate::message::{ReplicateRequest, Request, Response};
use crate::transport::Transport;
use crate::types::{Configuration, NodeId, Peer, ResultCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// How many endpoints the proxy will try for one call before giving up.
const MAX_ATTEMPTS: usize = 8;

pub struct RaftClient {
    transport: Arc<dyn Transport>,
    endpoints: Vec<String>,
    cached_leader: Mutex<Option<String>>,
    retry_backoff: Duration,
}

impl RaftClient {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Vec<String>) -> Self {
        Self {
            transport,
            endpoints,
            cached_leader: Mutex::new(None),
            retry_backoff: Duration::from_millis(50),
        }
    }

    // ---- key-value surface -------------------------------------------

    pub async fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<u64> {
        self.replicate(KvCommand::put(key, value).encode()?).await
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<u64> {
        self.replicate(KvCommand::delete(key).encode()?).await
    }

    /// Read through a specific node's read-index path.
    pub async fn get_from(&self, endpoint: &str, key: impl Into<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        let response = self
            .transport
            .send(endpoint, Request::Read { key: key.into() })
            .await?;
        match response {
            Response::Read {
                result: ResultCode::Success,
                value,
            } => Ok(value),
            Response::Read { .. } => Err(Error::Rejected("read failed")),
            _ => Err(Error::Rejected("unexpected response")),
        }
    }

    /// Read via any reachable node.
    pub async fn get(&self, key: impl Into<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        let mut last_err = Error::Rejected("no endpoints");
        for endpoint in &self.endpoints {
            match self.get_from(endpoint, key.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    debug!("Client: read via {} failed: {}", endpoint, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    // ---- cluster administration --------------------------------------

    pub async fn replicate(&self, data: Vec<u8>) -> Result<u64> {
        let response = self
            .leader_call(Request::Replicate(ReplicateRequest {
                data,
                kind: EntryKind::Data,
            }))
            .await?;
        match response {
            Response::Replicate {
                result: ResultCode::Success,
                index,
            } => Ok(index),
            _ => Err(Error::Rejected("replicate failed")),
        }
    }

    pub async fn add_peers(&self, peers: Vec<Peer>) -> Result<()> {
        match self.leader_call(Request::AddPeers(peers)).await? {
            Response::AddPeers {
                result: ResultCode::Success,
            } => Ok(()),
            _ => Err(Error::Rejected("add peers failed")),
        }
    }

    pub async fn remove_peers(&self, ids: Vec<NodeId>) -> Result<()> {
        match self.leader_call(Request::RemovePeers(ids)).await? {
            Response::RemovePeers {
                result: ResultCode::Success,
            } => Ok(()),
            _ => Err(Error::Rejected("remove peers failed")),
        }
    }

    pub async fn get_configuration(&self) -> Result<Configuration> {
        let mut last_err = Error::Rejected("no endpoints");
        for endpoint in &self.endpoints {
            match self.transport.send(endpoint, Request::GetConfiguration).await {
                Ok(Response::GetConfiguration { configuration, .. }) => return Ok(configuration),
                Ok(_) => last_err = Error::Rejected("unexpected response"),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    pub async fn get_leader(&self) -> Result<Peer> {
        let mut last_err = Error::NotLeader(None);
        for endpoint in &self.endpoints {
            match self.transport.send(endpoint, Request::GetLeader).await {
                Ok(Response::GetLeader {
                    leader: Some(peer), ..
                }) => {
                    *self.cached_leader.lock().unwrap() = Some(peer.addr.clone());
                    return Ok(peer);
                }
                Ok(_) => {}
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    // ---- routing ------------------------------------------------------

    /// Send a leader-only request, following NOT_LEADER redirects and
    /// rotating through endpoints until one accepts.
    async fn leader_call(&self, request: Request) -> Result<Response> {
        let mut candidates = self.candidate_endpoints();
        let mut last_err = Error::NotLeader(None);

        for attempt in 0..MAX_ATTEMPTS {
            let Some(endpoint) = candidates.pop() else {
                // Out of guesses; ask the cluster who leads now.
                tokio::time::sleep(self.retry_backoff).await;
                match self.get_leader().await {
                    Ok(peer) => candidates.push(peer.addr),
                    Err(err) => last_err = err,
                }
                continue;
            };

            match self.transport.send(&endpoint, request.clone()).await {
                Ok(response) => {
                    if response_code(&response) == Some(ResultCode::NotLeader) {
                        debug!("Client: {} is not the leader, refreshing", endpoint);
                        self.forget_leader(&endpoint);
                        continue;
                    }
                    if attempt > 0 {
                        debug!("Client: settled on {} after {} attempts", endpoint, attempt + 1);
                    }
                    *self.cached_leader.lock().unwrap() = Some(endpoint);
                    return Ok(response);
                }
                Err(err) => {
                    debug!("Client: call to {} failed: {}", endpoint, err);
                    self.forget_leader(&endpoint);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Cached leader first, then every configured endpoint (popped from
    /// the back, so push order is reversed).
    fn candidate_endpoints(&self) -> Vec<String> {
        let mut candidates: Vec<String> = self.endpoints.iter().rev().cloned().collect();
        if let Some(leader) = self.cached_leader.lock().unwrap().clone() {
            candidates.push(leader);
        }
        candidates
    }

    fn forget_leader(&self, endpoint: &str) {
        let mut cached = self.cached_leader.lock().unwrap();
        if cached.as_deref() == Some(endpoint) {
            *cached = None;
        }
    }
}

fn response_code(response: &Response) -> Option<ResultCode> {
    match response {
        Response::Replicate { result, .. }
        | Response::AddPeers { result }
        | Response::RemovePeers { result }
        | Response::GetLeaderCommitIndex { result, .. }
        | Response::GetLeader { result, .. }
        | Response::GetConfiguration { result, .. }
        | Response::Read { result, .. } => Some(*result),
        _ => None,
    }
}
