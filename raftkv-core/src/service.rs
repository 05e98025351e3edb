//! Client-facing service: dispatches every inbound request (peer RPCs and
//! client calls) to the consensus node and shapes the responses.

use crate::error::Error;
use crate::message::{Request, Response};
use crate::node::RaftNode;
use crate::transport::RequestHandler;
use crate::types::ResultCode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct Service {
    node: Arc<RaftNode>,
}

impl Service {
    pub fn new(node: Arc<RaftNode>) -> Arc<Self> {
        Arc::new(Self { node })
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    fn code_for(err: &Error) -> ResultCode {
        match err {
            Error::NotLeader(_) => ResultCode::NotLeader,
            _ => ResultCode::Fail,
        }
    }
}

#[async_trait]
impl RequestHandler for Service {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::RequestVote(req) => {
                Response::RequestVote(self.node.handle_request_vote(req).await)
            }
            Request::AppendEntries(req) => {
                Response::AppendEntries(self.node.handle_append_entries(req).await)
            }
            Request::InstallSnapshot(req) => {
                Response::InstallSnapshot(self.node.handle_install_snapshot(req).await)
            }

            Request::GetLeader => {
                let leader = self.node.leader().await;
                Response::GetLeader {
                    result: if leader.is_some() {
                        ResultCode::Success
                    } else {
                        ResultCode::Fail
                    },
                    leader,
                }
            }
            Request::GetConfiguration => Response::GetConfiguration {
                result: ResultCode::Success,
                configuration: self.node.configuration().await,
            },
            Request::GetLeaderCommitIndex => match self.node.leader_commit_index().await {
                Ok(commit_index) => Response::GetLeaderCommitIndex {
                    result: ResultCode::Success,
                    commit_index,
                },
                Err(err) => Response::GetLeaderCommitIndex {
                    result: Self::code_for(&err),
                    commit_index: 0,
                },
            },

            Request::Replicate(req) => match self.node.replicate(req.data, req.kind).await {
                Ok(index) => Response::Replicate {
                    result: ResultCode::Success,
                    index,
                },
                Err(err) => {
                    debug!("Service: replicate failed: {}", err);
                    Response::Replicate {
                        result: Self::code_for(&err),
                        index: 0,
                    }
                }
            },
            Request::AddPeers(peers) => match self.node.add_peers(peers).await {
                Ok(()) => Response::AddPeers {
                    result: ResultCode::Success,
                },
                Err(err) => Response::AddPeers {
                    result: Self::code_for(&err),
                },
            },
            Request::RemovePeers(ids) => match self.node.remove_peers(ids).await {
                Ok(()) => Response::RemovePeers {
                    result: ResultCode::Success,
                },
                Err(err) => Response::RemovePeers {
                    result: Self::code_for(&err),
                },
            },
            Request::Read { key } => match self.node.read(&key).await {
                Ok(value) => Response::Read {
                    result: ResultCode::Success,
                    value,
                },
                Err(err) => {
                    debug!("Service: read failed: {}", err);
                    Response::Read {
                        result: Self::code_for(&err),
                        value: None,
                    }
                }
            },
        }
    }
}
