//! In-process transport for deterministic multi-node tests.
//!
//! Nodes register their request handlers against an endpoint string; a
//! `MemoryTransport` bound to a source endpoint routes requests through the
//! shared network, which can block individual links or whole nodes to
//! simulate partitions and crashes.

use super::{RequestHandler, Transport};
use crate::error::{Error, Result};
use crate::message::{Request, Response};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
    /// Directed links currently dropped: (from, to).
    blocked: HashSet<(String, String)>,
}

#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.state
            .lock()
            .unwrap()
            .handlers
            .insert(addr.into(), handler);
    }

    /// Take the node off the network entirely (crash simulation).
    pub fn unregister(&self, addr: &str) {
        self.state.lock().unwrap().handlers.remove(addr);
    }

    /// Transport bound to `local` as its source endpoint.
    pub fn transport(self: &Arc<Self>, local: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            local: local.into(),
        })
    }

    /// Drop traffic in both directions between `a` and `b`.
    pub fn block_link(&self, a: &str, b: &str) {
        let mut state = self.state.lock().unwrap();
        state.blocked.insert((a.to_string(), b.to_string()));
        state.blocked.insert((b.to_string(), a.to_string()));
    }

    pub fn unblock_link(&self, a: &str, b: &str) {
        let mut state = self.state.lock().unwrap();
        state.blocked.remove(&(a.to_string(), b.to_string()));
        state.blocked.remove(&(b.to_string(), a.to_string()));
    }

    /// Partition the network into two groups that cannot reach each other.
    pub fn partition<S: AsRef<str>>(&self, group_a: &[S], group_b: &[S]) {
        for a in group_a {
            for b in group_b {
                self.block_link(a.as_ref(), b.as_ref());
            }
        }
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().blocked.clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RequestHandler>> {
        let state = self.state.lock().unwrap();
        if state
            .blocked
            .contains(&(from.to_string(), to.to_string()))
        {
            return Err(Error::transport(to, "link blocked"));
        }
        state
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| Error::transport(to, "endpoint unreachable"))
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, addr: &str, request: Request) -> Result<Response> {
        let handler = self.network.route(&self.local, addr)?;
        debug!("MemNet: {} -> {}", self.local, addr);
        Ok(handler.handle(request).await)
    }
}
