//! TCP transport with pooled connections.
//!
//! One request/response exchange at a time per pooled connection; a send
//! that finds the pooled stream broken reconnects once. Every connect,
//! write and read is bounded by the configured deadline.

use super::{read_frame, write_frame, RequestHandler, Transport};
use crate::error::{Error, Result};
use crate::message::{Request, Response};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct TcpTransport {
    rpc_timeout: Duration,
    pool: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<TcpStream>>>>>,
}

impl TcpTransport {
    pub fn new(rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            rpc_timeout,
            pool: Mutex::new(HashMap::new()),
        })
    }

    fn slot(&self, addr: &str) -> Arc<tokio::sync::Mutex<Option<TcpStream>>> {
        self.pool
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_default()
            .clone()
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        addr: &str,
        body: &[u8],
    ) -> Result<Response> {
        timeout(self.rpc_timeout, write_frame(stream, body))
            .await
            .map_err(|_| Error::transport(addr, "write deadline"))??;
        let frame = timeout(self.rpc_timeout, read_frame(stream))
            .await
            .map_err(|_| Error::transport(addr, "read deadline"))??;
        Response::from_bytes(&frame)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, addr: &str, request: Request) -> Result<Response> {
        let body = request.to_bytes()?;
        let slot = self.slot(addr);
        let mut guard = slot.lock().await;

        // Reuse the pooled stream when it still works.
        if let Some(stream) = guard.as_mut() {
            match self.exchange(stream, addr, &body).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    debug!("Transport: pooled connection to {} failed: {}", addr, err);
                    *guard = None;
                }
            }
        }

        let mut stream = timeout(self.rpc_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::transport(addr, "connect deadline"))?
            .map_err(|e| Error::transport(addr, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::transport(addr, e))?;

        match self.exchange(&mut stream, addr, &body).await {
            Ok(resp) => {
                *guard = Some(stream);
                Ok(resp)
            }
            Err(err) => Err(err),
        }
    }

    fn close(&self, addr: &str) {
        self.pool.lock().unwrap().remove(addr);
    }
}

/// Bind `listen_addr` and serve inbound requests until shutdown.
///
/// Each connection is one task reading framed requests and writing framed
/// responses in order.
pub async fn serve(
    listen_addr: &str,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| Error::transport(listen_addr, e))?;
    debug!("Transport: listening on {}", listen_addr);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("Transport: accept failed: {}", err);
                            continue;
                        }
                    };
                    let handler = Arc::clone(&handler);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, handler, conn_shutdown).await {
                            debug!("Transport: connection from {} ended: {}", peer_addr, err);
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
    });
    Ok(handle)
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame?,
            _ = shutdown.changed() => return Ok(()),
        };
        let request = Request::from_bytes(&frame)?;
        let response = handler.handle(request).await;
        write_frame(&mut stream, &response.to_bytes()?).await?;
    }
}
