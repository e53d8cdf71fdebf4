//! # Registry Client
//!
//! The two calls a service makes to the registry:
//!
//! - `offer(offering) -> offering`: registers on the first call (no `id`),
//!   refreshes on every later call (with `id`). Heartbeats are re-offers.
//! - `rescind(id) -> ack`: withdraws the offering.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::offering::Offering;
use crate::peer;
use crate::peer::Peer;
use crate::transport::TcpTransport;

pub const OFFER: &str = "offer";
pub const RESCIND: &str = "rescind";

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("registry at {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },
    #[error("registry call failed: {0}")]
    Call(#[from] peer::Error),
    #[error("unexpected registry reply: {0}")]
    BadReply(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait::async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn offer(&self, offering: &Offering) -> Result<Offering>;
    async fn rescind(&self, id: &str) -> Result<()>;
}

/// Talks to a registry over the framed RPC transport.
///
/// Connects on first use and reconnects after the connection drops, so it can
/// be built before the registry is up.
pub struct RpcRegistry {
    addr: String,
    call_timeout: Duration,
    peer: Mutex<Option<Arc<Peer>>>,
}

impl RpcRegistry {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            call_timeout: peer::DEFAULT_CALL_TIMEOUT,
            peer: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.registry_addr())
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn peer(&self) -> Result<Arc<Peer>> {
        let mut slot = self.peer.lock().await;
        if let Some(peer) = slot.as_ref() {
            if !peer.is_closed() {
                return Ok(peer.clone());
            }
            tracing::debug!(addr = %self.addr, "registry connection lost, reconnecting");
        }

        let transport = TcpTransport::connect(&self.addr).await.map_err(|e| Error::Unreachable {
            addr: self.addr.clone(),
            reason: e.to_string(),
        })?;
        let peer = Arc::new(Peer::new(format!("registry@{}", self.addr), Box::new(transport)).with_timeout(self.call_timeout));
        *slot = Some(peer.clone());
        Ok(peer)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let peer = self.peer().await?;
        Ok(peer.call(method, &params).await?)
    }
}

#[async_trait::async_trait]
impl Registry for RpcRegistry {
    async fn offer(&self, offering: &Offering) -> Result<Offering> {
        let reply = self.call(OFFER, json!([offering])).await?;
        serde_json::from_value(reply).map_err(|e| Error::BadReply(e.to_string()))
    }

    async fn rescind(&self, id: &str) -> Result<()> {
        self.call(RESCIND, json!([id])).await?;
        Ok(())
    }
}
