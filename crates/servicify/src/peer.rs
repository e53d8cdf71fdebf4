//! # Calling Side
//!
//! A `Peer` is one outbound connection: the registry client uses it for
//! `offer`/`rescind`, and callers use it to `invoke` a service.
//!
//! Replies come back in any order. A pump task reads every inbound frame and
//! settles the waiting call whose seq matches; a closed stream settles every
//! waiting call with the same error.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use servicify_rpc::CallEncoder;
use servicify_rpc::FailureReason;
use servicify_rpc::RpcFrame;

use crate::transport;
use crate::transport::Transport;

/// How long a call waits for its reply unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] transport::Error),
    #[error("bad frame: {0}")]
    Rpc(#[from] servicify_rpc::Error),
    #[error("remote failure: {0}")]
    Remote(FailureReason),
    #[error("no reply before the deadline")]
    Timeout,
    #[error("reply slot dropped")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Calls waiting for a reply, keyed by seq.
#[derive(Clone, Default)]
struct Waiting(Arc<DashMap<u64, oneshot::Sender<Result<Value>>>>);

impl Waiting {
    fn register(&self, seq: u64) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.0.insert(seq, tx);
        rx
    }

    fn forget(&self, seq: u64) {
        self.0.remove(&seq);
    }

    /// Returns false if nobody was waiting (late or duplicate reply).
    fn settle(&self, seq: u64, outcome: Result<Value>) -> bool {
        match self.0.remove(&seq) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn fail_all(&self, error: &Error) {
        let seqs: Vec<u64> = self.0.iter().map(|entry| *entry.key()).collect();
        for seq in seqs {
            self.settle(seq, Err(error.clone()));
        }
    }
}

/// One outbound RPC connection.
///
/// Share it behind an `Arc`; concurrent calls are told apart by seq.
pub struct Peer {
    peer_name: String,
    transport: Arc<dyn Transport>,
    waiting: Waiting,
    next_seq: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    pump: JoinHandle<()>,
}

impl Peer {
    /// Takes ownership of `transport` and starts reading replies from it.
    /// `peer_name` only shows up in logs.
    pub fn new(peer_name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let peer_name = peer_name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let waiting = Waiting::default();
        let closed = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(pump(
            peer_name.clone(),
            transport.clone(),
            waiting.clone(),
            closed.clone(),
        ));

        Self {
            peer_name,
            transport,
            waiting,
            next_seq: AtomicU64::new(1),
            closed,
            timeout: DEFAULT_CALL_TIMEOUT,
            pump,
        }
    }

    /// Overrides how long `call` waits for a reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// True once the pump has stopped; every later call fails.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends `method(params)` and waits for the matching reply.
    pub async fn call(&self, method: &str, params: &Value) -> Result<Value> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = CallEncoder::new(seq, method, params).encode()?;
        let reply = self.waiting.register(seq);

        if self.is_closed() {
            self.waiting.forget(seq);
            return Err(transport::Error::ConnectionLost(format!("{} is closed", self.peer_name)).into());
        }

        if let Err(e) = self.transport.send(&frame).await {
            self.waiting.forget(seq);
            return Err(e.into());
        }

        let outcome = tokio::time::timeout(self.timeout, reply).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.waiting.forget(seq);
                Err(Error::ChannelClosed)
            }
            Err(_) => {
                self.waiting.forget(seq);
                tracing::debug!(peer = %self.peer_name, method, seq, "call timed out");
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        // the pump holds the transport; stopping it releases the connection
        self.pump.abort();
    }
}

/// Reads replies until the stream ends or turns bad, then fails whoever is left.
async fn pump(peer_name: String, transport: Arc<dyn Transport>, waiting: Waiting, closed: Arc<AtomicBool>) {
    let error = loop {
        let frame = match transport.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(peer = %peer_name, "stream closed");
                break Error::Transport(transport::Error::ConnectionLost(format!("{peer_name} hung up")));
            }
            Err(e) => {
                tracing::debug!(peer = %peer_name, error = %e, "read failed");
                break Error::Transport(e);
            }
        };

        if let Err(e) = route_reply(&frame, &waiting) {
            tracing::warn!(peer = %peer_name, error = %e, "dropping connection after bad frame");
            break e;
        }
    };

    // set before failing the waiters so a racing call bails out on its own
    closed.store(true, Ordering::SeqCst);
    waiting.fail_all(&error);
}

fn route_reply(frame: &[u8], waiting: &Waiting) -> Result<()> {
    let RpcFrame::Reply(reply) = RpcFrame::decode(frame)? else {
        return Err(servicify_rpc::Error::ProtocolViolation("call frame on a calling connection".into()).into());
    };

    match reply.seq {
        Some(seq) => {
            if !waiting.settle(seq, reply.status.map_err(Error::Remote)) {
                tracing::debug!(seq, "reply for a call nobody is waiting on");
            }
        }
        None => tracing::debug!(status = ?reply.status.err(), "reply without id"),
    }
    Ok(())
}
