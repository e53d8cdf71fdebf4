//! # Local Endpoint
//!
//! The RPC server a service is reachable on. It accepts framed connections,
//! decodes calls, and hands each one to a [`Handler`] on its own task, so
//! slow calls never hold up fast ones on the same connection.
//!
//! A service endpoint registers exactly one method, `invoke`, through
//! [`InvokeHandler`].

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;

use servicify_rpc::FailureReason;
use servicify_rpc::ReplyErrEncoder;
use servicify_rpc::ReplyOkEncoder;
use servicify_rpc::RpcFrame;

use crate::target;
use crate::target::Target;
use crate::transport::TcpTransport;
use crate::transport::Transport;

/// The only method a service endpoint answers.
pub const INVOKE: &str = "invoke";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serves calls arriving at an endpoint.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, FailureReason>;
}

/// Routes `invoke(args)` to a target.
pub struct InvokeHandler {
    target: Target,
}

impl InvokeHandler {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

#[async_trait::async_trait]
impl Handler for InvokeHandler {
    async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, FailureReason> {
        if method != INVOKE {
            return Err(FailureReason::MethodNotFound(method.to_string()));
        }

        let Value::Array(args) = params else {
            return Err(FailureReason::InvalidParams("invoke takes an array of arguments".into()));
        };

        self.target.invoke(args).await.map_err(|e| match e {
            target::Error::Failed(data) => FailureReason::Application {
                message: "target failed".into(),
                data: Some(data),
            },
            other => FailureReason::Application {
                message: other.to_string(),
                data: None,
            },
        })
    }
}

/// A running endpoint. Dropping it without `stop` aborts it.
pub struct Endpoint {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    acceptor: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Binds `host:port` and starts accepting connections.
    pub async fn start(host: &str, port: u16, handler: Arc<dyn Handler>) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|source| Error::Bind {
            addr: format!("{}:{}", host, port),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: format!("{}:{}", host, port),
            source,
        })?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let acceptor = tokio::spawn(accept_loop(listener, handler, shutdown_rx));

        tracing::debug!(%local_addr, "endpoint listening");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every open connection, and releases the port.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.await;
        }
        tracing::debug!(local_addr = %self.local_addr, "endpoint stopped");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn Handler>, mut shutdown: oneshot::Receiver<()>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "connection accepted");
                    connections.spawn(serve_connection(stream, handler.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            // reap finished connections so the set does not grow without bound
            Some(_) = connections.join_next() => {}
        }
    }

    // listener drops here, before the connections are torn down
    drop(listener);
    connections.shutdown().await;
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn Handler>) {
    let _ = stream.set_nodelay(true);
    let transport = match TcpTransport::from_stream(stream) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            tracing::warn!(error = %e, "cannot serve connection");
            return;
        }
    };

    // recv is not cancel safe, so it is never raced against anything else
    let mut calls = JoinSet::new();
    loop {
        match transport.recv().await {
            Ok(Some(msg)) => {
                let transport = transport.clone();
                let handler = handler.clone();
                calls.spawn(async move {
                    if let Some(reply) = answer(&msg, handler.as_ref()).await {
                        if let Err(e) = transport.send(&reply).await {
                            tracing::debug!(error = %e, "reply not delivered");
                        }
                    }
                });
                while calls.try_join_next().is_some() {}
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "connection failed");
                break;
            }
        }
    }

    // let in-flight calls finish replying into the closing connection
    while calls.join_next().await.is_some() {}
}

/// Produces the reply frame for one inbound frame, if it deserves one.
async fn answer(msg: &[u8], handler: &dyn Handler) -> Option<Vec<u8>> {
    let call = match RpcFrame::decode(msg) {
        Ok(RpcFrame::Call(call)) => call,
        Ok(RpcFrame::Reply(_)) => {
            tracing::debug!("ignoring reply frame sent to endpoint");
            return None;
        }
        Err(e) => {
            let seq = servicify_rpc::decode_seq(msg).ok();
            let reason = match e {
                servicify_rpc::Error::Serialization(_) => FailureReason::ParseError,
                _ => FailureReason::InvalidRequest,
            };
            return encode_or_log(ReplyErrEncoder::new(seq, &reason).encode());
        }
    };

    match handler.handle(&call.method, call.params).await {
        Ok(result) => encode_or_log(ReplyOkEncoder::new(call.seq, &result).encode()),
        Err(reason) => encode_or_log(ReplyErrEncoder::new(Some(call.seq), &reason).encode()),
    }
}

fn encode_or_log(encoded: servicify_rpc::Result<Vec<u8>>) -> Option<Vec<u8>> {
    match encoded {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "cannot encode reply");
            None
        }
    }
}
