//! # Target Adapter
//!
//! Wraps a local callable behind one uniform, awaitable `invoke(args)`.
//!
//! A target follows one of two calling conventions:
//!
//! - **Callback**: the callable receives the arguments plus a one-shot
//!   [`Completion`] and settles it with an `(error, value)` pair.
//! - **Promised**: the callable returns a deferred value (a future) whose
//!   resolution or rejection is the outcome.
//!
//! The convention is fixed when the `Target` is built. Typed callers pick it
//! explicitly with [`Target::callback`] or [`Target::promised`]. Hosts that
//! only know a callable by its parameter names use [`Target::from_export`],
//! which applies the naming heuristic in [`TargetKind::from_param_names`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::load::InvocationCounter;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The export is not something that can be called.
    #[error("unsupported target: {0} is not callable")]
    UnsupportedTarget(&'static str),
    /// A promised-style target handed back a plain value instead of a deferred one.
    #[error("target must be asynchronous")]
    TargetNotAsynchronous,
    /// The target settled with an error value.
    #[error("target failed: {0}")]
    Failed(Value),
    /// A callback-style target dropped its completion without settling it.
    #[error("target dropped its completion without settling it")]
    CompletionDropped,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The calling convention of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Callback,
    Promised,
}

impl TargetKind {
    /// Guesses the convention from declared parameter names.
    ///
    /// A final parameter named exactly `cb` or `callback` means `Callback`;
    /// anything else, including no parameters at all, means `Promised`. This
    /// looks at names only and says nothing about how the callable behaves.
    pub fn from_param_names<S: AsRef<str>>(names: &[S]) -> Self {
        match names.last().map(AsRef::as_ref) {
            Some("cb") | Some("callback") => Self::Callback,
            _ => Self::Promised,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Callback => "callback",
            Self::Promised => "promised",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one-shot completion handed to callback-style targets.
///
/// Settling consumes it, so only the first `(error, value)` pair counts.
pub struct Completion {
    tx: oneshot::Sender<Result<Value>>,
}

impl Completion {
    fn channel() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Settles with an `(error, value)` pair: any error wins over the value.
    pub fn complete(self, error: Option<Value>, value: Value) {
        match error {
            Some(error) => self.fail(error),
            None => self.ok(value),
        }
    }

    pub fn ok(self, value: Value) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, error: Value) {
        let _ = self.tx.send(Err(Error::Failed(error)));
    }
}

/// What a callable hands back when called.
pub enum Returned {
    /// A deferred value; `Err` is a rejection carrying the error value.
    Deferred(BoxFuture<'static, std::result::Result<Value, Value>>),
    /// A plain value, available immediately.
    Value(Value),
}

impl Returned {
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
    {
        Self::Deferred(Box::pin(fut))
    }
}

/// A callable described only by its parameter names, as a dynamic host sees it.
///
/// The completion is `Some` exactly when the callable was classified as
/// callback-style.
pub type DynamicFn = dyn Fn(Vec<Value>, Option<Completion>) -> Returned + Send + Sync;

/// A resolved export: something that may or may not be callable.
#[derive(Clone)]
pub enum Export {
    Function {
        params: Vec<String>,
        body: Arc<DynamicFn>,
    },
    Value(Value),
}

impl Export {
    pub fn function<F>(params: &[&str], body: F) -> Self
    where
        F: Fn(Vec<Value>, Option<Completion>) -> Returned + Send + Sync + 'static,
    {
        Self::Function {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Arc::new(body),
        }
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function { params, .. } => f.debug_struct("Function").field("params", params).finish(),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

type CallbackFn = dyn Fn(Vec<Value>, Completion) -> Returned + Send + Sync;
type PromisedFn = dyn Fn(Vec<Value>) -> Returned + Send + Sync;

#[derive(Clone)]
enum Body {
    Callback(Arc<CallbackFn>),
    Promised(Arc<PromisedFn>),
}

/// A classified callable plus its invocation counter.
///
/// Clones share the counter.
#[derive(Clone)]
pub struct Target {
    body: Body,
    counter: Arc<InvocationCounter>,
}

impl Target {
    /// A callback-style target. `f` must eventually settle the completion.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>, Completion) + Send + Sync + 'static,
    {
        Self::from_body(Body::Callback(Arc::new(move |args, done| {
            f(args, done);
            Returned::Value(Value::Null)
        })))
    }

    /// A promised-style target returning a future.
    pub fn promised<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
    {
        Self::from_body(Body::Promised(Arc::new(move |args| Returned::deferred(f(args)))))
    }

    /// A promised-style target that may or may not return a deferred value.
    ///
    /// Plain values make `invoke` fail with `TargetNotAsynchronous`.
    pub fn promised_raw<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Returned + Send + Sync + 'static,
    {
        Self::from_body(Body::Promised(Arc::new(f)))
    }

    /// Classifies a resolved export by its parameter names.
    pub fn from_export(export: Export) -> Result<Self> {
        let (params, body) = match export {
            Export::Function { params, body } => (params, body),
            Export::Value(v) => return Err(Error::UnsupportedTarget(value_kind(&v))),
        };

        let target = match TargetKind::from_param_names(&params) {
            TargetKind::Callback => Self::from_body(Body::Callback(Arc::new(move |args, done| body(args, Some(done))))),
            TargetKind::Promised => Self::from_body(Body::Promised(Arc::new(move |args| body(args, None)))),
        };
        Ok(target)
    }

    fn from_body(body: Body) -> Self {
        Self {
            body,
            counter: Arc::new(InvocationCounter::new()),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self.body {
            Body::Callback(_) => TargetKind::Callback,
            Body::Promised(_) => TargetKind::Promised,
        }
    }

    pub fn counter(&self) -> &Arc<InvocationCounter> {
        &self.counter
    }

    /// Calls the target and waits for its single outcome.
    ///
    /// The invocation is counted before the target runs, whatever the outcome.
    /// There is no timeout: a target that holds its completion forever keeps
    /// this future pending forever.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.counter.record();

        match &self.body {
            Body::Callback(f) => {
                let (done, mut rx) = Completion::channel();
                match f(args, done) {
                    // whichever settles first
                    Returned::Deferred(mut fut) => tokio::select! {
                        Ok(outcome) = &mut rx => outcome,
                        result = &mut fut => result.map_err(Error::Failed),
                    },
                    Returned::Value(_) => rx.await.unwrap_or(Err(Error::CompletionDropped)),
                }
            }
            Body::Promised(f) => match f(args) {
                Returned::Deferred(fut) => fut.await.map_err(Error::Failed),
                Returned::Value(_) => Err(Error::TargetNotAsynchronous),
            },
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("kind", &self.kind())
            .field("pending", &self.counter.pending())
            .finish()
    }
}

fn value_kind(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
