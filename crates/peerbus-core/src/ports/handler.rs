//! Request handler port.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;

/// Who is calling a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerContext {
    /// Caller's peer id; this bus's own id for local calls.
    pub peer_id: String,
    pub origin: Option<String>,
    pub request_id: String,
    pub handler: String,
}

/// Answers requests for one handler name.
///
/// Returning a `BusError` (through `anyhow`) keeps its kind on the wire;
/// any other error is reported as `HANDLER_ERROR`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn call(&self, args: Value, context: HandlerContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F, Fut>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value, context: HandlerContext) -> anyhow::Result<Value> {
        (self.f)(args, context).await
    }
}
