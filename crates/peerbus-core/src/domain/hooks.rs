//! # Hook Pipeline
//!
//! Priority-ordered payload transforms on the inbound and outbound paths.
//! Lower priority runs first; equal priorities run in registration order.
//! Each hook's output feeds the next. A failing or panicking hook is logged
//! and skipped: the pipeline continues with the payload as it stood before
//! that hook.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use peerbus_types::MessageType;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Priority used when none is given.
pub const DEFAULT_HOOK_PRIORITY: i32 = 10;

pub type HookId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookDirection {
    Inbound,
    Outbound,
}

/// What a hook is looking at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookContext {
    pub message_type: MessageType,
    pub peer_id: Option<String>,
    /// Handler name for requests, signal name for signals.
    pub handler: Option<String>,
    pub direction: HookDirection,
}

/// A payload transform.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn apply(&self, payload: Value, context: &HookContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`Hook`].
pub struct FnHook<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHook<F, Fut>
where
    F: Fn(Value, HookContext) -> Fut + Send + Sync,
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
impl<F, Fut> Hook for FnHook<F, Fut>
where
    F: Fn(Value, HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn apply(&self, payload: Value, context: &HookContext) -> anyhow::Result<Value> {
        (self.f)(payload, context.clone()).await
    }
}

struct HookEntry {
    id: HookId,
    priority: i32,
    hook: Arc<dyn Hook>,
}

/// One ordered list of hooks.
#[derive(Default)]
pub struct HookPipeline {
    hooks: Mutex<Vec<HookEntry>>,
    next_id: AtomicU64,
}

impl HookPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the list sorted by priority, after existing equals.
    pub fn add(&self, hook: Arc<dyn Hook>, priority: i32) -> HookId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut hooks = self.hooks.lock();
        let at = hooks.partition_point(|entry| entry.priority <= priority);
        hooks.insert(at, HookEntry { id, priority, hook });
        id
    }

    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|entry| entry.id != id);
        hooks.len() != before
    }

    pub fn clear(&self) {
        self.hooks.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Run every hook in order.
    pub async fn run(&self, payload: Value, context: &HookContext) -> Value {
        let hooks: Vec<(HookId, Arc<dyn Hook>)> = self
            .hooks
            .lock()
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.hook)))
            .collect();
        if hooks.is_empty() {
            return payload;
        }

        let mut current = payload;
        for (id, hook) in hooks {
            let input = current.clone();
            let applied = AssertUnwindSafe(async { hook.apply(input, context).await })
                .catch_unwind()
                .await;
            match applied {
                Ok(Ok(next)) => current = next,
                Ok(Err(e)) => warn!(
                    hook_id = id,
                    direction = ?context.direction,
                    message_type = %context.message_type,
                    error = %e,
                    "Hook failed; keeping previous payload"
                ),
                Err(_) => error!(
                    hook_id = id,
                    direction = ?context.direction,
                    message_type = %context.message_type,
                    "Hook panicked; keeping previous payload"
                ),
            }
        }
        current
    }
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline").field("hooks", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> HookContext {
        HookContext {
            message_type: MessageType::Signal,
            peer_id: Some("peer".to_string()),
            handler: None,
            direction: HookDirection::Outbound,
        }
    }

    fn tagging(tag: i64) -> Arc<dyn Hook> {
        Arc::new(FnHook::new(move |payload: Value, _ctx: HookContext| async move {
            let mut order = payload.as_array().cloned().unwrap_or_default();
            order.push(json!(tag));
            Ok::<_, anyhow::Error>(Value::Array(order))
        }))
    }

    #[tokio::test]
    async fn test_ascending_priority_regardless_of_registration() {
        let pipeline = HookPipeline::new();
        for priority in [20, 5, 10] {
            pipeline.add(tagging(i64::from(priority)), priority);
        }

        let out = pipeline.run(json!([]), &context()).await;
        assert_eq!(out, json!([5, 10, 20]));
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let pipeline = HookPipeline::new();
        pipeline.add(tagging(1), DEFAULT_HOOK_PRIORITY);
        pipeline.add(tagging(2), DEFAULT_HOOK_PRIORITY);
        pipeline.add(tagging(0), 0);

        let out = pipeline.run(json!([]), &context()).await;
        assert_eq!(out, json!([0, 1, 2]));
    }

    #[tokio::test]
    async fn test_failing_hook_keeps_previous_payload() {
        let pipeline = HookPipeline::new();
        pipeline.add(tagging(1), 1);
        pipeline.add(
            Arc::new(FnHook::new(|_payload: Value, _ctx: HookContext| async move {
                Err::<Value, _>(anyhow::anyhow!("hook exploded"))
            })),
            2,
        );
        pipeline.add(tagging(3), 3);

        let out = pipeline.run(json!([]), &context()).await;
        assert_eq!(out, json!([1, 3]));
    }

    #[tokio::test]
    async fn test_panicking_hook_keeps_previous_payload() {
        let pipeline = HookPipeline::new();
        pipeline.add(tagging(1), 1);
        pipeline.add(
            Arc::new(FnHook::new(|_payload: Value, _ctx: HookContext| async move {
                if true {
                    panic!("hook bug");
                }
                Ok::<_, anyhow::Error>(Value::Null)
            })),
            2,
        );
        pipeline.add(tagging(3), 3);

        let out = pipeline.run(json!([]), &context()).await;
        assert_eq!(out, json!([1, 3]));
    }

    #[tokio::test]
    async fn test_hook_sees_context() {
        let pipeline = HookPipeline::new();
        pipeline.add(
            Arc::new(FnHook::new(|payload: Value, ctx: HookContext| async move {
                Ok::<_, anyhow::Error>(json!({
                    "payload": payload,
                    "peer": ctx.peer_id,
                    "direction": ctx.direction,
                }))
            })),
            DEFAULT_HOOK_PRIORITY,
        );

        let out = pipeline.run(json!(7), &context()).await;
        assert_eq!(out, json!({ "payload": 7, "peer": "peer", "direction": "outbound" }));
    }

    #[tokio::test]
    async fn test_remove() {
        let pipeline = HookPipeline::new();
        let id = pipeline.add(tagging(1), 1);
        assert!(pipeline.remove(id));
        assert!(!pipeline.remove(id));
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.run(json!([]), &context()).await, json!([]));
    }
}
