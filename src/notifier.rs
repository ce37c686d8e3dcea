//! Hands received application payloads to subscribed hooks.
//!
//! Each hook gets the payload and a [`Reply`] handle addressed at the
//! message's origin. A failing hook is logged and does not stop the others.

use crate::error::NodeError;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::warn;

/// Application payload carried by `data` and `oncedata` messages.
pub type Payload = Value;

/// Answers the sender of a payload directly, without flooding.
pub trait Reply: Send + Sync {
    /// Send `data` back to whoever sent the payload being handled.
    fn reply(&self, data: Payload) -> Result<(), NodeError>;
}

/// Failure reported by a hook.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<&str> for HookError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for HookError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<NodeError> for HookError {
    fn from(err: NodeError) -> Self {
        Self(err.to_string())
    }
}

/// A subscribed callback.
pub type Hook = Arc<dyn Fn(&Payload, &dyn Reply) -> Result<(), HookError> + Send + Sync>;

/// Handle returned by [`Notifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered set of hooks.
#[derive(Default)]
pub struct Notifier {
    hooks: RwLock<Vec<(SubscriptionId, Hook)>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook`; hooks fire in subscription order.
    pub fn subscribe<F>(&self, hook: F) -> SubscriptionId
    where
        F: Fn(&Payload, &dyn Reply) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().push((id, Arc::new(hook)));
        id
    }

    /// Remove a hook. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(sub, _)| *sub != id);
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every hook with `payload`. Returns the number of hooks that failed.
    pub fn fire(&self, payload: &Payload, reply: &dyn Reply) -> usize {
        // Snapshot so hooks may (un)subscribe while running.
        let hooks: Vec<(SubscriptionId, Hook)> = self.hooks.read().clone();
        let mut failed = 0;
        for (id, hook) in hooks {
            if let Err(e) = hook(payload, reply) {
                failed += 1;
                warn!(subscription = id.0, error = %e, "hook failed");
            }
        }
        failed
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("hooks", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Payload>>);

    impl Reply for Recorder {
        fn reply(&self, data: Payload) -> Result<(), NodeError> {
            self.0.lock().push(data);
            Ok(())
        }
    }

    #[test]
    fn test_failing_hook_does_not_stop_others() {
        let notifier = Notifier::new();
        let seen = Arc::new(AtomicU64::new(0));

        notifier.subscribe(|_, _| Err("boom".into()));
        let counter = Arc::clone(&seen);
        notifier.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failed = notifier.fire(&json!({"n": 1}), &Recorder::default());
        assert_eq!(failed, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reply_and_unsubscribe() {
        let notifier = Notifier::new();
        let id = notifier.subscribe(|payload, reply| {
            reply.reply(json!({"echo": payload}))?;
            Ok(())
        });
        let recorder = Recorder::default();
        notifier.fire(&json!("ping"), &recorder);
        assert_eq!(recorder.0.lock().as_slice(), &[json!({"echo": "ping"})]);

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        assert!(notifier.is_empty());
        notifier.fire(&json!("again"), &recorder);
        assert_eq!(recorder.0.lock().len(), 1);
    }
}
