//! One-shot completion shared between an engine callback context and the
//! request handler waiting on it.
//!
//! The first `resolve` wins; every later call (a success after a failure, a
//! repeated gathering-complete notification) is ignored. Waiters that start
//! after resolution see the stored value immediately.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

pub struct Completion<T> {
    resolved: AtomicBool,
    value: watch::Sender<Option<T>>,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (value, _) = watch::channel(None);
        Self {
            resolved: AtomicBool::new(false),
            value,
        }
    }

    /// Store `value` unless already resolved. Returns whether this call won.
    pub fn resolve(&self, value: T) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.value.send_replace(Some(value));
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Wait for the resolved value. Callers bound this with a timeout.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.value.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        result.ok().and_then(|v| v.clone())
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn first_resolution_wins() {
        let done = Completion::new();
        assert!(done.resolve(true));
        assert!(!done.resolve(false));
        assert!(!done.resolve(true));
        assert_eq!(done.wait().await, Some(true));
    }

    #[tokio::test]
    async fn waiter_wakes_on_resolution_from_other_task() {
        let done = Arc::new(Completion::new());
        let resolver = Arc::clone(&done);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve("ready".to_string());
        });
        let value = tokio::time::timeout(Duration::from_secs(5), done.wait())
            .await
            .expect("waiter should wake");
        assert_eq!(value.as_deref(), Some("ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_wait_is_bounded_by_caller_timeout() {
        let done: Completion<bool> = Completion::new();
        let result = tokio::time::timeout(Duration::from_secs(10), done.wait()).await;
        assert!(result.is_err());
        assert!(!done.is_resolved());
    }

    #[tokio::test]
    async fn concurrent_resolvers_resolve_exactly_once() {
        let done = Arc::new(Completion::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let done = Arc::clone(&done);
            handles.push(tokio::spawn(async move { done.resolve(i) }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(done.wait().await.is_some());
    }
}
