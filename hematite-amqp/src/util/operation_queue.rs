//! A single-slot completion queue bridging event-loop completions into
//! blocking, cancellable waits.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A single-slot asynchronous operation queue.
///
/// One side (typically an event loop) completes the operation with
/// [`complete`](AsyncOperationQueue::complete); the other side blocks on
/// [`wait`](AsyncOperationQueue::wait) or
/// [`wait_until`](AsyncOperationQueue::wait_until) until the result is
/// available, the deadline passes, or the token is cancelled.
///
/// The queue buffers exactly one outstanding result. The request/response
/// exchanges in this crate are designed around one outstanding completion per
/// queue, so completing a second time before the waiter consumed the first
/// result is an invariant violation and panics. A completion that arrives
/// after the waiter gave up is kept in the slot and dropped with the queue.
#[derive(Debug)]
pub struct AsyncOperationQueue<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for AsyncOperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncOperationQueue<T> {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Stores the result of a completed operation and wakes the waiter.
    ///
    /// # Panics
    ///
    /// Panics if a previous result is still buffered. Exactly one operation
    /// may be outstanding per queue.
    pub fn complete(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            panic!("AsyncOperationQueue completed twice before the result was consumed");
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_one();
    }

    /// Takes the buffered result without waiting
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Waits for a result until the deadline.
    ///
    /// Returns `None` if the deadline passes first. A deadline that already
    /// expired returns without blocking; a buffered result is still consumed
    /// in that case. `None` as the deadline waits indefinitely.
    pub async fn wait_until(&self, deadline: Option<Instant>) -> Option<T> {
        loop {
            if let Some(value) = self.try_take() {
                return Some(value);
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => return self.try_take(),
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Waits for a result until the token is cancelled.
    ///
    /// Returns `None` promptly on cancellation; a token that is already
    /// cancelled returns without blocking. A completion that arrives after
    /// cancellation stays in the slot and is discarded with the queue.
    pub async fn wait(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if let Some(value) = self.try_take() {
                return Some(value);
            }

            if cancel.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return self.try_take(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::AsyncOperationQueue;

    #[tokio::test]
    async fn expired_deadline_returns_none_without_blocking() {
        let queue = AsyncOperationQueue::<u32>::new();
        let deadline = Instant::now() - Duration::from_secs(1);

        let start = Instant::now();
        let result = queue.wait_until(Some(deadline)).await;
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn cancelled_token_returns_none_without_blocking() {
        let queue = AsyncOperationQueue::<u32>::new();
        let token = CancellationToken::new();
        token.cancel();

        assert!(queue.wait(&token).await.is_none());
    }

    #[tokio::test]
    async fn completion_before_deadline_is_returned_exactly_once() {
        let queue = Arc::new(AsyncOperationQueue::<u32>::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .wait_until(Some(Instant::now() + Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.complete(42);

        assert_eq!(waiter.await.unwrap(), Some(42));
        assert!(queue.try_take().is_none());
    }

    #[tokio::test]
    async fn completion_stored_before_wait_is_visible() {
        let queue = AsyncOperationQueue::<&str>::new();
        queue.complete("done");
        let result = queue.wait_until(None).await;
        assert_eq!(result, Some("done"));
    }

    #[tokio::test]
    async fn late_completion_after_cancellation_is_discarded_silently() {
        let queue = Arc::new(AsyncOperationQueue::<u32>::new());
        let token = CancellationToken::new();
        token.cancel();

        assert!(queue.wait(&token).await.is_none());

        // The waiter is gone; a late completion must not panic or leak into
        // a later logical operation beyond the explicit take below.
        queue.complete(7);
        assert_eq!(queue.try_take(), Some(7));
    }

    #[test]
    #[should_panic]
    fn double_completion_panics() {
        let queue = AsyncOperationQueue::<u32>::new();
        queue.complete(1);
        queue.complete(2);
    }
}
