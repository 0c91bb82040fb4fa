use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SqlMiddlewareDbError;

#[derive(Debug, Default)]
struct QueueState {
    pending: usize,
    closed: bool,
}

/// Tracks notifications that arrived since the last completed wait.
///
/// Handlers receive the notification itself; waiters only learn that one arrived.
#[derive(Debug, Default)]
pub(crate) struct NotificationQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl NotificationQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self) {
        self.lock().pending += 1;
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Consume everything pending. `Some(Ok(()))` when something was pending,
    /// `Some(Err(..))` once the connection is gone, `None` to keep waiting.
    fn take(&self) -> Option<Result<(), SqlMiddlewareDbError>> {
        let mut state = self.lock();
        if state.pending > 0 {
            state.pending = 0;
            Some(Ok(()))
        } else if state.closed {
            Some(Err(SqlMiddlewareDbError::ConnectionStateError(
                "connection closed while waiting for a notification".to_string(),
            )))
        } else {
            None
        }
    }

    /// Wait until a notification is pending.
    ///
    /// Returns `Ok(true)` when one arrived (or was already pending), `Ok(false)` on timeout.
    /// `None` waits indefinitely; a zero timeout only checks what is pending.
    pub(crate) async fn wait(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, SqlMiddlewareDbError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a push between the check and the await is not lost
            notified.as_mut().enable();

            if let Some(outcome) = self.take() {
                return outcome.map(|()| true);
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(cancelled());
            }

            let cancelled_fut = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(deadline) => {
                            return self.take().map_or(Ok(false), |outcome| outcome.map(|()| true));
                        }
                        () = cancelled_fut => return Err(cancelled()),
                    }
                }
                None => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancelled_fut => return Err(cancelled()),
                    }
                }
            }
        }
    }
}

fn cancelled() -> SqlMiddlewareDbError {
    SqlMiddlewareDbError::Cancelled("wait for notification cancelled".to_string())
}

/// Map a millisecond timeout onto `wait`'s timeout: negative waits indefinitely, zero polls.
#[must_use]
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pending_notification_returns_immediately() {
        let queue = NotificationQueue::default();
        queue.push();
        queue.push();
        assert_eq!(queue.pending(), 2);

        assert!(queue.wait(None, None).await.unwrap());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_notification_returns_false_after_deadline() {
        let queue = NotificationQueue::default();
        let started = Instant::now();
        let arrived = queue
            .wait(Some(Duration::from_millis(250)), None)
            .await
            .unwrap();
        assert!(!arrived);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn zero_timeout_polls() {
        let queue = NotificationQueue::default();
        assert!(!queue.wait(Some(Duration::ZERO), None).await.unwrap());
        queue.push();
        assert!(queue.wait(Some(Duration::ZERO), None).await.unwrap());
    }

    #[tokio::test]
    async fn waiter_wakes_on_push() {
        let queue = Arc::new(NotificationQueue::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(Some(Duration::from_secs(5)), None).await })
        };
        tokio::task::yield_now().await;
        queue.push();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let queue = Arc::new(NotificationQueue::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(None, None).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(SqlMiddlewareDbError::ConnectionStateError(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_leaves_pending_count_alone() {
        let queue = NotificationQueue::default();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            queue.wait(None, Some(&token)).await,
            Err(SqlMiddlewareDbError::Cancelled(_))
        ));
    }

    #[test]
    fn millis_mapping() {
        assert_eq!(timeout_from_millis(-1), None);
        assert_eq!(timeout_from_millis(0), Some(Duration::ZERO));
        assert_eq!(timeout_from_millis(1500), Some(Duration::from_millis(1500)));
    }
}
