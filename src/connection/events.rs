//! Subscriber registry for backend push events.
//!
//! Subscribing and unsubscribing take the registry mutex only for the add/remove itself.
//! Dispatch clones the current handler list under the lock and runs it outside the lock,
//! so a handler removed mid-dispatch still sees the event already in flight and no
//! handler blocks subscription changes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_postgres::Notification;
use tokio_postgres::error::DbError;

/// Handler invoked for each notice the backend sends (warnings, `RAISE NOTICE`, ...).
pub type NoticeHandler = Arc<dyn Fn(&DbError) + Send + Sync>;
/// Handler invoked for each `NOTIFY` delivered to a channel this session listens on.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notice,
    Notification,
}

/// Identifies one registration; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Copy-on-write list of handlers for one event type.
pub(crate) struct HandlerList<E: ?Sized> {
    entries: Arc<Vec<(u64, Arc<dyn Fn(&E) + Send + Sync>)>>,
}

impl<E: ?Sized> Default for HandlerList<E> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Vec::new()),
        }
    }
}

impl<E: ?Sized> HandlerList<E> {
    pub(crate) fn push(&mut self, id: u64, handler: Arc<dyn Fn(&E) + Send + Sync>) {
        Arc::make_mut(&mut self.entries).push((id, handler));
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|(entry, _)| *entry == id) else {
            return false;
        };
        Arc::make_mut(&mut self.entries).remove(pos);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<(u64, Arc<dyn Fn(&E) + Send + Sync>)>> {
        Arc::clone(&self.entries)
    }
}

/// Invoke every handler in `snapshot` once, in registration order.
pub(crate) fn deliver<E: ?Sized>(
    snapshot: &[(u64, Arc<dyn Fn(&E) + Send + Sync>)],
    event: &E,
    kind: EventKind,
) {
    for (id, handler) in snapshot {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            tracing::warn!(subscription = id, ?kind, "event handler panicked");
        }
    }
}

#[derive(Default)]
struct Subscribers {
    notice: HandlerList<DbError>,
    notification: HandlerList<Notification>,
}

/// Per-connection registry of notice and notification subscribers.
#[derive(Default)]
pub(crate) struct EventRegistry {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl EventRegistry {
    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // handlers never run under this lock, so a poisoned guard still holds a consistent list
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_handle(&self, kind: EventKind) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    pub(crate) fn subscribe_notice(&self, handler: NoticeHandler) -> SubscriptionHandle {
        let handle = self.next_handle(EventKind::Notice);
        self.lock().notice.push(handle.id, handler);
        handle
    }

    pub(crate) fn subscribe_notification(&self, handler: NotificationHandler) -> SubscriptionHandle {
        let handle = self.next_handle(EventKind::Notification);
        self.lock().notification.push(handle.id, handler);
        handle
    }

    pub(crate) fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.lock();
        match handle.kind {
            EventKind::Notice => subscribers.notice.remove(handle.id),
            EventKind::Notification => subscribers.notification.remove(handle.id),
        }
    }

    pub(crate) fn subscriber_count(&self, kind: EventKind) -> usize {
        let subscribers = self.lock();
        match kind {
            EventKind::Notice => subscribers.notice.len(),
            EventKind::Notification => subscribers.notification.len(),
        }
    }

    pub(crate) fn dispatch_notice(&self, notice: &DbError) {
        let snapshot = self.lock().notice.snapshot();
        deliver(&snapshot, notice, EventKind::Notice);
    }

    pub(crate) fn dispatch_notification(&self, notification: &Notification) {
        let snapshot = self.lock().notification.snapshot();
        deliver(&snapshot, notification, EventKind::Notification);
    }

    pub(crate) fn clear(&self) {
        *self.lock() = Subscribers::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, name: &'static str) -> Arc<dyn Fn(&str) + Send + Sync> {
        let log = Arc::clone(log);
        Arc::new(move |event: &str| log.lock().unwrap().push(format!("{name}:{event}")))
    }

    #[test]
    fn delivery_follows_insertion_order() {
        let log: Log = Arc::default();
        let mut list: HandlerList<str> = HandlerList::default();
        list.push(1, recorder(&log, "b"));
        list.push(2, recorder(&log, "a"));
        list.push(3, recorder(&log, "c"));

        deliver(&list.snapshot(), "x", EventKind::Notice);
        assert_eq!(*log.lock().unwrap(), vec!["b:x", "a:x", "c:x"]);
    }

    #[test]
    fn removal_during_dispatch_spares_in_flight_event() {
        let log: Log = Arc::default();
        let list: Arc<Mutex<HandlerList<str>>> = Arc::default();

        let remover = {
            let list = Arc::clone(&list);
            Arc::new(move |_: &str| {
                list.lock().unwrap().remove(2);
            }) as Arc<dyn Fn(&str) + Send + Sync>
        };
        list.lock().unwrap().push(1, remover);
        list.lock().unwrap().push(2, recorder(&log, "victim"));

        let first = list.lock().unwrap().snapshot();
        deliver(&first, "one", EventKind::Notification);
        let second = list.lock().unwrap().snapshot();
        deliver(&second, "two", EventKind::Notification);

        assert_eq!(*log.lock().unwrap(), vec!["victim:one"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let log: Log = Arc::default();
        let mut list: HandlerList<str> = HandlerList::default();
        list.push(1, Arc::new(|_: &str| panic!("handler failure")));
        list.push(2, recorder(&log, "after"));

        deliver(&list.snapshot(), "x", EventKind::Notice);
        assert_eq!(*log.lock().unwrap(), vec!["after:x"]);
    }

    #[test]
    fn unsubscribe_is_by_handle_not_identity() {
        let registry = EventRegistry::default();
        let handler: NoticeHandler = Arc::new(|_| {});
        let first = registry.subscribe_notice(Arc::clone(&handler));
        let second = registry.subscribe_notice(handler);
        assert_ne!(first, second);
        assert_eq!(registry.subscriber_count(EventKind::Notice), 2);

        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        assert_eq!(registry.subscriber_count(EventKind::Notice), 1);
        assert_eq!(registry.subscriber_count(EventKind::Notification), 0);
    }

    #[test]
    fn handle_kind_selects_the_list() {
        let registry = EventRegistry::default();
        let notification = registry.subscribe_notification(Arc::new(|_| {}));
        assert_eq!(notification.kind(), EventKind::Notification);
        assert_eq!(registry.subscriber_count(EventKind::Notice), 0);
        assert!(registry.unsubscribe(notification));
        registry.subscribe_notice(Arc::new(|_| {}));
        registry.clear();
        assert_eq!(registry.subscriber_count(EventKind::Notice), 0);
    }

    #[test]
    fn concurrent_subscribe_unsubscribe_matches_net_effect() {
        let registry = Arc::new(EventRegistry::default());
        let kept = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                let kept = Arc::clone(&kept);
                thread::spawn(move || {
                    for round in 0..200 {
                        let handle = registry.subscribe_notification(Arc::new(|_| {}));
                        if (worker + round) % 3 == 0 {
                            kept.fetch_add(1, Ordering::Relaxed);
                        } else {
                            assert!(registry.unsubscribe(handle));
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(
            registry.subscriber_count(EventKind::Notification),
            kept.load(Ordering::Relaxed)
        );
    }
}
