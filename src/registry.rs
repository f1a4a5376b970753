//! Process-wide set of live subscriber connections.
//!
//! Registration, removal and the broadcast snapshot share one mutex. Sends
//! always run against a snapshot taken under that lock and never hold it, so
//! a slow peer cannot stall connects or disconnects.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("subscriber connection closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outbound half of a subscriber connection.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), SendError>;

    /// Called once the registry has dropped this handle, so the owning
    /// session can hang up instead of idling on a dead feed.
    async fn close(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: Vec<SubscriberId>,
}

type Entry = (SubscriberId, Arc<dyn Subscriber>);

// Data-pointer identity; vtable pointers for one type can differ between
// codegen units.
fn same_handle(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub struct ConnectionRegistry {
    live: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    fn live(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `subscriber`. Registering a handle that is already live returns
    /// its existing id and leaves the set unchanged.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let (id, total) = {
            let mut live = self.live();
            if let Some((existing, _)) = live.iter().find(|(_, s)| same_handle(s, &subscriber)) {
                return *existing;
            }
            let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
            live.push((id, subscriber));
            (id, live.len())
        };
        debug!(subscriber = %id, total, "[REGISTRY] subscriber registered");
        id
    }

    /// Remove `id` if present. Returns whether anything was removed; removing
    /// an absent id is a no-op.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let (removed, total) = {
            let mut live = self.live();
            let before = live.len();
            live.retain(|(entry, _)| *entry != id);
            (live.len() != before, live.len())
        };
        if removed {
            debug!(subscriber = %id, total, "[REGISTRY] subscriber removed");
        }
        removed
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.live().iter().any(|(entry, _)| *entry == id)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    fn snapshot(&self) -> Vec<Entry> {
        self.live().clone()
    }

    /// One send attempt per member of the snapshot; members whose send fails
    /// or times out are unregistered and closed before this returns.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let snapshot = self.snapshot();
        let timeout = self.send_timeout;
        let sends = snapshot.iter().map(|(id, subscriber)| async move {
            let result = match tokio::time::timeout(timeout, subscriber.send_text(text)).await {
                Ok(result) => result,
                Err(_) => Err(SendError::TimedOut(timeout)),
            };
            (*id, subscriber, result)
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport {
            attempted: results.len(),
            ..BroadcastReport::default()
        };
        let mut evicted = Vec::new();
        for (id, subscriber, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(subscriber = %id, "[REGISTRY] dropping subscriber: {}", e);
                    self.unregister(id);
                    report.dropped.push(id);
                    evicted.push(subscriber);
                }
            }
        }
        join_all(evicted.into_iter().map(|subscriber| subscriber.close())).await;
        report
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.len())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<String>>,
        broken: AtomicBool,
        closed: AtomicBool,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn send_text(&self, text: &str) -> Result<(), SendError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SendError::Closed);
            }
            self.received.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Stalled {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Subscriber for Stalled {
        async fn send_text(&self, _text: &str) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn registered_subscriber_gets_exactly_one_send() {
        let reg = registry();
        let rec = Arc::new(Recorder::default());
        let id = reg.register(rec.clone());
        let report = reg.broadcast("tick-1").await;
        assert_eq!(rec.count(), 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 1);
        assert!(reg.contains(id));
    }

    #[tokio::test]
    async fn unregistered_subscriber_gets_nothing() {
        let reg = registry();
        let rec = Arc::new(Recorder::default());
        let id = reg.register(rec.clone());
        assert!(reg.unregister(id));
        let report = reg.broadcast("tick-1").await;
        assert_eq!(rec.count(), 0);
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn failed_send_removes_only_that_subscriber() {
        let reg = registry();
        let healthy = Arc::new(Recorder::default());
        let broken = Arc::new(Recorder::default());
        broken.broken.store(true, Ordering::SeqCst);
        let healthy_id = reg.register(healthy.clone());
        let broken_id = reg.register(broken.clone());

        let report = reg.broadcast("tick-1").await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![broken_id]);
        assert!(!reg.contains(broken_id));
        assert!(reg.contains(healthy_id));
        assert_eq!(healthy.count(), 1);
        assert!(broken.closed.load(Ordering::SeqCst));
        assert!(!healthy.closed.load(Ordering::SeqCst));

        reg.broadcast("tick-2").await;
        assert_eq!(healthy.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_times_out_and_is_dropped() {
        let reg = registry();
        let healthy = Arc::new(Recorder::default());
        reg.register(healthy.clone());
        let stalled = Arc::new(Stalled::default());
        let stalled_id = reg.register(stalled.clone());

        let report = reg.broadcast("tick-1").await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.dropped, vec![stalled_id]);
        assert_eq!(healthy.count(), 1);
        assert_eq!(reg.len(), 1);
        assert!(stalled.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = registry();
        let keep = reg.register(Arc::new(Recorder::default()));
        let gone = reg.register(Arc::new(Recorder::default()));
        assert!(reg.unregister(gone));
        assert!(!reg.unregister(gone));
        assert!(!reg.unregister(gone));
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(keep));
    }

    #[tokio::test]
    async fn same_handle_registers_once() {
        let reg = registry();
        let rec = Arc::new(Recorder::default());
        let a = reg.register(rec.clone());
        let b = reg.register(rec.clone());
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);

        let report = reg.broadcast("tick-1").await;
        assert_eq!(report.attempted, 1);
        assert_eq!(rec.count(), 1);
    }

    #[test]
    fn distinct_handles_get_distinct_ids() {
        let reg = registry();
        let a = reg.register(Arc::new(Recorder::default()));
        let b = reg.register(Arc::new(Recorder::default()));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_leaves_no_torn_entries() {
        let reg = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let id = reg.register(Arc::new(Recorder::default()));
                    tokio::task::yield_now().await;
                    assert!(reg.unregister(id));
                }
            }));
        }
        let broadcaster = {
            let reg = reg.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    reg.broadcast("tick").await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for t in tasks {
            t.await.unwrap();
        }
        broadcaster.await.unwrap();
        assert!(reg.is_empty());
    }
}
