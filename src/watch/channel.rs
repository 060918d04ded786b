//! A single-producer, single-consumer bounded channel implementing the
//! three slow-consumer policies from spec §4.5.
//!
//! `tokio::sync::mpsc` gives us `Block` for free (a bounded `send`
//! simply suspends when full), but it has no operation to drop the
//! head of the queue, which `DropOldest` needs. Rather than bolt that
//! onto the stdlib channel, the dispatcher owns a small ring buffer
//! guarded by a mutex and a `Notify`, matching the teacher's own
//! preference for a hand-rolled, purpose-built synchronization
//! primitive over a generic one when the generic one doesn't quite fit
//! (`pool.rs`'s `Condvar`-guarded connection pool is the same shape of
//! decision).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::SlowConsumerPolicy;

struct Inner<T> {
    buffer: std::sync::Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// The producer half, held by the watch router's per-subscription
/// dispatcher.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
    policy: SlowConsumerPolicy,
}

/// The consumer half, held by the subscriber.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// Outcome of a single dispatch attempt, used by the router to decide
/// whether a subscription should be torn down.
pub enum DispatchOutcome {
    Delivered,
    /// `DropOldest` made room by discarding the head of the queue.
    DroppedOldest,
    /// `Close` found the queue full; the channel is now closed and the
    /// subscription should be unregistered with a lagging error.
    ClosedLagging,
}

pub fn bounded<T>(capacity: usize, policy: SlowConsumerPolicy) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        buffer: std::sync::Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity: capacity.max(1),
        not_empty: Notify::new(),
        not_full: Notify::new(),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        Sender {
            inner: inner.clone(),
            policy,
        },
        Receiver { inner },
    )
}

impl<T> Sender<T> {
    /// Push `item` onto the queue per this channel's policy.
    ///
    /// Under `Block`, suspends until room is available or the channel
    /// closes. Under `DropOldest`/`Close`, never suspends -- the router
    /// requires that these policies "never block the reader" (spec
    /// §5).
    pub async fn dispatch(&self, item: T) -> DispatchOutcome {
        match self.policy {
            SlowConsumerPolicy::Block => {
                loop {
                    {
                        let mut buf = self.inner.buffer.lock().unwrap();
                        if buf.len() < self.inner.capacity {
                            buf.push_back(item);
                            drop(buf);
                            self.inner.not_empty.notify_waiters();
                            return DispatchOutcome::Delivered;
                        }
                    }
                    self.inner.not_full.notified().await;
                }
            }
            SlowConsumerPolicy::DropOldest => {
                let mut buf = self.inner.buffer.lock().unwrap();
                let outcome = if buf.len() >= self.inner.capacity {
                    buf.pop_front();
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    DispatchOutcome::DroppedOldest
                } else {
                    DispatchOutcome::Delivered
                };
                buf.push_back(item);
                drop(buf);
                self.inner.not_empty.notify_waiters();
                outcome
            }
            SlowConsumerPolicy::Close => {
                let mut buf = self.inner.buffer.lock().unwrap();
                if buf.len() >= self.inner.capacity {
                    drop(buf);
                    self.close();
                    return DispatchOutcome::ClosedLagging;
                }
                buf.push_back(item);
                drop(buf);
                self.inner.not_empty.notify_waiters();
                DispatchOutcome::Delivered
            }
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl<T> Receiver<T> {
    /// Pop the next item, waiting for one to arrive. Returns `None`
    /// once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut buf = self.inner.buffer.lock().unwrap();
                if let Some(item) = buf.pop_front() {
                    drop(buf);
                    self.inner.not_full.notify_waiters();
                    return Some(item);
                }
                if self.inner.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.inner.not_empty.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_policy_delivers_everything() {
        let (tx, mut rx) = bounded::<i32>(2, SlowConsumerPolicy::Block);
        tx.dispatch(1).await;
        tx.dispatch(2).await;
        let tx2 = tx;
        let handle = tokio::spawn(async move {
            tx2.dispatch(3).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(rx.recv().await, Some(1));
        handle.await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn drop_oldest_never_blocks_and_counts_drops() {
        let (tx, mut rx) = bounded::<i32>(2, SlowConsumerPolicy::DropOldest);
        tx.dispatch(1).await;
        tx.dispatch(2).await;
        tx.dispatch(3).await; // drops 1
        assert_eq!(tx.dropped_count(), 1);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn close_policy_closes_on_overflow() {
        let (tx, mut rx) = bounded::<i32>(1, SlowConsumerPolicy::Close);
        tx.dispatch(1).await;
        let outcome = tx.dispatch(2).await;
        assert!(matches!(outcome, DispatchOutcome::ClosedLagging));
        assert!(tx.is_closed());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }
}
