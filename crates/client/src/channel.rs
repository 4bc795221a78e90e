//! Broadcast channels for the command and output streams.
//!
//! A [`BroadcastChannel`] decouples producers from consumers in time:
//! publishing never waits for a consumer, and a subscriber only receives
//! items published after it subscribed. Two capacity policies exist:
//!
//! - [`Capacity::Unbounded`]: every subscriber gets its own unbounded queue.
//!   Nothing is ever dropped. Used for command input.
//! - [`Capacity::Bounded`]: a shared ring buffer. A subscriber that falls
//!   more than `n` items behind loses the oldest ones and is told how many it
//!   missed. Used for output, where stale lines may be sacrificed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::Stream;
use tokio::sync::{broadcast, mpsc};

/// Default ring size for bounded channels.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1024;

/// Buffering policy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Per-subscriber unbounded queues; lossless.
    Unbounded,
    /// Shared ring of the given size; slow subscribers lose the oldest items.
    Bounded(usize),
}

enum Backend<T> {
    Queues {
        subscribers: HashMap<u64, mpsc::UnboundedSender<T>>,
        next_id: u64,
    },
    Ring(broadcast::Sender<T>),
    Closed,
}

struct Inner<T> {
    name: &'static str,
    backend: Mutex<Backend<T>>,
    published: AtomicU64,
}

/// A multi-producer, multi-subscriber broadcast conduit.
///
/// Cloning the channel yields another handle to the same conduit.
pub struct BroadcastChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for BroadcastChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("name", &self.inner.name)
            .field("published", &self.published())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: Clone + Send + 'static> BroadcastChannel<T> {
    /// Creates a channel with the given capacity policy.
    ///
    /// `name` only appears in log output.
    pub fn new(name: &'static str, capacity: Capacity) -> Self {
        let backend = match capacity {
            Capacity::Unbounded => Backend::Queues {
                subscribers: HashMap::new(),
                next_id: 0,
            },
            Capacity::Bounded(size) => {
                let (tx, _) = broadcast::channel(size.max(1));
                Backend::Ring(tx)
            }
        };

        Self {
            inner: Arc::new(Inner {
                name,
                backend: Mutex::new(backend),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a lossless channel.
    pub fn unbounded(name: &'static str) -> Self {
        Self::new(name, Capacity::Unbounded)
    }

    /// Creates a ring-buffered channel that drops the oldest items for slow
    /// subscribers.
    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        Self::new(name, Capacity::Bounded(capacity))
    }

    /// Publishes an item to every current subscriber without blocking.
    ///
    /// Returns the number of subscribers the item was handed to. With no
    /// subscribers, or after [`close`](Self::close), the item is dropped.
    pub fn publish(&self, item: T) -> usize {
        let mut backend = self.backend();
        let delivered = match &mut *backend {
            Backend::Queues { subscribers, .. } => {
                subscribers.retain(|_, tx| !tx.is_closed());
                let mut delivered = 0;
                for tx in subscribers.values() {
                    if tx.send(item.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                delivered
            }
            Backend::Ring(tx) => tx.send(item).unwrap_or(0),
            Backend::Closed => {
                tracing::debug!(channel = self.inner.name, "Publish on closed channel dropped");
                return 0;
            }
        };

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if delivered == 0 {
            tracing::trace!(channel = self.inner.name, "No subscribers, item dropped");
        }
        delivered
    }

    /// Subscribes to items published from now on.
    ///
    /// Subscribing to a closed channel yields a subscription that ends
    /// immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut backend = self.backend();
        let receiver = match &mut *backend {
            Backend::Queues {
                subscribers,
                next_id,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                subscribers.insert(*next_id, tx);
                *next_id += 1;
                Receiver::Queue(rx)
            }
            Backend::Ring(tx) => Receiver::Ring(tx.subscribe()),
            Backend::Closed => Receiver::Ended,
        };

        tracing::debug!(channel = self.inner.name, "New subscriber");
        Subscription {
            receiver,
            channel: self.inner.name,
            missed: 0,
        }
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        match &mut *self.backend() {
            Backend::Queues { subscribers, .. } => {
                subscribers.retain(|_, tx| !tx.is_closed());
                subscribers.len()
            }
            Backend::Ring(tx) => tx.receiver_count(),
            Backend::Closed => 0,
        }
    }
}

impl<T> BroadcastChannel<T> {
    fn backend(&self) -> MutexGuard<'_, Backend<T>> {
        self.inner
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the channel.
    ///
    /// Subscribers drain whatever is already buffered and then end.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let mut backend = self.backend();
        if !matches!(*backend, Backend::Closed) {
            *backend = Backend::Closed;
            tracing::debug!(channel = self.inner.name, "Channel closed");
        }
    }

    /// Returns whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        matches!(*self.backend(), Backend::Closed)
    }

    /// Total number of items accepted by [`publish`](BroadcastChannel::publish).
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

enum Receiver<T> {
    Queue(mpsc::UnboundedReceiver<T>),
    Ring(broadcast::Receiver<T>),
    Ended,
}

/// A forward-only view of a channel, starting at the moment of subscription.
pub struct Subscription<T> {
    receiver: Receiver<T>,
    channel: &'static str,
    missed: u64,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Waits for the next item.
    ///
    /// Returns `None` once the channel is closed and drained. On a bounded
    /// channel, items lost to lag are skipped and added to
    /// [`missed`](Self::missed).
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.receiver {
            Receiver::Queue(rx) => rx.recv().await,
            Receiver::Ring(rx) => loop {
                match rx.recv().await {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.missed += skipped;
                        tracing::warn!(
                            channel = self.channel,
                            skipped,
                            total_missed = self.missed,
                            "Subscriber lagged, oldest items dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Receiver::Ended => None,
        }
    }

    /// Number of items this subscriber lost to lag.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Converts the subscription into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = T> + Send {
        futures_util::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|item| (item, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let channel = BroadcastChannel::<String>::bounded("test", 8);
        assert_eq!(channel.publish("lost".to_string()), 0);
        assert_eq!(channel.published(), 1);

        let channel = BroadcastChannel::<String>::unbounded("test");
        assert_eq!(channel.publish("lost".to_string()), 0);
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        for channel in [
            BroadcastChannel::<u32>::unbounded("test"),
            BroadcastChannel::<u32>::bounded("test", 64),
        ] {
            let mut sub = channel.subscribe();
            for i in 0..50 {
                channel.publish(i);
            }
            for i in 0..50 {
                assert_eq!(sub.recv().await, Some(i));
            }
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_history() {
        let channel = BroadcastChannel::<&'static str>::bounded("output", 16);
        let mut early = channel.subscribe();

        channel.publish("one");
        channel.publish("two");
        channel.publish("three");

        let mut late = channel.subscribe();
        channel.publish("four");
        channel.close();

        assert_eq!(late.recv().await, Some("four"));
        assert_eq!(late.recv().await, None);

        let mut seen = Vec::new();
        while let Some(item) = early.recv().await {
            seen.push(item);
        }
        assert_eq!(seen, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn test_late_subscriber_unbounded() {
        let channel = BroadcastChannel::<u8>::unbounded("commands");
        channel.publish(1);
        channel.publish(2);
        channel.publish(3);

        let mut late = channel.subscribe();
        channel.publish(4);
        assert_eq!(late.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive_everything() {
        let channel = BroadcastChannel::<u32>::bounded("output", 16);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        assert_eq!(channel.publish(7), 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_bounded_drops_oldest_for_slow_subscriber() {
        let channel = BroadcastChannel::<u32>::bounded("output", 4);
        let mut slow = channel.subscribe();

        for i in 0..10 {
            channel.publish(i);
        }

        // Only the newest four survive.
        assert_eq!(slow.recv().await, Some(6));
        assert_eq!(slow.missed(), 6);
        assert_eq!(slow.recv().await, Some(7));
        assert_eq!(slow.recv().await, Some(8));
        assert_eq!(slow.recv().await, Some(9));
    }

    #[tokio::test]
    async fn test_unbounded_never_drops() {
        let channel = BroadcastChannel::<u32>::unbounded("commands");
        let mut sub = channel.subscribe();

        for i in 0..10_000 {
            channel.publish(i);
        }
        for i in 0..10_000 {
            assert_eq!(sub.recv().await, Some(i));
        }
        assert_eq!(sub.missed(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let channel = BroadcastChannel::<u32>::unbounded("commands");
        let mut sub = channel.subscribe();
        channel.publish(1);
        channel.close();
        channel.close();

        assert!(channel.is_closed());
        assert_eq!(channel.publish(2), 0);
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends_immediately() {
        let channel = BroadcastChannel::<u32>::bounded("output", 4);
        channel.close();
        let mut sub = channel.subscribe();
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let channel = BroadcastChannel::<u32>::unbounded("commands");
        let mut sub = channel.subscribe();

        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());

        let publisher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(42);
        });

        let item = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(item, Some(42));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let channel = BroadcastChannel::<u32>::unbounded("commands");
        let sub = channel.subscribe();
        let _kept = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        drop(sub);
        assert_eq!(channel.publish(1), 1);
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let channel = BroadcastChannel::<u32>::bounded("output", 8);
        let stream = channel.subscribe().into_stream();
        channel.publish(1);
        channel.publish(2);
        channel.close();

        let items: Vec<u32> = stream.collect().await;
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_producer_order() {
        let channel = BroadcastChannel::<(u8, u32)>::unbounded("commands");
        let mut sub = channel.subscribe();

        let mut handles = Vec::new();
        for producer in 0..4u8 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    channel.publish((producer, i));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        channel.close();

        let mut last = [None::<u32>; 4];
        let mut count = 0;
        while let Some((producer, i)) = sub.recv().await {
            let slot = &mut last[producer as usize];
            if let Some(prev) = *slot {
                assert!(i > prev);
            }
            *slot = Some(i);
            count += 1;
        }
        assert_eq!(count, 400);
    }
}
