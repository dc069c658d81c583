//! In-process fan-out of decoded samples.
//!
//! A [`StreamBus`] is constructed explicitly and handed to whoever needs it.
//! Delivery is synchronous and ordered. Each subscriber runs in isolation: a
//! panicking callback is logged and the remaining subscribers still receive
//! the sample.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::warn;

use bend_types::Sample;

type Callback = Arc<dyn Fn(&Sample) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, Callback)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) {
        self.subscribers().retain(|(sub_id, _)| *sub_id != id);
    }
}

/// Publish/subscribe channel for [`Sample`]s.
///
/// Cloning yields another handle to the same bus.
///
/// # Example
///
/// ```
/// use bend_core::StreamBus;
/// use bend_types::Sample;
/// use std::sync::{Arc, Mutex};
///
/// let bus = StreamBus::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let subscription = bus.subscribe(move |s: &Sample| sink.lock().unwrap().push(s.sequence));
///
/// bus.publish(&Sample::from_payload(&[], 0, time::OffsetDateTime::UNIX_EPOCH));
/// subscription.unsubscribe();
/// bus.publish(&Sample::from_payload(&[], 1, time::OffsetDateTime::UNIX_EPOCH));
///
/// assert_eq!(*seen.lock().unwrap(), vec![0]);
/// ```
#[derive(Clone, Default)]
pub struct StreamBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for StreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_count())
            .finish()
    }
}

impl StreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every sample published from now on.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes; call
    /// [`Subscription::detach`] to keep the callback for the bus's lifetime.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Sample) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push((id, Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe through an unbounded channel, for async consumers.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Sample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |sample: &Sample| {
            // A closed receiver just means the consumer went away.
            let _ = tx.send(*sample);
        });
        (subscription, rx)
    }

    /// Deliver `sample` to every current subscriber, in registration order.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn publish(&self, sample: &Sample) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let snapshot: Vec<(u64, Callback)> = self.inner.subscribers().clone();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(sample))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    subscriber = id,
                    sequence = sample.sequence,
                    "stream subscriber panicked"
                ),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Total samples published since the bus was created.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

/// Handle to a [`StreamBus`] registration.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Stop receiving samples. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel)
            && let Some(bus) = self.bus.upgrade()
        {
            bus.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.bus.strong_count() > 0
    }

    /// Keep the callback registered after this handle is dropped.
    pub fn detach(mut self) {
        self.bus = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn sample(sequence: u64) -> Sample {
        Sample {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            angle: Some(sequence as f32),
            stretch: None,
            sequence,
        }
    }

    fn recorder(bus: &StreamBus) -> (Subscription, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(move |s: &Sample| sink.lock().unwrap().push(s.sequence));
        (sub, seen)
    }

    #[test]
    fn test_every_subscriber_sees_every_sample_in_order() {
        let bus = StreamBus::new();
        let (_a, seen_a) = recorder(&bus);
        let (_b, seen_b) = recorder(&bus);

        for seq in 0..5 {
            assert_eq!(bus.publish(&sample(seq)), 2);
        }

        assert_eq!(*seen_a.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*seen_b.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(bus.published_count(), 5);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_samples() {
        let bus = StreamBus::new();
        bus.publish(&sample(0));
        let (_sub, seen) = recorder(&bus);
        bus.publish(&sample(1));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = StreamBus::new();
        let (sub, seen) = recorder(&bus);
        let (_other, _) = recorder(&bus);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&sample(0));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_unsubscribes_and_detach_keeps() {
        let bus = StreamBus::new();
        {
            let (_sub, _) = recorder(&bus);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);

        let (sub, seen) = recorder(&bus);
        sub.detach();
        bus.publish(&sample(9));
        assert_eq!(*seen.lock().unwrap(), vec![9]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = StreamBus::new();
        let _bad = bus.subscribe(|_: &Sample| panic!("subscriber bug"));
        let (_good, seen) = recorder(&bus);

        assert_eq!(bus.publish(&sample(0)), 1);
        assert_eq!(bus.publish(&sample(1)), 1);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let bus = StreamBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in = Arc::clone(&slot);
        let sub = bus.subscribe(move |_: &Sample| {
            if let Some(sub) = slot_in.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        bus.publish(&sample(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let bus = StreamBus::new();
        let (_sub, mut rx) = bus.subscribe_channel();
        bus.publish(&sample(3));
        assert_eq!(rx.recv().await.unwrap().sequence, 3);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = StreamBus::new();
        let (sub, _) = recorder(&bus);
        drop(bus);
        assert!(!sub.is_active());
        sub.unsubscribe();
    }
}
