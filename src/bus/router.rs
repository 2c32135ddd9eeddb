use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Single local fan-out point for everything that arrives on a side of the bus.
///
/// Every live [`Subscription`] receives every delivered event in delivery
/// order; filtering happens on the consuming side. Queues are unbounded, so a
/// slow consumer never blocks the publisher and any number of subscriptions
/// may coexist.
pub struct Router<E> {
    inner: Arc<RouterInner<E>>,
}

struct RouterInner<E> {
    subscribers: Mutex<Subscribers<E>>,
}

struct Subscribers<E> {
    next_id: u64,
    slots: Vec<(u64, mpsc::UnboundedSender<E>)>,
    closed: bool,
}

impl<E> Clone for Router<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for Router<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Router<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                subscribers: Mutex::new(Subscribers {
                    next_id: 0,
                    slots: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Register a new consumer. It observes events delivered from now on.
    ///
    /// Subscribing to a closed router yields a subscription that is already
    /// exhausted.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        if !subscribers.closed {
            subscribers.slots.push((id, tx));
        }
        Subscription {
            id,
            rx,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Yield to the scheduler once, then deliver `event` to every current
    /// subscription.
    ///
    /// The yield lets a consumer that reacted to the previous event finish
    /// registering its follow-up subscriptions before this one is fanned out.
    pub async fn publish(&self, event: E) -> usize {
        tokio::task::yield_now().await;
        self.deliver(event)
    }

    /// Deliver `event` to every current subscription without yielding.
    /// Returns how many subscriptions received it.
    pub fn deliver(&self, event: E) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers
            .slots
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subscribers.slots.len()
    }

    /// End every subscription and refuse new ones.
    pub fn close(&self) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.closed = true;
        subscribers.slots.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.subscribers.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().slots.len()
    }
}

/// A live consumer of a [`Router`]. Dropping it releases its slot.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    router: Weak<RouterInner<E>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event. `None` once the router is closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.rx.poll_recv(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.router.upgrade() {
            let id = self.id;
            inner
                .subscribers
                .lock()
                .slots
                .retain(|(slot_id, _)| *slot_id != id);
        }
    }
}

/// What a filtered consumer should do with an observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Skip,
    End,
}

/// Message filter applied by consumers of the router.
///
/// - `worker_id`: only messages from this test worker; the consumer ends when
///   that worker deregisters, and messages whose worker is already gone are
///   dropped.
/// - `reply_to`: only replies to this correlation id. Without it, only
///   top-level messages (no `reply_to`) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub worker_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageFilter {
    /// Top-level messages from any worker.
    pub fn top_level() -> Self {
        Self::default()
    }

    /// Replies to `id` from any worker.
    pub fn replies_to(id: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            reply_to: Some(id.into()),
        }
    }

    /// Restrict this filter to one test worker.
    pub fn bound_to(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Decide on a message envelope. `worker_present` reports whether the
    /// sending worker was still registered when the message was routed.
    pub fn check_message(
        &self,
        worker_id: Option<&str>,
        reply_to: Option<&str>,
        worker_present: bool,
    ) -> Verdict {
        if let Some(bound) = self.worker_id.as_deref() {
            if worker_id != Some(bound) {
                return Verdict::Skip;
            }
            if !worker_present {
                tracing::trace!(worker_id = bound, "Dropping message from departed worker");
                return Verdict::Skip;
            }
        }

        match (self.reply_to.as_deref(), reply_to) {
            (None, None) => Verdict::Deliver,
            (Some(expected), Some(actual)) if expected == actual => Verdict::Deliver,
            _ => Verdict::Skip,
        }
    }

    /// Decide on a `deregister-worker` envelope.
    pub fn check_deregistration(&self, worker_id: &str) -> Verdict {
        if self.worker_id.as_deref() == Some(worker_id) {
            Verdict::End
        } else {
            Verdict::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscription_sees_events_in_order() {
        let router = Router::new();
        let mut first = router.subscribe();
        let mut second = router.subscribe();

        for n in 0..5 {
            assert_eq!(router.publish(n).await, 2);
        }

        for n in 0..5 {
            assert_eq!(first.recv().await, Some(n));
        }
        for n in 0..5 {
            assert_eq!(second.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn late_subscription_only_sees_later_events() {
        let router = Router::new();
        router.deliver("early");
        let mut late = router.subscribe();
        router.deliver("late");
        assert_eq!(late.recv().await, Some("late"));
        assert!(late.rx.try_recv().is_err());
    }

    #[test]
    fn dropping_a_subscription_releases_its_slot() {
        let router: Router<u32> = Router::new();
        let kept = router.subscribe();
        let dropped = router.subscribe();
        assert_eq!(router.subscriber_count(), 2);

        drop(dropped);
        assert_eq!(router.subscriber_count(), 1);
        assert_eq!(router.deliver(1), 1);
        drop(kept);
        assert_eq!(router.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let router = Router::new();
        let mut subscription = router.subscribe();
        router.deliver(7_u8);
        router.close();

        assert_eq!(subscription.recv().await, Some(7));
        assert_eq!(subscription.recv().await, None);

        let mut after_close = router.subscribe();
        assert_eq!(after_close.recv().await, None);
        assert!(router.is_closed());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn subscription_made_in_the_same_turn_observes_publish() {
        let router = Router::new();

        let publisher = {
            let router = router.clone();
            tokio::spawn(async move { router.publish("event").await })
        };
        let mut subscription = router.subscribe();

        assert_eq!(publisher.await.unwrap(), 1);
        assert_eq!(subscription.recv().await, Some("event"));
    }

    #[test]
    fn top_level_filter_skips_replies() {
        let filter = MessageFilter::top_level();
        assert_eq!(filter.check_message(Some("w1"), None, true), Verdict::Deliver);
        assert_eq!(filter.check_message(Some("w1"), Some("x"), true), Verdict::Skip);
    }

    #[test]
    fn reply_filter_matches_only_its_id() {
        let filter = MessageFilter::replies_to("p/message/1");
        assert_eq!(
            filter.check_message(Some("w1"), Some("p/message/1"), true),
            Verdict::Deliver
        );
        assert_eq!(
            filter.check_message(Some("w1"), Some("p/message/2"), true),
            Verdict::Skip
        );
        assert_eq!(filter.check_message(Some("w1"), None, true), Verdict::Skip);
    }

    #[test]
    fn bound_filter_drops_other_workers_and_stale_messages() {
        let filter = MessageFilter::top_level().bound_to("w1");
        assert_eq!(filter.check_message(Some("w2"), None, true), Verdict::Skip);
        assert_eq!(filter.check_message(Some("w1"), None, false), Verdict::Skip);
        assert_eq!(filter.check_message(Some("w1"), None, true), Verdict::Deliver);
    }

    #[test]
    fn unbound_filter_still_delivers_stale_messages() {
        let filter = MessageFilter::top_level();
        assert_eq!(filter.check_message(Some("gone"), None, false), Verdict::Deliver);
    }

    #[test]
    fn bound_filter_ends_on_own_deregistration_only() {
        let filter = MessageFilter::replies_to("id").bound_to("w1");
        assert_eq!(filter.check_deregistration("w2"), Verdict::Skip);
        assert_eq!(filter.check_deregistration("w1"), Verdict::End);
        assert_eq!(MessageFilter::top_level().check_deregistration("w1"), Verdict::Skip);
    }
}
