//! Fan-out hub for live subscribers.
//!
//! Every subscriber owns a bounded private ring (a `tokio::sync::broadcast`
//! receiver). A slow or stalled subscriber lags and loses its *oldest*
//! pending messages — the documented drop-oldest policy — without ever
//! delaying delivery to the other subscribers or the broadcasting loop.
//! Unsubscription is dropping the [`Subscription`]; a delivery error on the
//! forwarding side does exactly that.

use tokio::sync::broadcast;
use tracing::debug;

use crate::models::WsServerEvent;

pub struct Broadcaster {
    tx: broadcast::Sender<WsServerEvent>,
}

impl Broadcaster {
    /// `capacity` bounds each subscriber's private delivery queue.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Deliver to every currently registered subscriber. Returns how many
    /// subscribers the event was queued for.
    pub fn broadcast(&self, event: WsServerEvent) -> usize {
        // Err only means nobody is listening right now.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle to a live subscription. Dropping it unregisters the subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<WsServerEvent>,
    dropped: u64,
}

impl Subscription {
    /// Next event, or `None` once the broadcaster is gone. A lagged receiver
    /// silently skips the discarded oldest messages and resumes with the
    /// newest available.
    pub async fn recv(&mut self) -> Option<WsServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    debug!(dropped = n, "slow subscriber; oldest pending messages discarded");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Total messages this subscriber lost to the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetTick, TickSource};

    fn tick_event(price: f64) -> WsServerEvent {
        WsServerEvent::Tick(AssetTick {
            asset_id: "bitcoin".to_string(),
            price,
            observed_at: 0,
            source: TickSource::Stream,
        })
    }

    fn price_of(event: &WsServerEvent) -> f64 {
        match event {
            WsServerEvent::Tick(t) => t.price,
            _ => panic!("expected tick"),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let hub = Broadcaster::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.broadcast(tick_event(1.0)), 2);
        assert_eq!(price_of(&a.recv().await.unwrap()), 1.0);
        assert_eq!(price_of(&b.recv().await.unwrap()), 1.0);
    }

    #[tokio::test]
    async fn stalled_subscriber_does_not_delay_others() {
        let hub = Broadcaster::new(4);
        let mut fast = hub.subscribe();
        let mut stalled = hub.subscribe(); // never drained while broadcasting

        for i in 0..20 {
            hub.broadcast(tick_event(i as f64));
            // The fast subscriber sees every message immediately.
            assert_eq!(price_of(&fast.recv().await.unwrap()), i as f64);
        }

        // The stalled subscriber lost its oldest entries but resumes with
        // the newest still buffered.
        let next = stalled.recv().await.unwrap();
        assert!(price_of(&next) >= 16.0);
        assert!(stalled.dropped() >= 16);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.broadcast(tick_event(1.0)), 0);
    }

    #[tokio::test]
    async fn recv_ends_when_broadcaster_dropped() {
        let hub = Broadcaster::new(4);
        let mut sub = hub.subscribe();
        drop(hub);
        assert!(sub.recv().await.is_none());
    }
}
