use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Events emitted by the reconciliation core.
///
/// Consumers (email dispatch, analytics, fulfillment) subscribe out of
/// process scope; the core only guarantees that `OrderPaid` is emitted at
/// most once per order, gated by the same compare-and-set that flips
/// `is_paid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderPaid {
        order_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    OrderCancelled(Uuid),
    CheckoutStarted {
        order_id: Uuid,
        cart_id: Option<Uuid>,
    },
    CartDeleted(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender
            .send(Event::OrderPaid {
                order_id,
                amount: dec!(36.74),
                currency: "USD".to_string(),
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::OrderPaid { order_id: id, amount, .. } => {
                assert_eq!(id, order_id);
                assert_eq!(amount, dec!(36.74));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender.send(Event::OrderCreated(Uuid::new_v4())).await.is_err());
    }
}
