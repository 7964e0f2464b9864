use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::entities::order;
use crate::events::{Event, EventSender};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("event channel error: {0}")]
    Channel(String),
}

/// Fire-and-forget consumer of "order reached paid" events.
///
/// The engine invokes this at most once per order, gated by the same
/// compare-and-set that flips `is_paid`, and swallows any error after
/// logging it: the money has already moved, so a notification failure must
/// never surface as a payment failure.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn order_paid(&self, order: &order::Model) -> Result<(), NotificationError>;
}

/// Default dispatcher: publishes an `OrderPaid` event for downstream
/// consumers (confirmation email, analytics) and logs.
pub struct EventNotificationDispatcher {
    events: Arc<EventSender>,
}

impl EventNotificationDispatcher {
    pub fn new(events: Arc<EventSender>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl NotificationDispatcher for EventNotificationDispatcher {
    async fn order_paid(&self, order: &order::Model) -> Result<(), NotificationError> {
        self.events
            .send(Event::OrderPaid {
                order_id: order.id,
                amount: order.total_amount,
                currency: order.currency.clone(),
            })
            .await
            .map_err(NotificationError::Channel)?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            "order paid notification dispatched"
        );
        Ok(())
    }
}
