use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus};
use crate::entities::{order_item, order_status_history};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::store::{OrderPatch, OrderStore};

/// Full order aggregate as exposed to callers: the order row, its immutable
/// line items, and the append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAggregate {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub history: Vec<order_status_history::Model>,
}

/// Read and lifecycle operations outside the reconciliation hot path.
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    events: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, events: Option<Arc<EventSender>>) -> Self {
        Self { store, events }
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderAggregate, ServiceError> {
        let order = self
            .store
            .get_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;
        let items = self.store.items(order_id).await?;
        let history = self.store.history(order_id).await?;
        Ok(OrderAggregate {
            order,
            items,
            history,
        })
    }

    /// Cancels an order that has not yet been paid. Paid and terminal orders
    /// are refused: `is_paid` never goes back and terminal statuses are
    /// never overwritten.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .store
            .get_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;

        if order.is_paid || order.status.is_terminal() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is {} and can no longer be cancelled",
                order_id, order.status
            )));
        }

        let note = reason.unwrap_or_else(|| "cancelled by user".to_string());
        let won = self
            .store
            .compare_and_set_status(order_id, order.status, OrderStatus::Cancelled, &note)
            .await?;
        if !won {
            // Status advanced concurrently (payment may have landed);
            // callers should re-read rather than retry blindly.
            return Err(ServiceError::ConcurrentUpdateLost(order_id));
        }

        info!(order_id = %order_id, "order cancelled");
        if let Some(events) = &self.events {
            if let Err(e) = events.send(Event::OrderCancelled(order_id)).await {
                warn!(error = %e, order_id = %order_id, "failed to send order cancelled event");
            }
        }

        self.store
            .get_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))
    }

    /// Last-write-wins update of non-guarded fields (tracking number,
    /// free-text notes). Payment state is not expressible through the patch,
    /// so a fulfillment-side update can never touch it.
    #[instrument(skip(self, patch), fields(order_id = %order_id))]
    pub async fn update_order(
        &self,
        order_id: Uuid,
        patch: OrderPatch,
    ) -> Result<order::Model, ServiceError> {
        self.store.update_fields(order_id, patch).await
    }

    /// Records an annotation in the status history at the order's current
    /// status, without touching the order row.
    #[instrument(skip(self, note), fields(order_id = %order_id))]
    pub async fn add_note(&self, order_id: Uuid, note: &str) -> Result<(), ServiceError> {
        let order = self
            .store
            .get_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;
        self.store.append_history(order_id, order.status, note).await
    }

    /// Cancels pending orders older than `older_than`. The embedding service
    /// schedules this sweep.
    #[instrument(skip(self))]
    pub async fn expire_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let expired = self.store.expire_stale_pending(older_than).await?;
        if expired > 0 {
            info!(expired = expired, "stale pending orders expired");
        }
        Ok(expired)
    }
}
