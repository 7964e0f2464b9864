use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus};
use crate::entities::{order_item, order_status_history};
use crate::errors::ServiceError;
use crate::store::{NewOrder, OrderPatch, OrderStore, PaidFinalization};

/// sea-orm implementation of [`OrderStore`].
///
/// Guarded writes are single conditional UPDATE statements; `rows_affected`
/// discriminates the race winner from the losers.
#[derive(Clone)]
pub struct SeaOrderStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrderStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn history_row(
        order_id: Uuid,
        status: OrderStatus,
        note: &str,
    ) -> order_status_history::ActiveModel {
        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(status),
            note: Set(Some(note.to_string())),
            created_at: Set(Utc::now()),
        }
    }
}

#[async_trait::async_trait]
impl OrderStore for SeaOrderStore {
    #[instrument(skip(self, new_order), fields(order_id = %new_order.id, order_number = %new_order.order_number))]
    async fn create(&self, new_order: NewOrder) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let shipping = serde_json::to_value(&new_order.shipping_address)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let order_row = order::ActiveModel {
            id: Set(new_order.id),
            order_number: Set(new_order.order_number.clone()),
            user_id: Set(new_order.user_id),
            cart_id: Set(new_order.cart_id),
            status: Set(OrderStatus::Pending),
            currency: Set(new_order.currency.clone()),
            subtotal: Set(new_order.subtotal),
            tax: Set(new_order.tax),
            shipping_cost: Set(new_order.shipping_cost),
            discount: Set(new_order.discount),
            total_amount: Set(new_order.total_amount),
            is_paid: Set(false),
            paid_at: Set(None),
            payment_provider: Set(new_order.payment_provider.clone()),
            payment_intent_id: Set(None),
            payment_status: Set(None),
            capture_id: Set(None),
            captured_at: Set(None),
            provider_payload: Set(None),
            temp_ref: Set(new_order.temp_ref.clone()),
            approval_url: Set(None),
            shipping_address: Set(shipping),
            tracking_number: Set(None),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };

        let order_model = order_row.insert(&txn).await?;

        for line in &new_order.items {
            let item_row = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(new_order.id),
                product_ref: Set(line.product_ref.clone()),
                title: Set(line.title.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                image_ref: Set(line.image_ref.clone()),
                attributes: Set(line.attributes.clone()),
                created_at: Set(now),
            };
            item_row.insert(&txn).await?;
        }

        let note = new_order.note.as_deref().unwrap_or("order created");
        Self::history_row(new_order.id, OrderStatus::Pending, note)
            .insert(&txn)
            .await?;

        txn.commit().await?;
        Ok(order_model)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(id).one(&*self.db).await?)
    }

    async fn get_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::PaymentIntentId.eq(intent_id))
            .one(&*self.db)
            .await?)
    }

    async fn get_by_temp_ref(
        &self,
        temp_ref: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::TempRef.eq(temp_ref))
            .one(&*self.db)
            .await?)
    }

    async fn items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        Ok(order_status_history::Entity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self), fields(order_id = %id))]
    async fn set_intent(
        &self,
        id: Uuid,
        intent_id: &str,
        approval_url: &str,
    ) -> Result<(), ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(
                order::Column::PaymentIntentId,
                Expr::value(Some(intent_id.to_string())),
            )
            .col_expr(
                order::Column::ApprovalUrl,
                Expr::value(Some(approval_url.to_string())),
            )
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(Some("CREATED".to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::PaymentIntentId.is_null())
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 1 {
            return Ok(());
        }

        // Intent already assigned: same value is a benign retry, a different
        // value would let one order absorb another payment.
        match self.get_by_id(id).await? {
            Some(existing) if existing.payment_intent_id.as_deref() == Some(intent_id) => Ok(()),
            Some(_) => Err(ServiceError::ConcurrentUpdateLost(id)),
            None => Err(ServiceError::OrderNotFound(id.to_string())),
        }
    }

    #[instrument(skip(self, finalization), fields(order_id = %id))]
    async fn compare_and_set_paid(
        &self,
        id: Uuid,
        finalization: PaidFinalization,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let result = order::Entity::update_many()
            .col_expr(order::Column::IsPaid, Expr::value(true))
            .col_expr(
                order::Column::PaidAt,
                Expr::value(Some(finalization.paid_at)),
            )
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Processing))
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(Some(finalization.provider_status.clone())),
            )
            .col_expr(
                order::Column::CaptureId,
                Expr::value(finalization.capture_id.clone()),
            )
            .col_expr(
                order::Column::CapturedAt,
                Expr::value(Some(finalization.paid_at)),
            )
            .col_expr(
                order::Column::ProviderPayload,
                Expr::value(Some(finalization.raw_payload.clone())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::IsPaid.eq(false))
            .exec(&txn)
            .await?;

        let won = result.rows_affected == 1;
        if won {
            Self::history_row(id, OrderStatus::Processing, &finalization.note)
                .insert(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(won)
    }

    #[instrument(skip(self), fields(order_id = %id, from = %from, to = %to))]
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: &str,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(to))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::Status.eq(from))
            .exec(&txn)
            .await?;

        let won = result.rows_affected == 1;
        if won {
            Self::history_row(id, to, note).insert(&txn).await?;
        }

        txn.commit().await?;
        Ok(won)
    }

    #[instrument(skip(self), fields(order_id = %id))]
    async fn backfill_capture_id(
        &self,
        id: Uuid,
        capture_id: &str,
    ) -> Result<bool, ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(
                order::Column::CaptureId,
                Expr::value(Some(capture_id.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::IsPaid.eq(true))
            .filter(order::Column::CaptureId.is_null())
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn append_history(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        note: &str,
    ) -> Result<(), ServiceError> {
        Self::history_row(order_id, status, note)
            .insert(&*self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, patch), fields(order_id = %id))]
    async fn update_fields(
        &self,
        id: Uuid,
        patch: OrderPatch,
    ) -> Result<order::Model, ServiceError> {
        let mut update = order::Entity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(id));

        if let Some(tracking) = patch.tracking_number {
            update = update.col_expr(order::Column::TrackingNumber, Expr::value(Some(tracking)));
        }
        if let Some(notes) = patch.notes {
            update = update.col_expr(order::Column::Notes, Expr::value(Some(notes)));
        }

        update.exec(&*self.db).await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))
    }

    #[instrument(skip(self))]
    async fn expire_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let stale = order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::CreatedAt.lt(older_than))
            .all(&*self.db)
            .await?;

        let mut expired = 0u64;
        for order_model in stale {
            // Guarded per-order transition so each expiry gets its history
            // entry and a concurrently-advancing order is left alone.
            let won = self
                .compare_and_set_status(
                    order_model.id,
                    OrderStatus::Pending,
                    OrderStatus::Cancelled,
                    "expired by stale-pending sweep",
                )
                .await?;
            if won {
                expired += 1;
            }
        }
        Ok(expired)
    }
}
