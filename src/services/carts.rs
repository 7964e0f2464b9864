use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, EntityTrait, ModelTrait};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::commerce::{cart, Cart, CartItem};
use crate::errors::ServiceError;

/// Immutable snapshot of a live cart, taken at checkout start. The live cart
/// keeps existing until the order is paid; a failed payment loses no items.
#[derive(Debug, Clone)]
pub struct CartSnapshot {
    pub cart_id: Uuid,
    pub user_id: Option<Uuid>,
    pub currency: String,
    pub items: Vec<SnapshotItem>,
}

#[derive(Debug, Clone)]
pub struct SnapshotItem {
    pub product_ref: String,
    pub title: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub image_ref: Option<String>,
    pub attributes: Option<Value>,
}

/// Cart access needed by the checkout and the post-paid cleanup.
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn snapshot(&self, cart_id: Uuid) -> Result<CartSnapshot, ServiceError>;

    /// Deletes the cart and its items. Called only after the order is paid;
    /// the caller treats failure as best-effort.
    async fn delete(&self, cart_id: Uuid) -> Result<(), ServiceError>;
}

/// sea-orm implementation of [`CartStore`].
#[derive(Clone)]
pub struct SeaCartStore {
    db: Arc<DatabaseConnection>,
}

impl SeaCartStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CartStore for SeaCartStore {
    #[instrument(skip(self))]
    async fn snapshot(&self, cart_id: Uuid) -> Result<CartSnapshot, ServiceError> {
        let cart_model = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::ValidationError(format!("Cart {} not found", cart_id)))?;

        let items = cart_model
            .find_related(CartItem)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|item| SnapshotItem {
                product_ref: item.product_ref,
                title: item.title,
                unit_price: item.unit_price,
                quantity: item.quantity,
                image_ref: item.image_ref,
                attributes: item.attributes,
            })
            .collect();

        Ok(CartSnapshot {
            cart_id: cart_model.id,
            user_id: cart_model.user_id,
            currency: cart_model.currency,
            items,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        cart::Entity::delete_by_id(cart_id).exec(&*self.db).await?;
        info!(cart_id = %cart_id, "cart deleted after successful payment");
        Ok(())
    }
}
