use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// The central Order entity.
///
/// Guarded fields: `payment_intent_id` is write-once; `is_paid` flips
/// false→true at most once and never back. Both are enforced by the
/// conditional updates in `store::SeaOrderStore`, never by plain writes.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Externally-visible, human-readable order number
    #[sea_orm(unique)]
    #[validate(length(
        min = 1,
        max = 50,
        message = "Order number must be between 1 and 50 characters"
    ))]
    pub order_number: String,

    /// Owning user; `Uuid::nil()` for anonymous-session orders
    pub user_id: Uuid,

    /// Cart this order was snapshotted from, deleted only after payment
    #[sea_orm(nullable)]
    pub cart_id: Option<Uuid>,

    pub status: OrderStatus,

    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,

    pub is_paid: bool,
    #[sea_orm(nullable)]
    pub paid_at: Option<DateTime<Utc>>,

    #[sea_orm(nullable)]
    pub payment_provider: Option<String>,
    /// Provider-side intent id; unique once assigned, immutable after
    #[sea_orm(unique, nullable)]
    pub payment_intent_id: Option<String>,
    #[sea_orm(nullable)]
    pub payment_status: Option<String>,
    /// Provider-side capture id; unique once assigned
    #[sea_orm(unique, nullable)]
    pub capture_id: Option<String>,
    #[sea_orm(nullable)]
    pub captured_at: Option<DateTime<Utc>>,
    /// Raw provider response, persisted verbatim for audit
    #[sea_orm(column_type = "Json", nullable)]
    pub provider_payload: Option<Json>,

    /// Correlation token echoed through the provider's custom field;
    /// degraded-path resolution key when neither order id nor intent id match
    #[sea_orm(unique, nullable)]
    pub temp_ref: Option<String>,

    #[sea_orm(nullable)]
    pub approval_url: Option<String>,

    /// Shipping address snapshot, captured at checkout, never linked live
    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,

    #[sea_orm(nullable)]
    pub tracking_number: Option<String>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::order_status_history::Entity")]
    StatusHistory,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order lifecycle status. `Processing` is the terminal success state of the
/// reconciliation core; later fulfillment states belong to downstream
/// systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Approved => "approved",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Terminal statuses are never overwritten by a later transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Processing
                | OrderStatus::Shipped
                | OrderStatus::Delivered
                | OrderStatus::Cancelled
                | OrderStatus::Refunded
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shipping address snapshot stored on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    pub recipient: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    /// Country name or code as supplied by the caller; normalized to
    /// ISO-3166-1 alpha-2 at the gateway boundary
    #[validate(length(min = 1, message = "Country is required"))]
    pub country: String,
}
