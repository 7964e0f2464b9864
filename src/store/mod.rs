//! Durable persistence for orders.
//!
//! The order record is the only shared mutable resource in the core. Every
//! guarded mutation goes through a conditional update executed as one atomic
//! unit against the backing store; there is no read-check-write in two steps
//! and no external lock manager.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus, ShippingAddress};
use crate::entities::{order_item, order_status_history};
use crate::errors::ServiceError;

pub mod sea;

pub use sea::SeaOrderStore;

/// Line item captured for a new order.
#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub product_ref: String,
    pub title: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub image_ref: Option<String>,
    pub attributes: Option<Value>,
}

/// All fields needed to persist a new pending order with its immutable line
/// items and the initial history entry.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub cart_id: Option<Uuid>,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping_cost: Decimal,
    pub discount: Decimal,
    pub total_amount: Decimal,
    pub shipping_address: ShippingAddress,
    pub temp_ref: Option<String>,
    pub payment_provider: Option<String>,
    pub items: Vec<NewOrderLine>,
    /// Note for the initial `pending` history entry
    pub note: Option<String>,
}

/// Payload written when an order is finalized as paid.
#[derive(Debug, Clone)]
pub struct PaidFinalization {
    pub capture_id: Option<String>,
    pub provider_status: String,
    pub raw_payload: Value,
    pub paid_at: DateTime<Utc>,
    /// Note for the single `processing` history entry
    pub note: String,
}

/// Last-write-wins partial update for non-guarded fields.
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub tracking_number: Option<String>,
    pub notes: Option<String>,
}

/// Persistence contract for orders.
///
/// `compare_and_set_paid` is the linchpin primitive: it performs the
/// read-check-write as a single conditional update keyed on the current
/// `is_paid` value, which is what makes concurrent finalization race-safe.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists a new pending order, its line items, and the initial history
    /// entry, all durably.
    async fn create(&self, new_order: NewOrder) -> Result<order::Model, ServiceError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<order::Model>, ServiceError>;

    async fn get_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<order::Model>, ServiceError>;

    async fn get_by_temp_ref(&self, temp_ref: &str)
        -> Result<Option<order::Model>, ServiceError>;

    async fn items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError>;

    async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError>;

    /// Assigns the payment intent id and approval URL. Write-once: a repeat
    /// call with the same intent id is a no-op; a different intent id fails
    /// with `ConcurrentUpdateLost` so that an order never silently absorbs
    /// another payment.
    async fn set_intent(
        &self,
        id: Uuid,
        intent_id: &str,
        approval_url: &str,
    ) -> Result<(), ServiceError>;

    /// Atomically flips `is_paid` false→true, sets `paid_at`, advances the
    /// status to `processing`, records capture details and the raw provider
    /// payload, and appends exactly one history entry, all guarded by
    /// `is_paid == false`. Returns `true` only for the invocation that won
    /// the race.
    async fn compare_and_set_paid(
        &self,
        id: Uuid,
        finalization: PaidFinalization,
    ) -> Result<bool, ServiceError>;

    /// Atomically advances the status only if it currently equals `from`,
    /// appending one history entry on success. Returns `false` when the
    /// status already moved on; the caller must not clobber it.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: &str,
    ) -> Result<bool, ServiceError>;

    /// Fills in the capture id on an already-paid order that was finalized
    /// without one (a completed-capture webhook may omit it). Guarded on
    /// `is_paid == true` and `capture_id IS NULL`; never overwrites an
    /// existing capture id. Returns `true` when the fill happened.
    async fn backfill_capture_id(
        &self,
        id: Uuid,
        capture_id: &str,
    ) -> Result<bool, ServiceError>;

    /// Appends a history entry without touching the order row.
    async fn append_history(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        note: &str,
    ) -> Result<(), ServiceError>;

    /// Last-write-wins update of non-guarded fields (tracking number,
    /// free-text notes). Guarded fields are not expressible here.
    async fn update_fields(
        &self,
        id: Uuid,
        patch: OrderPatch,
    ) -> Result<order::Model, ServiceError>;

    /// Cancels pending orders created before `older_than`, one guarded
    /// transition per order. Returns how many were expired. Scheduling the
    /// sweep belongs to the embedding service.
    async fn expire_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, ServiceError>;
}
