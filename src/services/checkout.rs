use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::{AppConfig, CheckoutPolicy};
use crate::entities::order::{OrderStatus, ShippingAddress};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{AmountBreakdown, CreateIntentRequest, IntentItem, PaymentGateway};
use crate::services::carts::CartStore;
use crate::store::{NewOrder, NewOrderLine, OrderStore};

/// Tolerance for comparing a caller-supplied total against the computed one.
pub const AMOUNT_TOLERANCE: Decimal = rust_decimal_macros::dec!(0.01);

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutItem {
    #[validate(length(min = 1, message = "Product reference is required"))]
    pub product_ref: String,
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub attributes: Option<Value>,
}

/// Input to `start_checkout`. Items come either inline or, when `cart_id` is
/// set, from a snapshot of the live cart.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StartCheckoutRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub cart_id: Option<Uuid>,
    #[serde(default)]
    #[validate]
    pub items: Vec<CheckoutItem>,
    #[validate]
    pub shipping: ShippingAddress,
    #[validate(url(message = "Return URL must be a valid URL"))]
    pub return_url: String,
    #[validate(url(message = "Cancel URL must be a valid URL"))]
    pub cancel_url: String,
    /// Discount already resolved by the promo-code engine (a pure function
    /// outside this core)
    #[serde(default)]
    pub discount: Decimal,
    /// Total the caller displayed to the user; compared against the computed
    /// total but never authoritative
    #[serde(default)]
    pub claimed_total: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutStarted {
    pub order_id: Uuid,
    pub order_number: String,
    pub approval_url: String,
}

/// Computed amount breakdown for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping_cost: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

/// Applies the pricing policy: fixed tax rate on the item subtotal, flat
/// shipping fee waived at or above the free-shipping threshold.
pub fn compute_totals(policy: &CheckoutPolicy, subtotal: Decimal, discount: Decimal) -> Totals {
    let shipping_cost = if subtotal >= policy.free_shipping_threshold {
        Decimal::ZERO
    } else {
        policy.shipping_fee
    };
    let tax = (subtotal * policy.tax_rate).round_dp(2);
    let total = subtotal + tax + shipping_cost - discount;
    Totals {
        subtotal,
        tax,
        shipping_cost,
        discount,
        total,
    }
}

/// Entry point of the checkout flow: snapshots the cart, persists the
/// pending order, requests a payment intent, and hands back the approval URL
/// the caller completes authorization with.
pub struct CheckoutOrchestrator {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    carts: Arc<dyn CartStore>,
    events: Option<Arc<EventSender>>,
    policy: CheckoutPolicy,
    provider_name: String,
}

impl CheckoutOrchestrator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        carts: Arc<dyn CartStore>,
        events: Option<Arc<EventSender>>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            carts,
            events,
            policy: config.checkout.clone(),
            provider_name: config.gateway.provider_name.clone(),
        }
    }

    /// Starts a checkout. Three durable side effects in order: the pending
    /// order is persisted, the intent is requested with the order id as the
    /// provider's echoed reference, and the intent id is persisted back. If
    /// intent creation fails the order is cancelled with a history note
    /// rather than left silently orphaned in `pending`.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn start_checkout(
        &self,
        request: StartCheckoutRequest,
    ) -> Result<CheckoutStarted, ServiceError> {
        request.validate()?;

        let items = self.resolve_items(&request).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Checkout requires at least one line item".to_string(),
            ));
        }
        for item in &items {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Item {} has non-positive quantity",
                    item.product_ref
                )));
            }
            if item.unit_price <= Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "Item {} has no known positive price",
                    item.product_ref
                )));
            }
        }

        let subtotal: Decimal = items
            .iter()
            .map(|i| i.unit_price * Decimal::from(i.quantity))
            .sum();
        let totals = compute_totals(&self.policy, subtotal, request.discount);

        if let Some(claimed) = request.claimed_total {
            if (claimed - totals.total).abs() > AMOUNT_TOLERANCE {
                // Soft policy: the computed total is authoritative; the
                // mismatch is logged, not rejected.
                warn!(
                    claimed = %claimed,
                    computed = %totals.total,
                    "caller-supplied total differs from computed total; proceeding with computed"
                );
            }
        }

        let order_id = Uuid::new_v4();
        let order_number = format!("ORD-{}", order_id.to_string()[..8].to_uppercase());
        let temp_ref = Uuid::new_v4().simple().to_string();

        let order = self
            .store
            .create(NewOrder {
                id: order_id,
                order_number: order_number.clone(),
                user_id: request.user_id,
                cart_id: request.cart_id,
                currency: self.policy.currency.clone(),
                subtotal: totals.subtotal,
                tax: totals.tax,
                shipping_cost: totals.shipping_cost,
                discount: totals.discount,
                total_amount: totals.total,
                shipping_address: request.shipping.clone(),
                temp_ref: Some(temp_ref.clone()),
                payment_provider: Some(self.provider_name.clone()),
                items: items
                    .iter()
                    .map(|i| NewOrderLine {
                        product_ref: i.product_ref.clone(),
                        title: i.title.clone(),
                        unit_price: i.unit_price,
                        quantity: i.quantity,
                        image_ref: i.image_ref.clone(),
                        attributes: i.attributes.clone(),
                    })
                    .collect(),
                note: Some("order created at checkout".to_string()),
            })
            .await?;

        info!(order_id = %order_id, order_number = %order_number, total = %totals.total, "pending order persisted");
        self.emit(Event::OrderCreated(order_id)).await;
        self.emit(Event::CheckoutStarted {
            order_id,
            cart_id: request.cart_id,
        })
        .await;

        let intent = self
            .gateway
            .create_intent(CreateIntentRequest {
                reference_id: order_id,
                temp_ref,
                currency: order.currency.clone(),
                amount: AmountBreakdown {
                    item_total: totals.subtotal,
                    shipping: totals.shipping_cost,
                    tax: totals.tax,
                    discount: totals.discount,
                },
                items: items
                    .iter()
                    .map(|i| IntentItem {
                        name: i.title.clone(),
                        sku: i.product_ref.clone(),
                        unit_amount: i.unit_price,
                        quantity: i.quantity,
                    })
                    .collect(),
                shipping: request.shipping.clone(),
                return_url: request.return_url.clone(),
                cancel_url: request.cancel_url.clone(),
            })
            .await;

        let intent = match intent {
            Ok(intent) => intent,
            Err(gateway_err) => {
                error!(order_id = %order_id, error = %gateway_err, "intent creation failed; cancelling order");
                let note = format!("cancelled: payment intent creation failed ({})", gateway_err);
                self.store
                    .compare_and_set_status(
                        order_id,
                        OrderStatus::Pending,
                        OrderStatus::Cancelled,
                        &note,
                    )
                    .await?;
                self.emit(Event::OrderCancelled(order_id)).await;
                return Err(gateway_err.into());
            }
        };

        self.store
            .set_intent(order_id, &intent.intent_id, &intent.approval_url)
            .await?;

        info!(order_id = %order_id, intent_id = %intent.intent_id, "payment intent assigned");
        Ok(CheckoutStarted {
            order_id,
            order_number,
            approval_url: intent.approval_url,
        })
    }

    async fn resolve_items(
        &self,
        request: &StartCheckoutRequest,
    ) -> Result<Vec<CheckoutItem>, ServiceError> {
        match request.cart_id {
            Some(cart_id) => {
                let snapshot = self.carts.snapshot(cart_id).await?;
                Ok(snapshot
                    .items
                    .into_iter()
                    .map(|i| CheckoutItem {
                        product_ref: i.product_ref,
                        title: i.title,
                        unit_price: i.unit_price,
                        quantity: i.quantity,
                        image_ref: i.image_ref,
                        attributes: i.attributes,
                    })
                    .collect())
            }
            None => Ok(request.items.clone()),
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            if let Err(e) = events.send(event).await {
                warn!(error = %e, "failed to send event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn policy() -> CheckoutPolicy {
        CheckoutPolicy::default()
    }

    #[test]
    fn totals_below_free_shipping_threshold() {
        // 2 x 10.00 + 1 x 5.00 = 25.00 subtotal, 9.99 shipping, 7% tax
        let totals = compute_totals(&policy(), dec!(25.00), dec!(0));
        assert_eq!(totals.subtotal, dec!(25.00));
        assert_eq!(totals.shipping_cost, dec!(9.99));
        assert_eq!(totals.tax, dec!(1.75));
        assert_eq!(totals.total, dec!(36.74));
    }

    #[test]
    fn shipping_waived_at_threshold() {
        let totals = compute_totals(&policy(), dec!(100.00), dec!(0));
        assert_eq!(totals.shipping_cost, dec!(0));
        assert_eq!(totals.total, dec!(107.00));
    }

    #[test]
    fn discount_reduces_total() {
        let totals = compute_totals(&policy(), dec!(25.00), dec!(5.00));
        assert_eq!(totals.total, dec!(31.74));
    }

    proptest! {
        #[test]
        fn amount_invariant_holds(cents in 1u64..5_000_000, discount_cents in 0u64..10_000) {
            let subtotal = Decimal::new(cents as i64, 2);
            let discount = Decimal::new(discount_cents as i64, 2);
            let totals = compute_totals(&policy(), subtotal, discount);
            let recomputed = totals.subtotal + totals.tax + totals.shipping_cost - totals.discount;
            prop_assert!((totals.total - recomputed).abs() <= dec!(0.01));
        }
    }
}
