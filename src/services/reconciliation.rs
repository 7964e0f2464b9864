use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus, ShippingAddress};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{rest, GatewayError, PaymentGateway, ProviderStatus, StatusSnapshot};
use crate::services::carts::CartStore;
use crate::services::notifications::NotificationDispatcher;
use crate::store::{NewOrder, NewOrderLine, OrderStore, PaidFinalization};

/// Which of the three racing input channels produced an invocation. Used for
/// history notes and logs only; all three run the same algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Capture,
    Webhook,
    Return,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventSource::Capture => "capture call",
            EventSource::Webhook => "provider webhook",
            EventSource::Return => "return redirect",
        })
    }
}

/// Client-synchronous capture call, made after the user approves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub provider_order_id: String,
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub temp_ref: Option<String>,
}

/// Browser redirect back from the provider. Must tolerate page reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnRequest {
    pub provider_order_id: String,
    #[serde(default)]
    pub order_id: Option<Uuid>,
}

/// Push notification from the provider. Delivery is at-least-once and may
/// interleave arbitrarily with the other channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub resource: Value,
}

/// Result reported back to the invoking channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub success: bool,
    pub status: String,
    pub order_id: Uuid,
    pub amount: Decimal,
}

struct ReconcileInput {
    source: EventSource,
    provider_order_id: String,
    order_id: Option<Uuid>,
    temp_ref: Option<String>,
    known_status: Option<ProviderStatus>,
    capture_hint: Option<String>,
    payload: Option<Value>,
}

/// The reconciliation state machine.
///
/// Advances an order `pending → approved → processing(paid)` from events on
/// any of the three channels. All coordination happens through the store's
/// conditional updates: whichever invocation wins the `is_paid` compare-and-
/// set performs the terminal transition and the post-paid side effects
/// exactly once; losers observe the order already paid and short-circuit to
/// success. No lock is held across the outbound provider calls.
pub struct ReconciliationEngine {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    carts: Arc<dyn CartStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    events: Option<Arc<EventSender>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        carts: Arc<dyn CartStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        events: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            store,
            gateway,
            carts,
            notifier,
            events,
        }
    }

    /// Event A: the client's synchronous capture call.
    #[instrument(skip(self, request), fields(provider_order_id = %request.provider_order_id))]
    pub async fn capture(
        &self,
        request: CaptureRequest,
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.reconcile(ReconcileInput {
            source: EventSource::Capture,
            provider_order_id: request.provider_order_id,
            order_id: request.order_id,
            temp_ref: request.temp_ref,
            known_status: None,
            capture_hint: None,
            payload: None,
        })
        .await
    }

    /// Event C: the user's browser returning from the provider. Queries live
    /// status and opportunistically finishes reconciliation if neither the
    /// capture call nor the webhook has yet.
    #[instrument(skip(self, request), fields(provider_order_id = %request.provider_order_id))]
    pub async fn handle_return(
        &self,
        request: ReturnRequest,
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.reconcile(ReconcileInput {
            source: EventSource::Return,
            provider_order_id: request.provider_order_id,
            order_id: request.order_id,
            temp_ref: None,
            known_status: None,
            capture_hint: None,
            payload: None,
        })
        .await
    }

    /// Event B: provider webhook. Returns `Ok(None)` for event types this
    /// engine does not act on; those are acknowledged and dropped.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn handle_webhook(
        &self,
        event: WebhookEvent,
    ) -> Result<Option<ReconcileOutcome>, ServiceError> {
        match event.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => {
                // The resource is the capture itself; the owning provider
                // order id rides in the related-ids block.
                let provider_order_id = event.resource["supplementary_data"]["related_ids"]
                    ["order_id"]
                    .as_str()
                    .or_else(|| event.resource["order_id"].as_str())
                    .ok_or_else(|| {
                        ServiceError::ValidationError(
                            "capture webhook missing related order id".to_string(),
                        )
                    })?
                    .to_string();
                let capture_hint = event.resource["id"].as_str().map(str::to_string);
                let temp_ref = event.resource["custom_id"].as_str().map(str::to_string);

                self.reconcile(ReconcileInput {
                    source: EventSource::Webhook,
                    provider_order_id,
                    order_id: None,
                    temp_ref,
                    known_status: Some(ProviderStatus::Completed),
                    capture_hint,
                    payload: Some(event.resource),
                })
                .await
                .map(Some)
            }
            "CHECKOUT.ORDER.APPROVED" | "CHECKOUT.ORDER.COMPLETED" => {
                let provider_order_id = event.resource["id"]
                    .as_str()
                    .ok_or_else(|| {
                        ServiceError::ValidationError(
                            "order webhook missing resource id".to_string(),
                        )
                    })?
                    .to_string();
                let known_status = if event.event_type == "CHECKOUT.ORDER.APPROVED" {
                    ProviderStatus::Approved
                } else {
                    ProviderStatus::Completed
                };
                let unit = &event.resource["purchase_units"][0];
                let order_id = unit["reference_id"]
                    .as_str()
                    .and_then(|s| Uuid::from_str(s).ok());
                let temp_ref = unit["custom_id"].as_str().map(str::to_string);
                let capture_hint = rest::capture_id_from_payload(&event.resource);

                self.reconcile(ReconcileInput {
                    source: EventSource::Webhook,
                    provider_order_id,
                    order_id,
                    temp_ref,
                    known_status: Some(known_status),
                    capture_hint,
                    payload: Some(event.resource),
                })
                .await
                .map(Some)
            }
            other => {
                info!(event_type = %other, "webhook event type not handled by reconciliation");
                Ok(None)
            }
        }
    }

    /// The unified algorithm behind all three entry points.
    async fn reconcile(&self, input: ReconcileInput) -> Result<ReconcileOutcome, ServiceError> {
        // Step 1: resolve the local order, falling back to the provider's
        // echoed correlation token and, last, to synthesis from its payload.
        let mut snapshot: Option<StatusSnapshot> = None;
        let order = self.resolve_order(&input, &mut snapshot).await?;

        // One order, one intent: never let an order absorb a different
        // payment.
        if let Some(existing) = &order.payment_intent_id {
            if existing != &input.provider_order_id {
                return Err(ServiceError::ValidationError(format!(
                    "intent {} does not belong to order {}",
                    input.provider_order_id, order.id
                )));
            }
        }

        // Step 2: idempotency short-circuit. The primary defense against
        // duplicate webhook delivery and racing client retries: no provider
        // call, no history append.
        if order.is_paid && order.capture_id.is_some() {
            debug!(order_id = %order.id, "order already finalized; short-circuiting");
            return Ok(ReconcileOutcome {
                success: true,
                status: ProviderStatus::Completed.as_str().to_string(),
                order_id: order.id,
                amount: order.total_amount,
            });
        }

        // Step 3: provider-side status, unless the event already carried it.
        let (status, capture_hint, raw) = match input.known_status.clone() {
            Some(status) => (
                status,
                input.capture_hint.clone(),
                input.payload.clone().unwrap_or(Value::Null),
            ),
            None => {
                let snap = match snapshot.take() {
                    Some(snap) => snap,
                    None => self
                        .gateway
                        .get_status(&input.provider_order_id)
                        .await
                        .map_err(ServiceError::from)?,
                };
                (snap.status, snap.capture_id, snap.raw)
            }
        };

        match status {
            // Step 5 directly: completion already confirmed.
            ProviderStatus::Completed => {
                self.finalize(&order, capture_hint, raw, input.source).await
            }

            // Step 4: attempt capture, translating the provider's
            // "already captured" into success via a status re-query.
            ProviderStatus::Approved => {
                let advanced = self
                    .store
                    .compare_and_set_status(
                        order.id,
                        OrderStatus::Pending,
                        OrderStatus::Approved,
                        &format!("payment approved (via {})", input.source),
                    )
                    .await?;
                if advanced {
                    self.emit(Event::OrderStatusChanged {
                        order_id: order.id,
                        old_status: OrderStatus::Pending.to_string(),
                        new_status: OrderStatus::Approved.to_string(),
                    })
                    .await;
                }

                match self.gateway.capture(&input.provider_order_id).await {
                    Ok(outcome) => {
                        self.finalize(&order, Some(outcome.capture_id), outcome.raw, input.source)
                            .await
                    }
                    Err(GatewayError::AlreadyCaptured(_)) => {
                        // A concurrent channel captured first. Re-query and,
                        // if completion is confirmed, finish locally as if
                        // our capture had succeeded.
                        info!(
                            order_id = %order.id,
                            "capture raced with another channel; re-querying provider status"
                        );
                        let snap = self
                            .gateway
                            .get_status(&input.provider_order_id)
                            .await
                            .map_err(ServiceError::from)?;
                        if snap.status == ProviderStatus::Completed {
                            self.finalize(&order, snap.capture_id, snap.raw, input.source)
                                .await
                        } else {
                            Err(ServiceError::AlreadyCaptured(
                                input.provider_order_id.clone(),
                            ))
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            }

            // Step 7: nothing actionable. Report, do not mutate; a later
            // event on another channel may still complete reconciliation.
            other => {
                info!(
                    order_id = %order.id,
                    provider_status = %other.as_str(),
                    "provider status not actionable; order left unchanged"
                );
                Ok(ReconcileOutcome {
                    success: false,
                    status: other.as_str().to_string(),
                    order_id: order.id,
                    amount: order.total_amount,
                })
            }
        }
    }

    async fn resolve_order(
        &self,
        input: &ReconcileInput,
        snapshot: &mut Option<StatusSnapshot>,
    ) -> Result<order::Model, ServiceError> {
        if let Some(id) = input.order_id {
            if let Some(order) = self.store.get_by_id(id).await? {
                return Ok(order);
            }
        }
        if let Some(order) = self
            .store
            .get_by_intent_id(&input.provider_order_id)
            .await?
        {
            return Ok(order);
        }
        if let Some(temp_ref) = &input.temp_ref {
            if let Some(order) = self.store.get_by_temp_ref(temp_ref).await? {
                return self.repair_intent(order, input).await;
            }
        }

        // The webhook carries its correlation data inline; the other two
        // channels may need the provider's own record to recover the echoed
        // token.
        let raw = match &input.payload {
            Some(payload) if payload["purchase_units"].is_array() => payload.clone(),
            _ => {
                let snap = self
                    .gateway
                    .get_status(&input.provider_order_id)
                    .await
                    .map_err(ServiceError::from)?;
                let raw = snap.raw.clone();
                *snapshot = Some(snap);
                raw
            }
        };

        let echoed_ref = raw["purchase_units"][0]["custom_id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| input.temp_ref.clone());

        let temp_ref = match echoed_ref {
            Some(temp_ref) => temp_ref,
            None => return Err(ServiceError::OrderNotFound(input.provider_order_id.clone())),
        };

        if let Some(order) = self.store.get_by_temp_ref(&temp_ref).await? {
            return self.repair_intent(order, input).await;
        }

        self.synthesize_order(input, &temp_ref, &raw).await
    }

    /// A temp-ref hit means the intent id never got persisted (the checkout
    /// crashed between intent creation and the write-back). Repair it before
    /// continuing so future events resolve directly.
    async fn repair_intent(
        &self,
        order: order::Model,
        input: &ReconcileInput,
    ) -> Result<order::Model, ServiceError> {
        if order.payment_intent_id.is_none() {
            self.store
                .set_intent(
                    order.id,
                    &input.provider_order_id,
                    order.approval_url.as_deref().unwrap_or(""),
                )
                .await?;
            return self
                .store
                .get_by_id(order.id)
                .await?
                .ok_or_else(|| ServiceError::OrderNotFound(order.id.to_string()));
        }
        Ok(order)
    }

    /// Degraded-but-safe fallback: no local order matches, but the provider
    /// echoes our correlation token, so reconstruct a minimal order from the
    /// provider's own data rather than dropping a payment on the floor.
    async fn synthesize_order(
        &self,
        input: &ReconcileInput,
        temp_ref: &str,
        raw: &Value,
    ) -> Result<order::Model, ServiceError> {
        warn!(
            target: "reconciliation::degraded",
            provider_order_id = %input.provider_order_id,
            temp_ref = %temp_ref,
            "no local order resolved; synthesizing from provider payload"
        );

        let unit = raw["purchase_units"]
            .get(0)
            .ok_or_else(|| ServiceError::OrderNotFound(input.provider_order_id.clone()))?;
        let amount = &unit["amount"];
        let total = amount["value"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| ServiceError::OrderNotFound(input.provider_order_id.clone()))?;
        let currency = amount["currency_code"].as_str().unwrap_or("USD").to_string();

        let breakdown = &amount["breakdown"];
        let part = |key: &str| {
            breakdown[key]["value"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO)
        };
        let (subtotal, shipping_cost, tax, discount) = if breakdown.is_object() {
            (
                part("item_total"),
                part("shipping"),
                part("tax_total"),
                part("discount"),
            )
        } else {
            (total, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        };

        let address = &unit["shipping"]["address"];
        let shipping_address = ShippingAddress {
            recipient: unit["shipping"]["name"]["full_name"]
                .as_str()
                .unwrap_or("")
                .to_string(),
            line1: address["address_line_1"].as_str().unwrap_or("").to_string(),
            line2: address["address_line_2"].as_str().map(str::to_string),
            city: address["admin_area_2"].as_str().unwrap_or("").to_string(),
            region: address["admin_area_1"].as_str().map(str::to_string),
            postal_code: address["postal_code"].as_str().map(str::to_string),
            country: address["country_code"].as_str().unwrap_or("US").to_string(),
        };

        let mut items: Vec<NewOrderLine> = unit["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(NewOrderLine {
                            product_ref: item["sku"].as_str().unwrap_or("unknown").to_string(),
                            title: item["name"].as_str()?.to_string(),
                            unit_price: item["unit_amount"]["value"]
                                .as_str()
                                .and_then(|s| Decimal::from_str(s).ok())?,
                            quantity: item["quantity"]
                                .as_str()
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(1),
                            image_ref: None,
                            attributes: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if items.is_empty() {
            items.push(NewOrderLine {
                product_ref: "unknown".to_string(),
                title: "order line reconstructed from provider data".to_string(),
                unit_price: subtotal,
                quantity: 1,
                image_ref: None,
                attributes: None,
            });
        }

        let order_id = Uuid::new_v4();
        let order = self
            .store
            .create(NewOrder {
                id: order_id,
                order_number: format!("ORD-{}", order_id.to_string()[..8].to_uppercase()),
                user_id: Uuid::nil(),
                cart_id: None,
                currency,
                subtotal,
                tax,
                shipping_cost,
                discount,
                total_amount: total,
                shipping_address,
                temp_ref: Some(temp_ref.to_string()),
                payment_provider: None,
                items,
                note: Some("order synthesized from provider payload (degraded path)".to_string()),
            })
            .await?;

        self.store
            .set_intent(order.id, &input.provider_order_id, "")
            .await?;
        self.store
            .get_by_id(order.id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order.id.to_string()))
    }

    /// Steps 5 and 6: the compare-and-set finalization and the exactly-once
    /// post-paid side effects, performed only by the invocation that wins
    /// the race. Losers still report success, since the order is paid.
    async fn finalize(
        &self,
        order: &order::Model,
        capture_hint: Option<String>,
        raw: Value,
        source: EventSource,
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.check_amount(order, &raw);

        let capture_id = capture_hint.or_else(|| rest::capture_id_from_payload(&raw));
        let won = self
            .store
            .compare_and_set_paid(
                order.id,
                PaidFinalization {
                    capture_id: capture_id.clone(),
                    provider_status: ProviderStatus::Completed.as_str().to_string(),
                    raw_payload: raw,
                    paid_at: Utc::now(),
                    note: format!("payment captured (via {})", source),
                },
            )
            .await?;

        if won {
            info!(
                order_id = %order.id,
                order_number = %order.order_number,
                source = %source,
                "order finalized as paid"
            );
            self.emit(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: order.status.to_string(),
                new_status: OrderStatus::Processing.to_string(),
            })
            .await;

            self.run_paid_side_effects(order).await;
        } else {
            debug!(order_id = %order.id, "finalization lost the race; order already paid");
            // If the winner finalized from a payload without a capture id,
            // fill it in now so later duplicates short-circuit without a
            // provider round trip.
            if let Some(capture_id) = &capture_id {
                let filled = self.store.backfill_capture_id(order.id, capture_id).await?;
                if filled {
                    info!(order_id = %order.id, capture_id = %capture_id, "capture id backfilled on paid order");
                }
            }
        }

        Ok(ReconcileOutcome {
            success: true,
            status: ProviderStatus::Completed.as_str().to_string(),
            order_id: order.id,
            amount: order.total_amount,
        })
    }

    /// Best-effort cart deletion and fire-and-forget notification. The money
    /// has moved: nothing here may fail the payment transition.
    async fn run_paid_side_effects(&self, order: &order::Model) {
        if let Some(cart_id) = order.cart_id {
            match self.carts.delete(cart_id).await {
                Ok(()) => self.emit(Event::CartDeleted(cart_id)).await,
                Err(e) => {
                    warn!(order_id = %order.id, cart_id = %cart_id, error = %e, "cart deletion failed after payment; ignoring")
                }
            }
        }

        match self.store.get_by_id(order.id).await {
            Ok(Some(paid)) => {
                if let Err(e) = self.notifier.order_paid(&paid).await {
                    warn!(order_id = %order.id, error = %e, "paid notification failed; ignoring");
                }
            }
            Ok(None) => warn!(order_id = %order.id, "order vanished before notification"),
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "could not reload order for notification; ignoring")
            }
        }
    }

    /// Compares the provider-reported amount against the local order total.
    /// A mismatch is logged and otherwise non-fatal.
    fn check_amount(&self, order: &order::Model, raw: &Value) {
        let reported = raw["purchase_units"][0]["amount"]["value"]
            .as_str()
            .or_else(|| raw["amount"]["value"].as_str())
            .and_then(|s| Decimal::from_str(s).ok());
        if let Some(reported) = reported {
            if (reported - order.total_amount).abs() > crate::services::checkout::AMOUNT_TOLERANCE {
                warn!(
                    order_id = %order.id,
                    expected = %order.total_amount,
                    reported = %reported,
                    "provider-reported amount differs from order total"
                );
            }
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
