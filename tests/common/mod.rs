//! Hermetic test doubles: an in-memory `OrderStore` with real
//! compare-and-set semantics, a scripted `PaymentGateway` with call
//! counters, and a counting `NotificationDispatcher`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use checkout_core::config::AppConfig;
use checkout_core::entities::order::{self, OrderStatus, ShippingAddress};
use checkout_core::entities::{order_item, order_status_history};
use checkout_core::errors::ServiceError;
use checkout_core::gateway::{
    CaptureOutcome, CreateIntentRequest, GatewayError, IntentCreated, PaymentGateway,
    ProviderStatus, StatusSnapshot,
};
use checkout_core::services::carts::{CartSnapshot, CartStore, SnapshotItem};
use checkout_core::services::checkout::{
    CheckoutItem, CheckoutOrchestrator, CheckoutStarted, StartCheckoutRequest,
};
use checkout_core::services::notifications::{NotificationDispatcher, NotificationError};
use checkout_core::services::reconciliation::ReconciliationEngine;
use checkout_core::store::{NewOrder, OrderPatch, OrderStore, PaidFinalization};

// ---------------------------------------------------------------------------
// In-memory order store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    orders: HashMap<Uuid, order::Model>,
    items: Vec<order_item::Model>,
    history: Vec<order_status_history::Model>,
}

/// In-memory [`OrderStore`] with the same guarded-write semantics as the
/// sea-orm implementation: every conditional update happens atomically under
/// one lock, and no lock is held across awaits.
#[derive(Default)]
pub struct InMemoryOrderStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryOrderStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test helper: rewrites `created_at` so stale-pending sweeps can be
    /// exercised without sleeping.
    pub fn backdate(&self, id: Uuid, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(order) = inner.orders.get_mut(&id) {
            order.created_at = created_at;
        }
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }

    pub fn all_orders(&self) -> Vec<order::Model> {
        self.inner.lock().unwrap().orders.values().cloned().collect()
    }

    fn push_history(inner: &mut StoreInner, order_id: Uuid, status: OrderStatus, note: &str) {
        inner.history.push(order_status_history::Model {
            id: Uuid::new_v4(),
            order_id,
            status,
            note: Some(note.to_string()),
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, new_order: NewOrder) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let shipping = serde_json::to_value(&new_order.shipping_address)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let model = order::Model {
            id: new_order.id,
            order_number: new_order.order_number.clone(),
            user_id: new_order.user_id,
            cart_id: new_order.cart_id,
            status: OrderStatus::Pending,
            currency: new_order.currency.clone(),
            subtotal: new_order.subtotal,
            tax: new_order.tax,
            shipping_cost: new_order.shipping_cost,
            discount: new_order.discount,
            total_amount: new_order.total_amount,
            is_paid: false,
            paid_at: None,
            payment_provider: new_order.payment_provider.clone(),
            payment_intent_id: None,
            payment_status: None,
            capture_id: None,
            captured_at: None,
            provider_payload: None,
            temp_ref: new_order.temp_ref.clone(),
            approval_url: None,
            shipping_address: shipping,
            tracking_number: None,
            notes: None,
            created_at: now,
            updated_at: Some(now),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.orders.insert(model.id, model.clone());
        for line in &new_order.items {
            inner.items.push(order_item::Model {
                id: Uuid::new_v4(),
                order_id: model.id,
                product_ref: line.product_ref.clone(),
                title: line.title.clone(),
                unit_price: line.unit_price,
                quantity: line.quantity,
                image_ref: line.image_ref.clone(),
                attributes: line.attributes.clone(),
                created_at: now,
            });
        }
        let note = new_order.note.as_deref().unwrap_or("order created");
        Self::push_history(&mut inner, model.id, OrderStatus::Pending, note);
        Ok(model)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(self.inner.lock().unwrap().orders.get(&id).cloned())
    }

    async fn get_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .orders
            .values()
            .find(|o| o.payment_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }

    async fn get_by_temp_ref(
        &self,
        temp_ref: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .orders
            .values()
            .find(|o| o.temp_ref.as_deref() == Some(temp_ref))
            .cloned())
    }

    async fn items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|h| h.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn set_intent(
        &self,
        id: Uuid,
        intent_id: &str,
        approval_url: &str,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;
        match &order.payment_intent_id {
            None => {
                order.payment_intent_id = Some(intent_id.to_string());
                order.approval_url = Some(approval_url.to_string());
                order.payment_status = Some("CREATED".to_string());
                order.updated_at = Some(Utc::now());
                Ok(())
            }
            Some(existing) if existing == intent_id => Ok(()),
            Some(_) => Err(ServiceError::ConcurrentUpdateLost(id)),
        }
    }

    async fn compare_and_set_paid(
        &self,
        id: Uuid,
        finalization: PaidFinalization,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;
        if order.is_paid {
            return Ok(false);
        }
        order.is_paid = true;
        order.paid_at = Some(finalization.paid_at);
        order.status = OrderStatus::Processing;
        order.payment_status = Some(finalization.provider_status.clone());
        order.capture_id = finalization.capture_id.clone();
        order.captured_at = Some(finalization.paid_at);
        order.provider_payload = Some(finalization.raw_payload.clone());
        order.updated_at = Some(Utc::now());
        Self::push_history(&mut inner, id, OrderStatus::Processing, &finalization.note);
        Ok(true)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: &str,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;
        if order.status != from {
            return Ok(false);
        }
        order.status = to;
        order.updated_at = Some(Utc::now());
        Self::push_history(&mut inner, id, to, note);
        Ok(true)
    }

    async fn backfill_capture_id(
        &self,
        id: Uuid,
        capture_id: &str,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;
        if !order.is_paid || order.capture_id.is_some() {
            return Ok(false);
        }
        order.capture_id = Some(capture_id.to_string());
        order.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn append_history(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        note: &str,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        Self::push_history(&mut inner, order_id, status, note);
        Ok(())
    }

    async fn update_fields(
        &self,
        id: Uuid,
        patch: OrderPatch,
    ) -> Result<order::Model, ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;
        if let Some(tracking) = patch.tracking_number {
            order.tracking_number = Some(tracking);
        }
        if let Some(notes) = patch.notes {
            order.notes = Some(notes);
        }
        order.updated_at = Some(Utc::now());
        Ok(order.clone())
    }

    async fn expire_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let stale: Vec<Uuid> = {
            let inner = self.inner.lock().unwrap();
            inner
                .orders
                .values()
                .filter(|o| o.status == OrderStatus::Pending && o.created_at < older_than)
                .map(|o| o.id)
                .collect()
        };
        let mut expired = 0u64;
        for id in stale {
            if self
                .compare_and_set_status(
                    id,
                    OrderStatus::Pending,
                    OrderStatus::Cancelled,
                    "expired by stale-pending sweep",
                )
                .await?
            {
                expired += 1;
            }
        }
        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// Scripted payment gateway
// ---------------------------------------------------------------------------

pub struct GatewayScript {
    /// Status the provider reports before capture
    pub status: ProviderStatus,
    /// Capture id the provider issues
    pub capture_id: String,
    /// Whether the intent has been captured provider-side
    pub captured: bool,
    /// While set, status queries hide the captured state (stale read); the
    /// first capture attempt clears it and fails with AlreadyCaptured
    pub stale_status_reads: bool,
    /// Fail create_intent with a rejection
    pub fail_create: bool,
    /// Fail capture with a timeout-style unreachable error
    pub fail_capture_unreachable: bool,
    /// Raw order resource returned on status queries and captures
    pub raw: Value,
}

impl Default for GatewayScript {
    fn default() -> Self {
        Self {
            status: ProviderStatus::Approved,
            capture_id: "CAP-1".to_string(),
            captured: false,
            stale_status_reads: false,
            fail_create: false,
            fail_capture_unreachable: false,
            raw: json!({ "id": "PAY-1", "purchase_units": [{}] }),
        }
    }
}

/// Scripted [`PaymentGateway`] with call counters. The `captured` flag flips
/// under the lock, so exactly one concurrent capture attempt can succeed,
/// matching the real provider's guarantee.
pub struct ScriptedGateway {
    pub script: Mutex<GatewayScript>,
    pub create_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub capture_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(script: GatewayScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            create_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            capture_calls: AtomicUsize::new(0),
        })
    }

    pub fn approved() -> Arc<Self> {
        Self::new(GatewayScript::default())
    }

    pub fn captures_made(&self) -> usize {
        self.capture_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_intent(
        &self,
        _req: CreateIntentRequest,
    ) -> Result<IntentCreated, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        if script.fail_create {
            return Err(GatewayError::Rejected("intent rejected".to_string()));
        }
        Ok(IntentCreated {
            intent_id: "PAY-1".to_string(),
            approval_url: "https://provider.example/approve/PAY-1".to_string(),
        })
    }

    async fn get_status(&self, _intent_id: &str) -> Result<StatusSnapshot, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        if script.captured && !script.stale_status_reads {
            Ok(StatusSnapshot {
                status: ProviderStatus::Completed,
                capture_id: Some(script.capture_id.clone()),
                raw: script.raw.clone(),
            })
        } else {
            Ok(StatusSnapshot {
                status: script.status.clone(),
                capture_id: None,
                raw: script.raw.clone(),
            })
        }
    }

    async fn capture(&self, intent_id: &str) -> Result<CaptureOutcome, GatewayError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.fail_capture_unreachable {
            return Err(GatewayError::Unreachable("timed out".to_string()));
        }
        if script.captured {
            script.stale_status_reads = false;
            return Err(GatewayError::AlreadyCaptured(intent_id.to_string()));
        }
        match script.status {
            ProviderStatus::Approved => {
                script.captured = true;
                Ok(CaptureOutcome {
                    capture_id: script.capture_id.clone(),
                    status: ProviderStatus::Completed,
                    raw: script.raw.clone(),
                })
            }
            _ => Err(GatewayError::Rejected(format!(
                "intent {} not approved",
                intent_id
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory cart store and counting notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCartStore {
    carts: Mutex<HashMap<Uuid, Vec<SnapshotItem>>>,
    pub delete_calls: AtomicUsize,
}

impl InMemoryCartStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, cart_id: Uuid, items: Vec<SnapshotItem>) {
        self.carts.lock().unwrap().insert(cart_id, items);
    }

    pub fn contains(&self, cart_id: Uuid) -> bool {
        self.carts.lock().unwrap().contains_key(&cart_id)
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn snapshot(&self, cart_id: Uuid) -> Result<CartSnapshot, ServiceError> {
        let carts = self.carts.lock().unwrap();
        let items = carts
            .get(&cart_id)
            .cloned()
            .ok_or_else(|| ServiceError::ValidationError(format!("Cart {} not found", cart_id)))?;
        Ok(CartSnapshot {
            cart_id,
            user_id: None,
            currency: "USD".to_string(),
            items,
        })
    }

    async fn delete(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.carts.lock().unwrap().remove(&cart_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingNotifier {
    pub paid_notifications: AtomicUsize,
}

impl CountingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.paid_notifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationDispatcher for CountingNotifier {
    async fn order_paid(&self, _order: &order::Model) -> Result<(), NotificationError> {
        self.paid_notifications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Everything wired together the way the embedding service would do it.
pub struct TestHarness {
    pub store: Arc<InMemoryOrderStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub carts: Arc<InMemoryCartStore>,
    pub notifier: Arc<CountingNotifier>,
    pub orchestrator: CheckoutOrchestrator,
    pub engine: Arc<ReconciliationEngine>,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

impl TestHarness {
    pub fn new(script: GatewayScript) -> Self {
        init_tracing();
        let store = InMemoryOrderStore::new();
        let gateway = ScriptedGateway::new(script);
        let carts = InMemoryCartStore::new();
        let notifier = CountingNotifier::new();
        let config = AppConfig::default();

        let orchestrator = CheckoutOrchestrator::new(
            store.clone(),
            gateway.clone(),
            carts.clone(),
            None,
            &config,
        );
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            gateway.clone(),
            carts.clone(),
            notifier.clone(),
            None,
        ));

        Self {
            store,
            gateway,
            carts,
            notifier,
            orchestrator,
            engine,
        }
    }

    pub fn approved() -> Self {
        Self::new(GatewayScript::default())
    }

    /// Runs a checkout for 2 x 10.00 + 1 x 5.00 (36.74 total with tax and
    /// shipping), leaving a pending order with intent `PAY-1`.
    pub async fn start_basic_checkout(&self) -> CheckoutStarted {
        self.orchestrator
            .start_checkout(basic_request(Uuid::new_v4(), None))
            .await
            .expect("checkout should start")
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        recipient: "Ada Lovelace".to_string(),
        line1: "1 Analytical Way".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        region: Some("IL".to_string()),
        postal_code: Some("62701".to_string()),
        country: "United States".to_string(),
    }
}

pub fn basic_items() -> Vec<CheckoutItem> {
    use rust_decimal_macros::dec;
    vec![
        CheckoutItem {
            product_ref: "SKU-WIDGET".to_string(),
            title: "Widget".to_string(),
            unit_price: dec!(10.00),
            quantity: 2,
            image_ref: None,
            attributes: None,
        },
        CheckoutItem {
            product_ref: "SKU-GADGET".to_string(),
            title: "Gadget".to_string(),
            unit_price: dec!(5.00),
            quantity: 1,
            image_ref: None,
            attributes: None,
        },
    ]
}

pub fn basic_request(user_id: Uuid, cart_id: Option<Uuid>) -> StartCheckoutRequest {
    StartCheckoutRequest {
        user_id,
        cart_id,
        items: if cart_id.is_some() {
            Vec::new()
        } else {
            basic_items()
        },
        shipping: shipping_address(),
        return_url: "https://shop.example/checkout/return".to_string(),
        cancel_url: "https://shop.example/checkout/cancel".to_string(),
        discount: rust_decimal::Decimal::ZERO,
        claimed_total: None,
    }
}
