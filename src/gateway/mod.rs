//! Thin adapter to the external payment authority.
//!
//! No local state and no local retry: retry/backoff policy belongs to the
//! reconciliation engine, the one layer that understands idempotency.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::order::ShippingAddress;
use crate::errors::ServiceError;

pub mod country;
pub mod rest;

pub use rest::RestPaymentGateway;

/// Provider-side authorization status. Unknown strings are carried opaquely
/// and treated as unexpected by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Created,
    Approved,
    Completed,
    Voided,
    Other(String),
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATED" => ProviderStatus::Created,
            "APPROVED" => ProviderStatus::Approved,
            "COMPLETED" => ProviderStatus::Completed,
            "VOIDED" => ProviderStatus::Voided,
            other => ProviderStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProviderStatus::Created => "CREATED",
            ProviderStatus::Approved => "APPROVED",
            ProviderStatus::Completed => "COMPLETED",
            ProviderStatus::Voided => "VOIDED",
            ProviderStatus::Other(s) => s,
        }
    }
}

/// Amount breakdown sent to the provider. Each component is serialized as a
/// decimal string with two fractional digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountBreakdown {
    pub item_total: Decimal,
    pub shipping: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
}

impl AmountBreakdown {
    pub fn total(&self) -> Decimal {
        self.item_total + self.shipping + self.tax - self.discount
    }
}

/// Line item as presented to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentItem {
    pub name: String,
    pub sku: String,
    pub unit_amount: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    /// Internal order id, passed as the provider's custom reference field so
    /// the provider echoes it back on webhooks
    pub reference_id: Uuid,
    /// Correlation token for degraded-path resolution
    pub temp_ref: String,
    pub currency: String,
    pub amount: AmountBreakdown,
    pub items: Vec<IntentItem>,
    pub shipping: ShippingAddress,
    pub return_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct IntentCreated {
    pub intent_id: String,
    pub approval_url: String,
}

/// Result of querying the provider-side order resource. Providers embed the
/// capture id in the resource once captured, so a status query is enough to
/// finish reconciliation after an "already captured" race.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: ProviderStatus,
    pub capture_id: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub capture_id: String,
    pub status: ProviderStatus,
    pub raw: Value,
}

/// Gateway-level errors. `AlreadyCaptured` is a distinct class because the
/// engine treats it as a success path, not a failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("intent {0} already captured")]
    AlreadyCaptured(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unreachable(msg) => ServiceError::ProviderUnreachable(msg),
            GatewayError::Rejected(msg) | GatewayError::Malformed(msg) => {
                ServiceError::ProviderRejected(msg)
            }
            GatewayError::AlreadyCaptured(id) => ServiceError::AlreadyCaptured(id),
        }
    }
}

/// Adapter contract for the external payment authority. All operations are
/// network calls with bounded timeouts; none holds local state.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, req: CreateIntentRequest) -> Result<IntentCreated, GatewayError>;

    async fn get_status(&self, intent_id: &str) -> Result<StatusSnapshot, GatewayError>;

    /// Captures an approved intent. Not idempotent on the provider side: a
    /// second attempt surfaces `GatewayError::AlreadyCaptured`.
    async fn capture(&self, intent_id: &str) -> Result<CaptureOutcome, GatewayError>;
}
