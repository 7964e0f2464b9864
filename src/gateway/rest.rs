use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::config::GatewaySettings;
use crate::gateway::{
    country, CaptureOutcome, CreateIntentRequest, GatewayError, IntentCreated, PaymentGateway,
    ProviderStatus, StatusSnapshot,
};

/// REST adapter for the external payment authority (Orders-v2 style API).
///
/// Stateless: credentials and timeout come from configuration, every call is
/// a bounded network round trip, and no retry is attempted here.
pub struct RestPaymentGateway {
    client: Client,
    settings: GatewaySettings,
}

impl RestPaymentGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        Ok(Self { client, settings })
    }

    fn orders_url(&self, suffix: &str) -> String {
        format!(
            "{}/v2/checkout/orders{}",
            self.settings.base_url.trim_end_matches('/'),
            suffix
        )
    }

    async fn read_body(response: Response) -> Result<(StatusCode, Value), GatewayError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        Ok((status, body))
    }

    /// Maps a non-success HTTP status to the gateway error taxonomy. The
    /// provider reports a duplicate capture as a 422 with an
    /// `ORDER_ALREADY_CAPTURED` issue; that must surface as its own class.
    fn classify_failure(intent_id: &str, status: StatusCode, body: &Value) -> GatewayError {
        if status == StatusCode::UNPROCESSABLE_ENTITY && body_has_issue(body, "ORDER_ALREADY_CAPTURED")
        {
            return GatewayError::AlreadyCaptured(intent_id.to_string());
        }
        if status.is_server_error() {
            return GatewayError::Unreachable(format!("provider returned {}", status));
        }
        GatewayError::Rejected(format!("provider returned {}: {}", status, body))
    }

    fn transport_error(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() || err.is_connect() {
            GatewayError::Unreachable(err.to_string())
        } else {
            GatewayError::Rejected(err.to_string())
        }
    }
}

fn body_has_issue(body: &Value, issue: &str) -> bool {
    body["details"]
        .as_array()
        .map(|details| details.iter().any(|d| d["issue"] == issue))
        .unwrap_or(false)
}

fn money(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

/// Pulls the capture id out of an order resource or capture response.
pub(crate) fn capture_id_from_payload(body: &Value) -> Option<String> {
    body["purchase_units"][0]["payments"]["captures"][0]["id"]
        .as_str()
        .map(|s| s.to_string())
}

#[async_trait::async_trait]
impl PaymentGateway for RestPaymentGateway {
    #[instrument(skip(self, req), fields(reference_id = %req.reference_id))]
    async fn create_intent(&self, req: CreateIntentRequest) -> Result<IntentCreated, GatewayError> {
        let items: Vec<Value> = req
            .items
            .iter()
            .map(|item| {
                json!({
                    "name": item.name,
                    "sku": item.sku,
                    "quantity": item.quantity.to_string(),
                    "unit_amount": {
                        "currency_code": req.currency,
                        "value": money(item.unit_amount),
                    },
                })
            })
            .collect();

        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": req.reference_id.to_string(),
                "custom_id": req.temp_ref,
                "amount": {
                    "currency_code": req.currency,
                    "value": money(req.amount.total()),
                    "breakdown": {
                        "item_total": { "currency_code": req.currency, "value": money(req.amount.item_total) },
                        "shipping": { "currency_code": req.currency, "value": money(req.amount.shipping) },
                        "tax_total": { "currency_code": req.currency, "value": money(req.amount.tax) },
                        "discount": { "currency_code": req.currency, "value": money(req.amount.discount) },
                    },
                },
                "items": items,
                "shipping": {
                    "name": { "full_name": req.shipping.recipient },
                    "address": {
                        "address_line_1": req.shipping.line1,
                        "address_line_2": req.shipping.line2,
                        "admin_area_2": req.shipping.city,
                        "admin_area_1": req.shipping.region,
                        "postal_code": req.shipping.postal_code,
                        "country_code": country::to_alpha2(&req.shipping.country),
                    },
                },
            }],
            "application_context": {
                "return_url": req.return_url,
                "cancel_url": req.cancel_url,
            },
        });

        let response = self
            .client
            .post(self.orders_url(""))
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Self::classify_failure("", status, &body));
        }

        let intent_id = body["id"]
            .as_str()
            .ok_or_else(|| GatewayError::Malformed("missing intent id".to_string()))?
            .to_string();
        let approval_url = body["links"]
            .as_array()
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l["rel"] == "approve")
                    .and_then(|l| l["href"].as_str())
            })
            .ok_or_else(|| GatewayError::Malformed("missing approval link".to_string()))?
            .to_string();

        debug!(intent_id = %intent_id, "payment intent created");
        Ok(IntentCreated {
            intent_id,
            approval_url,
        })
    }

    #[instrument(skip(self))]
    async fn get_status(&self, intent_id: &str) -> Result<StatusSnapshot, GatewayError> {
        let response = self
            .client
            .get(self.orders_url(&format!("/{}", intent_id)))
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Self::classify_failure(intent_id, status, &body));
        }

        let provider_status = body["status"]
            .as_str()
            .map(ProviderStatus::parse)
            .ok_or_else(|| GatewayError::Malformed("missing status".to_string()))?;

        Ok(StatusSnapshot {
            status: provider_status,
            capture_id: capture_id_from_payload(&body),
            raw: body,
        })
    }

    #[instrument(skip(self))]
    async fn capture(&self, intent_id: &str) -> Result<CaptureOutcome, GatewayError> {
        let response = self
            .client
            .post(self.orders_url(&format!("/{}/capture", intent_id)))
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(Self::transport_error)?;

        let (status, body) = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Self::classify_failure(intent_id, status, &body));
        }

        let provider_status = body["status"]
            .as_str()
            .map(ProviderStatus::parse)
            .ok_or_else(|| GatewayError::Malformed("missing status".to_string()))?;
        let capture_id = capture_id_from_payload(&body)
            .ok_or_else(|| GatewayError::Malformed("missing capture id".to_string()))?;

        Ok(CaptureOutcome {
            capture_id,
            status: provider_status,
            raw: body,
        })
    }
}
