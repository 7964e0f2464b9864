use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;

const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

/// Checkout pricing policy. The computed total is authoritative; a
/// caller-supplied total is only compared against it (see
/// `CheckoutOrchestrator`).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckoutPolicy {
    /// ISO 4217 currency for new orders
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Fixed tax rate applied to the item subtotal (0.07 = 7%)
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,

    /// Flat shipping fee charged below the free-shipping threshold
    #[serde(default = "default_shipping_fee")]
    pub shipping_fee: Decimal,

    /// Subtotal at or above which the shipping fee is waived
    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: Decimal,
}

impl Default for CheckoutPolicy {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            tax_rate: default_tax_rate(),
            shipping_fee: default_shipping_fee(),
            free_shipping_threshold: default_free_shipping_threshold(),
        }
    }
}

/// Connection settings for the external payment authority.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    /// Provider API base URL
    pub base_url: String,

    /// API credentials
    pub client_id: String,
    pub client_secret: String,

    /// Provider name recorded on each order's payment details
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    /// Bounded per-request timeout; a timed-out call is surfaced as
    /// `ProviderUnreachable` and never blocks order state
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.sandbox.payment.example".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            provider_name: default_provider_name(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Application configuration, layered defaults < config file < environment.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub checkout: CheckoutPolicy,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl AppConfig {
    /// Loads configuration from `config/{APP_ENV}.toml` (optional) and
    /// `CHECKOUT__`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let run_env = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        Config::builder()
            .set_default("checkout.currency", default_currency())?
            .set_default("checkout.tax_rate", default_tax_rate().to_string())?
            .set_default("checkout.shipping_fee", default_shipping_fee().to_string())?
            .set_default(
                "checkout.free_shipping_threshold",
                default_free_shipping_threshold().to_string(),
            )?
            .set_default("gateway.base_url", GatewaySettings::default().base_url)?
            .set_default("gateway.client_id", "")?
            .set_default("gateway.client_secret", "")?
            .set_default("gateway.provider_name", default_provider_name())?
            .set_default(
                "gateway.timeout_secs",
                default_gateway_timeout_secs() as i64,
            )?
            .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
            .add_source(Environment::with_prefix("CHECKOUT").separator("__"))
            .build()?
            .try_deserialize()
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_tax_rate() -> Decimal {
    dec!(0.07)
}

fn default_shipping_fee() -> Decimal {
    dec!(9.99)
}

fn default_free_shipping_threshold() -> Decimal {
    dec!(100.00)
}

fn default_provider_name() -> String {
    "paypal".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults() {
        let policy = CheckoutPolicy::default();
        assert_eq!(policy.currency, "USD");
        assert_eq!(policy.tax_rate, dec!(0.07));
        assert_eq!(policy.shipping_fee, dec!(9.99));
        assert_eq!(policy.free_shipping_threshold, dec!(100.00));
    }

    #[test]
    fn gateway_defaults() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.provider_name, "paypal");
        assert_eq!(settings.timeout_secs, 10);
    }
}
