//! Order/payment reconciliation core.
//!
//! Takes a shopping cart through external payment authorization to a durable,
//! consistent order record. Payment truth lives with an external provider and
//! arrives over three independent, racing channels: the client's synchronous
//! capture call, the provider's webhook (at-least-once delivery), and the
//! user's browser returning from the provider. Any of them may arrive first,
//! more than once, or never. The engine guarantees each order is marked paid
//! exactly once, with no double-capture and no duplicate side effects.
//!
//! All coordination is pushed into the store's atomic conditional update
//! ([`store::OrderStore::compare_and_set_paid`]); the engine holds no
//! in-process locks across network calls and scales horizontally across
//! server instances with no distributed lock.
//!
//! Component wiring is explicit dependency injection: construct a
//! [`services::reconciliation::ReconciliationEngine`] from an `OrderStore`,
//! a `PaymentGateway`, a `CartStore` and a `NotificationDispatcher`.

pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod services;
pub mod store;

pub use config::AppConfig;
pub use errors::ServiceError;
