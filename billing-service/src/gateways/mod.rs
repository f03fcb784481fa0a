pub mod iugu;
pub mod mercadopago;

use anyhow::Result;
use async_trait::async_trait;
use shared::billing::{Gateway, PaymentOutcome};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use iugu::IuguClient;
pub use mercadopago::MercadoPagoClient;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub establishment_id: Uuid,
    pub establishment_name: String,
    pub payer_email: String,
    pub plan_name: String,
    pub price: f64,
    pub iugu_plan_identifier: Option<String>,
    pub existing_customer_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayCheckout {
    pub external_id: String,
    pub customer_id: Option<String>,
    pub checkout_url: Option<String>,
}

/// Recurring-billing operations both gateways support.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn gateway(&self) -> Gateway;

    async fn create_subscription(&self, request: &CheckoutRequest) -> Result<GatewayCheckout>;

    async fn cancel_subscription(&self, external_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Gateways {
    mercadopago: Arc<dyn PaymentGateway>,
    iugu: Arc<dyn PaymentGateway>,
}

impl Gateways {
    pub fn new(mercadopago: Arc<dyn PaymentGateway>, iugu: Arc<dyn PaymentGateway>) -> Self {
        Self { mercadopago, iugu }
    }

    pub fn get(&self, gateway: Gateway) -> &dyn PaymentGateway {
        match gateway {
            Gateway::MercadoPago => self.mercadopago.as_ref(),
            Gateway::Iugu => self.iugu.as_ref(),
        }
    }
}

/// How to find the subscription a notification refers to. The external id
/// wins; the establishment id covers payments whose recurring id is unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionLocator {
    pub external_id: Option<String>,
    pub establishment_id: Option<Uuid>,
}

/// A webhook resolved against the gateway API into something the
/// subscription state machine understands.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentNotification {
    pub gateway: Gateway,
    /// Replays of the same gateway state share this key.
    pub event_key: String,
    pub locator: SubscriptionLocator,
    pub external_payment_id: Option<String>,
    pub outcome: PaymentOutcome,
}

pub(crate) async fn ensure_success(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("{} returned HTTP {}: {}", provider, status.as_u16(), body))
}
