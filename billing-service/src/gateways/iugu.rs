use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use shared::billing::{Gateway, PaymentOutcome};
use shared::signature::constant_time_eq;
use tracing::{debug, info};

use super::{ensure_success, CheckoutRequest, GatewayCheckout, PaymentGateway, PaymentNotification, SubscriptionLocator, REQUEST_TIMEOUT};

pub const DEFAULT_BASE_URL: &str = "https://api.iugu.com/v1";

pub struct IuguClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

/// Iugu posts notifications form-encoded with bracketed `data[...]` keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookForm {
    pub event: String,
    #[serde(rename = "data[id]")]
    pub id: Option<String>,
    #[serde(rename = "data[status]")]
    pub status: Option<String>,
    #[serde(rename = "data[subscription_id]")]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IuguEvent {
    InvoicePaid { invoice_id: String, subscription_id: String },
    InvoiceFailed { invoice_id: String, subscription_id: String, status: String },
    SubscriptionSuspended { subscription_id: String },
    SubscriptionExpired { subscription_id: String },
    Ignored,
}

#[derive(Debug, Deserialize)]
pub struct IuguInvoice {
    pub id: String,
    pub status: String,
    pub total_cents: i64,
    pub paid_at: Option<String>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IuguCustomer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IuguSubscription {
    id: String,
    recent_invoices: Option<Vec<IuguRecentInvoice>>,
}

#[derive(Debug, Deserialize)]
struct IuguRecentInvoice {
    secure_url: Option<String>,
}

/// Iugu sends the token configured for the trigger in `Authorization`.
pub fn verify_token(header: Option<&str>, expected: &str) -> bool {
    match header {
        Some(value) => constant_time_eq(value.trim(), expected),
        None => false,
    }
}

impl WebhookForm {
    pub fn classify(&self) -> IuguEvent {
        let Some(id) = self.id.clone() else {
            return IuguEvent::Ignored;
        };
        let subscription_id = self.subscription_id.clone();

        match self.event.as_str() {
            "invoice.status_changed" => {
                let Some(subscription_id) = subscription_id else {
                    return IuguEvent::Ignored;
                };
                match self.status.as_deref() {
                    Some("paid") => IuguEvent::InvoicePaid { invoice_id: id, subscription_id },
                    _ => IuguEvent::Ignored,
                }
            }
            "invoice.payment_failed" => match subscription_id {
                Some(subscription_id) => IuguEvent::InvoiceFailed {
                    invoice_id: id,
                    subscription_id,
                    status: self.status.clone().unwrap_or_else(|| "payment_failed".to_string()),
                },
                None => IuguEvent::Ignored,
            },
            // Subscription events carry the subscription itself in data[id].
            "subscription.suspended" => IuguEvent::SubscriptionSuspended {
                subscription_id: subscription_id.unwrap_or(id),
            },
            "subscription.expired" => IuguEvent::SubscriptionExpired {
                subscription_id: subscription_id.unwrap_or(id),
            },
            _ => IuguEvent::Ignored,
        }
    }
}

fn parse_paid_at(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn locator(subscription_id: &str) -> SubscriptionLocator {
    SubscriptionLocator {
        external_id: Some(subscription_id.to_string()),
        establishment_id: None,
    }
}

impl IuguClient {
    pub fn new(base_url: &str, api_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_token, Some(""))
    }

    pub async fn fetch_invoice(&self, invoice_id: &str) -> Result<IuguInvoice> {
        let response = self.request(reqwest::Method::GET, &format!("/invoices/{}", invoice_id)).send().await?;
        Ok(ensure_success("Iugu", response).await?.json().await?)
    }

    pub async fn resolve(&self, form: &WebhookForm) -> Result<Option<PaymentNotification>> {
        let notification = match form.classify() {
            IuguEvent::InvoicePaid { invoice_id, subscription_id } => {
                let invoice = self.fetch_invoice(&invoice_id).await?;
                if invoice.status != "paid" {
                    debug!("Invoice {} reported paid but is {}", invoice.id, invoice.status);
                    return Ok(None);
                }
                PaymentNotification {
                    gateway: Gateway::Iugu,
                    event_key: format!("invoice:{}:paid", invoice.id),
                    locator: locator(invoice.subscription_id.as_deref().unwrap_or(&subscription_id)),
                    external_payment_id: Some(invoice.id.clone()),
                    outcome: PaymentOutcome::Succeeded {
                        amount: invoice.total_cents as f64 / 100.0,
                        paid_at: parse_paid_at(invoice.paid_at.as_deref()),
                    },
                }
            }
            IuguEvent::InvoiceFailed { invoice_id, subscription_id, status } => PaymentNotification {
                gateway: Gateway::Iugu,
                event_key: format!("invoice:{}:failed", invoice_id),
                locator: locator(&subscription_id),
                external_payment_id: Some(invoice_id),
                outcome: PaymentOutcome::Failed { reason: status },
            },
            IuguEvent::SubscriptionSuspended { subscription_id } => PaymentNotification {
                gateway: Gateway::Iugu,
                event_key: format!("subscription:{}:suspended", subscription_id),
                locator: locator(&subscription_id),
                external_payment_id: None,
                outcome: PaymentOutcome::Suspended,
            },
            IuguEvent::SubscriptionExpired { subscription_id } => PaymentNotification {
                gateway: Gateway::Iugu,
                event_key: format!("subscription:{}:expired", subscription_id),
                locator: locator(&subscription_id),
                external_payment_id: None,
                outcome: PaymentOutcome::Cancelled,
            },
            IuguEvent::Ignored => {
                debug!("Ignoring Iugu event {}", form.event);
                return Ok(None);
            }
        };
        Ok(Some(notification))
    }
}

#[async_trait]
impl PaymentGateway for IuguClient {
    fn gateway(&self) -> Gateway {
        Gateway::Iugu
    }

    async fn create_subscription(&self, request: &CheckoutRequest) -> Result<GatewayCheckout> {
        let plan_identifier = request
            .iugu_plan_identifier
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Plan has no Iugu identifier"))?;

        let customer_id = match &request.existing_customer_id {
            Some(id) => id.clone(),
            None => {
                let response = self
                    .request(reqwest::Method::POST, "/customers")
                    .json(&json!({
                        "email": request.payer_email,
                        "name": request.establishment_name,
                        "custom_variables": [
                            { "name": "establishment_id", "value": request.establishment_id.to_string() }
                        ],
                    }))
                    .send()
                    .await?;
                let customer: IuguCustomer = ensure_success("Iugu", response).await?.json().await?;
                customer.id
            }
        };

        let response = self
            .request(reqwest::Method::POST, "/subscriptions")
            .json(&json!({
                "plan_identifier": plan_identifier,
                "customer_id": customer_id,
                "payable_with": "all",
            }))
            .send()
            .await?;
        let subscription: IuguSubscription = ensure_success("Iugu", response).await?.json().await?;

        info!("Created Iugu subscription {} for {}", subscription.id, request.establishment_id);
        let checkout_url = subscription
            .recent_invoices
            .unwrap_or_default()
            .into_iter()
            .find_map(|invoice| invoice.secure_url);

        Ok(GatewayCheckout {
            external_id: subscription.id,
            customer_id: Some(customer_id),
            checkout_url,
        })
    }

    async fn cancel_subscription(&self, external_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/subscriptions/{}/suspend", external_id))
            .send()
            .await?;
        ensure_success("Iugu", response).await?;
        info!("Suspended Iugu subscription {}", external_id);
        Ok(())
    }
}
