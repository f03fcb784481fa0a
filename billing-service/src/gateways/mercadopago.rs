use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::billing::{Gateway, PaymentOutcome};
use shared::signature::{constant_time_eq, hmac_sha256_hex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ensure_success, CheckoutRequest, GatewayCheckout, PaymentGateway, PaymentNotification, SubscriptionLocator, REQUEST_TIMEOUT};

pub const DEFAULT_BASE_URL: &str = "https://api.mercadopago.com";

pub struct MercadoPagoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    back_url: String,
}

/// JSON body of a notification. `data.id` arrives as a string or a number.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub action: Option<String>,
    pub data: Option<WebhookData>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub id: Value,
}

/// Query-string form used by IPN-style notifications.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub topic: Option<String>,
    #[serde(rename = "data.id")]
    pub data_id: Option<String>,
    pub id: Option<String>,
}

impl WebhookPayload {
    /// Merges body and query string; the body wins when both are present.
    pub fn target(&self, query: &WebhookQuery) -> Option<(String, String)> {
        let kind = self
            .kind
            .clone()
            .or_else(|| query.kind.clone())
            .or_else(|| query.topic.clone())?;
        let id = self
            .data
            .as_ref()
            .and_then(|data| match &data.id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .or_else(|| query.data_id.clone())
            .or_else(|| query.id.clone())?;
        Some((kind, id))
    }
}

#[derive(Debug, Deserialize)]
pub struct MpPayment {
    pub id: i64,
    pub status: String,
    pub status_detail: Option<String>,
    pub transaction_amount: f64,
    pub date_approved: Option<DateTime<Utc>>,
    pub external_reference: Option<String>,
    pub metadata: Option<Value>,
    pub point_of_interaction: Option<Value>,
}

impl MpPayment {
    pub fn preapproval_id(&self) -> Option<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("preapproval_id"))
            .or_else(|| {
                self.point_of_interaction
                    .as_ref()
                    .and_then(|p| p.get("transaction_data"))
                    .and_then(|t| t.get("subscription_id"))
            })
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
pub struct MpAuthorizedPayment {
    pub id: i64,
    pub preapproval_id: String,
    pub transaction_amount: f64,
    pub status: String,
    pub reason: Option<String>,
    pub payment: Option<MpAuthorizedPaymentDetail>,
}

#[derive(Debug, Deserialize)]
pub struct MpAuthorizedPaymentDetail {
    pub id: i64,
    pub status: String,
    pub status_detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MpPreapproval {
    pub id: String,
    pub status: String,
    pub external_reference: Option<String>,
    pub init_point: Option<String>,
}

/// Checks `x-signature: ts=<ts>,v1=<hex>` against the manifest
/// `id:<data.id>;request-id:<x-request-id>;ts:<ts>;`.
pub fn verify_signature(x_signature: &str, request_id: &str, data_id: &str, secret: &str) -> bool {
    let mut ts = "";
    let mut v1 = "";
    for part in x_signature.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("ts"), Some(val)) => ts = val,
            (Some("v1"), Some(val)) => v1 = val,
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return false;
    }

    let manifest = format!("id:{};request-id:{};ts:{};", data_id.to_lowercase(), request_id, ts);
    let expected = hmac_sha256_hex(secret, &manifest);
    constant_time_eq(&expected, v1)
}

/// Maps a charge status onto the state machine; pending and uncaptured
/// (`authorized`) charges map to nothing.
pub fn payment_outcome(status: &str, status_detail: Option<&str>, amount: f64, paid_at: DateTime<Utc>) -> Option<PaymentOutcome> {
    match status {
        "approved" => Some(PaymentOutcome::Succeeded { amount, paid_at }),
        "rejected" | "cancelled" => Some(PaymentOutcome::Failed {
            reason: status_detail.unwrap_or(status).to_string(),
        }),
        _ => None,
    }
}

impl MercadoPagoClient {
    pub fn new(base_url: &str, access_token: &str, back_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            back_url: back_url.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(ensure_success("Mercado Pago", response).await?.json().await?)
    }

    /// Fetches the resource a notification points at. `None` means the
    /// notification carries nothing the subscription cares about.
    pub async fn resolve(&self, kind: &str, id: &str) -> Result<Option<PaymentNotification>> {
        match kind {
            "payment" => {
                let payment: MpPayment = self.get(&format!("/v1/payments/{}", id)).await?;
                debug!("Mercado Pago payment {} is {}", payment.id, payment.status);

                let paid_at = payment.date_approved.unwrap_or_else(Utc::now);
                let Some(outcome) = payment_outcome(
                    &payment.status,
                    payment.status_detail.as_deref(),
                    payment.transaction_amount,
                    paid_at,
                ) else {
                    return Ok(None);
                };

                let locator = SubscriptionLocator {
                    external_id: payment.preapproval_id(),
                    establishment_id: payment
                        .external_reference
                        .as_deref()
                        .and_then(|r| Uuid::parse_str(r).ok()),
                };
                Ok(Some(PaymentNotification {
                    gateway: Gateway::MercadoPago,
                    event_key: format!("payment:{}:{}", payment.id, payment.status),
                    locator,
                    external_payment_id: Some(payment.id.to_string()),
                    outcome,
                }))
            }
            "subscription_authorized_payment" => {
                let authorized: MpAuthorizedPayment = self.get(&format!("/authorized_payments/{}", id)).await?;
                let Some(detail) = authorized.payment.as_ref() else {
                    debug!("Authorized payment {} has no charge yet", authorized.id);
                    return Ok(None);
                };

                let Some(outcome) = payment_outcome(
                    &detail.status,
                    detail.status_detail.as_deref().or(authorized.reason.as_deref()),
                    authorized.transaction_amount,
                    Utc::now(),
                ) else {
                    return Ok(None);
                };

                Ok(Some(PaymentNotification {
                    gateway: Gateway::MercadoPago,
                    event_key: format!("payment:{}:{}", detail.id, detail.status),
                    locator: SubscriptionLocator {
                        external_id: Some(authorized.preapproval_id.clone()),
                        establishment_id: None,
                    },
                    external_payment_id: Some(detail.id.to_string()),
                    outcome,
                }))
            }
            "subscription_preapproval" | "preapproval" => {
                let preapproval: MpPreapproval = self.get(&format!("/preapproval/{}", id)).await?;
                if preapproval.status != "cancelled" {
                    info!("Preapproval {} is {}, nothing to apply", preapproval.id, preapproval.status);
                    return Ok(None);
                }
                Ok(Some(PaymentNotification {
                    gateway: Gateway::MercadoPago,
                    event_key: format!("preapproval:{}:cancelled", preapproval.id),
                    locator: SubscriptionLocator {
                        external_id: Some(preapproval.id.clone()),
                        establishment_id: preapproval
                            .external_reference
                            .as_deref()
                            .and_then(|r| Uuid::parse_str(r).ok()),
                    },
                    external_payment_id: None,
                    outcome: PaymentOutcome::Cancelled,
                }))
            }
            other => {
                debug!("Ignoring Mercado Pago notification type {}", other);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    fn gateway(&self) -> Gateway {
        Gateway::MercadoPago
    }

    async fn create_subscription(&self, request: &CheckoutRequest) -> Result<GatewayCheckout> {
        let body = json!({
            "reason": format!("{} - {}", request.plan_name, request.establishment_name),
            "external_reference": request.establishment_id.to_string(),
            "payer_email": request.payer_email,
            "back_url": self.back_url,
            "auto_recurring": {
                "frequency": 1,
                "frequency_type": "months",
                "transaction_amount": request.price,
                "currency_id": "BRL",
            },
            "status": "pending",
        });

        let response = self
            .http
            .post(format!("{}/preapproval", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        let preapproval: MpPreapproval = ensure_success("Mercado Pago", response).await?.json().await?;

        info!("Created Mercado Pago preapproval {} for {}", preapproval.id, request.establishment_id);
        Ok(GatewayCheckout {
            external_id: preapproval.id,
            customer_id: None,
            checkout_url: preapproval.init_point,
        })
    }

    async fn cancel_subscription(&self, external_id: &str) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/preapproval/{}", self.base_url, external_id))
            .bearer_auth(&self.access_token)
            .json(&json!({ "status": "cancelled" }))
            .send()
            .await?;
        ensure_success("Mercado Pago", response).await?;
        info!("Cancelled Mercado Pago preapproval {}", external_id);
        Ok(())
    }
}
