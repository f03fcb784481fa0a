use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde_json::json;
use shared::db::DbPool;
use shared::models::{NewWhatsappLog, WhatsappConfig};
use shared::phone::normalize_whatsapp;
use shared::schema::{whatsapp_config, whatsapp_logs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends a text message through a tenant's WhatsApp instance.
#[async_trait]
pub trait WhatsappSender: Send + Sync {
    async fn send_text(&self, config: &WhatsappConfig, number: &str, text: &str) -> Result<()>;
}

/// Evolution-style HTTP API: `POST {api_url}/message/sendText/{instance}`.
pub struct EvolutionClient {
    http: reqwest::Client,
}

impl EvolutionClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http })
    }

    fn build(&self, config: &WhatsappConfig, number: &str, text: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/message/sendText/{}", config.api_url.trim_end_matches('/'), config.instance);
        self.http
            .post(url)
            .header("apikey", &config.api_token)
            .json(&json!({ "number": number, "text": text }))
    }
}

#[async_trait]
impl WhatsappSender for EvolutionClient {
    async fn send_text(&self, config: &WhatsappConfig, number: &str, text: &str) -> Result<()> {
        let response = self.build(config, number, text).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("WhatsApp API returned HTTP {}: {}", status.as_u16(), body));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed,
    /// The tenant has no enabled WhatsApp instance.
    Skipped,
}

impl Delivery {
    fn as_str(&self) -> &'static str {
        match self {
            Delivery::Sent => "sent",
            Delivery::Failed => "failed",
            Delivery::Skipped => "skipped",
        }
    }
}

pub struct WhatsappNotifier {
    pool: DbPool,
    sender: Arc<dyn WhatsappSender>,
}

impl WhatsappNotifier {
    pub fn new(pool: DbPool, sender: Arc<dyn WhatsappSender>) -> Self {
        Self { pool, sender }
    }

    /// Every attempt lands in `whatsapp_logs`; a failed send is not an error.
    pub async fn notify(
        &self,
        establishment_id: Uuid,
        appointment_id: Option<Uuid>,
        raw_phone: &str,
        text: &str,
    ) -> Result<Delivery> {
        let mut conn = self.pool.get().await?;
        let config = whatsapp_config::table
            .find(establishment_id)
            .first::<WhatsappConfig>(&mut conn)
            .await
            .optional()?;
        let Some(config) = config.filter(|c| c.enabled) else {
            debug!("WhatsApp disabled for establishment {}", establishment_id);
            return Ok(Delivery::Skipped);
        };

        let (phone, delivery, error) = match normalize_whatsapp(raw_phone) {
            None => (raw_phone.to_string(), Delivery::Failed, Some("invalid phone number".to_string())),
            Some(number) => match self.sender.send_text(&config, &number, text).await {
                Ok(()) => (number, Delivery::Sent, None),
                Err(e) => (number, Delivery::Failed, Some(e.to_string())),
            },
        };

        match &error {
            None => info!("WhatsApp message sent to {} for establishment {}", phone, establishment_id),
            Some(e) => warn!("WhatsApp message to {} failed: {}", phone, e),
        }

        let log = NewWhatsappLog {
            id: Uuid::new_v4(),
            establishment_id,
            appointment_id,
            phone,
            message: text.to_string(),
            status: delivery.as_str().to_string(),
            error,
        };
        diesel::insert_into(whatsapp_logs::table).values(&log).execute(&mut conn).await?;

        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> WhatsappConfig {
        WhatsappConfig {
            establishment_id: Uuid::new_v4(),
            enabled: true,
            api_url: "https://evolution.example.com/".to_string(),
            instance: "barbearia-central".to_string(),
            api_token: "evo-token".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn send_text_targets_the_tenant_instance() {
        let client = EvolutionClient::new().unwrap();
        let request = client.build(&config(), "5511987654321", "Olá").build().unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "https://evolution.example.com/message/sendText/barbearia-central");
        assert_eq!(request.headers()["apikey"], "evo-token");

        let body: serde_json::Value = serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({ "number": "5511987654321", "text": "Olá" }));
    }

    #[test]
    fn delivery_statuses_match_log_values() {
        assert_eq!(Delivery::Sent.as_str(), "sent");
        assert_eq!(Delivery::Failed.as_str(), "failed");
    }
}
