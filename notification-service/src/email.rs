use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use crate::templates::Email;

pub const DEFAULT_BASE_URL: &str = "https://api.resend.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, email: &Email) -> Result<()>;
}

/// Transactional e-mail through Resend (`POST /emails`).
pub struct ResendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl ResendClient {
    pub fn new(base_url: &str, api_key: &str, from: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }

    fn build(&self, to: &str, email: &Email) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [to],
                "subject": email.subject,
                "html": email.html,
            }))
    }
}

#[async_trait]
impl EmailSender for ResendClient {
    async fn send(&self, to: &str, email: &Email) -> Result<()> {
        let response = self.build(to, email).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Resend returned HTTP {}: {}", status.as_u16(), body));
        }
        info!("E-mail \"{}\" sent to {}", email.subject, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_sender_and_single_recipient() {
        let client = ResendClient::new(DEFAULT_BASE_URL, "re_key", "Agenda <noreply@agenda.app>").unwrap();
        let email = Email { subject: "Oi".to_string(), html: "<p>Oi</p>".to_string() };
        let request = client.build("dono@barbearia.com", &email).build().unwrap();

        assert_eq!(request.url().as_str(), "https://api.resend.com/emails");
        assert_eq!(request.headers()["authorization"], "Bearer re_key");

        let body: serde_json::Value = serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["from"], "Agenda <noreply@agenda.app>");
        assert_eq!(body["to"], json!(["dono@barbearia.com"]));
        assert_eq!(body["subject"], "Oi");
    }
}
