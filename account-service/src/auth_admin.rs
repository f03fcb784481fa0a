//! Admin API of the hosted auth platform: accounts are created and removed
//! with the service-role key, never with the caller's token.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::Deserialize;
use serde_json::json;
use shared::error::{ApiError, ApiResult};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub const GENERATED_PASSWORD_LEN: usize = 12;

#[async_trait]
pub trait AuthAdmin: Send + Sync {
    async fn create_user(&self, email: &str, password: &str, name: &str) -> ApiResult<Uuid>;

    /// Removing an account that no longer exists succeeds.
    async fn delete_user(&self, user_id: Uuid) -> ApiResult<()>;

    async fn update_password(&self, user_id: Uuid, password: &str) -> ApiResult<()>;
}

pub struct AuthAdminClient {
    http: reqwest::Client,
    base_url: String,
    service_role_key: String,
}

#[derive(Debug, Deserialize)]
struct CreatedUser {
    id: Uuid,
}

impl AuthAdminClient {
    pub fn new(base_url: &str, service_role_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/auth/v1/admin{}", self.base_url, path))
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }
}

fn upstream(err: reqwest::Error) -> ApiError {
    ApiError::Upstream(format!("Auth platform unreachable: {}", err))
}

#[async_trait]
impl AuthAdmin for AuthAdminClient {
    async fn create_user(&self, email: &str, password: &str, name: &str) -> ApiResult<Uuid> {
        let response = self
            .request(reqwest::Method::POST, "/users")
            .json(&json!({
                "email": email,
                "password": password,
                "email_confirm": true,
                "user_metadata": { "name": name },
            }))
            .send()
            .await
            .map_err(upstream)?;

        let status = response.status();
        if status.as_u16() == 422 || status.as_u16() == 409 {
            return Err(ApiError::Conflict(format!("E-mail {} is already registered", email)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!("create user returned HTTP {}: {}", status.as_u16(), body)));
        }

        let user: CreatedUser = response.json().await.map_err(upstream)?;
        info!("Created auth user {} for {}", user.id, email);
        Ok(user.id)
    }

    async fn delete_user(&self, user_id: Uuid) -> ApiResult<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/users/{}", user_id))
            .send()
            .await
            .map_err(upstream)?;

        let status = response.status();
        if status.as_u16() == 404 {
            warn!("Auth user {} was already gone", user_id);
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!("delete user returned HTTP {}: {}", status.as_u16(), body)));
        }
        info!("Deleted auth user {}", user_id);
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password: &str) -> ApiResult<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/users/{}", user_id))
            .json(&json!({ "password": password }))
            .send()
            .await
            .map_err(upstream)?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ApiError::NotFound(format!("Auth user {} not found", user_id)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!("update user returned HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(())
    }
}

pub fn generate_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}
