use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use shared::auth::{load_caller, AuthUser, JwtVerifier};
use shared::db::DbPool;
use shared::error::{ApiError, ApiResult};
use shared::extract::{Form, Json, Path, Query};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateways::iugu::{self, WebhookForm};
use crate::gateways::mercadopago::{self, WebhookPayload, WebhookQuery};
use crate::gateways::{Gateways, IuguClient, MercadoPagoClient};
use crate::handlers::{CheckoutInput, CheckoutView, SubscriptionService, SubscriptionView, WebhookOutcome};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub service: Arc<SubscriptionService>,
    pub gateways: Gateways,
    pub mercadopago: Arc<MercadoPagoClient>,
    pub iugu: Arc<IuguClient>,
    pub mercadopago_webhook_secret: Option<String>,
    pub iugu_webhook_token: Option<String>,
    pub jwt: JwtVerifier,
}

impl FromRef<AppState> for JwtVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/mercadopago", post(mercadopago_webhook))
        .route("/webhooks/iugu", post(iugu_webhook))
        .route("/subscriptions/checkout", post(checkout))
        .route("/subscriptions/:establishment_id", get(find_subscription))
        .route("/subscriptions/:establishment_id/cancel", post(cancel_subscription))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn mercadopago_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let payload: WebhookPayload = if body.is_empty() {
        WebhookPayload::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("Invalid notification body: {}", e)))?
    };
    let (kind, id) = payload
        .target(&query)
        .ok_or_else(|| ApiError::BadRequest("Notification has no type or data.id".to_string()))?;

    match &state.mercadopago_webhook_secret {
        Some(secret) => {
            let (Some(signature), Some(request_id)) = (header(&headers, "x-signature"), header(&headers, "x-request-id")) else {
                return Err(ApiError::Unauthorized("Missing x-signature or x-request-id".to_string()));
            };
            let data_id = query.data_id.as_deref().unwrap_or(&id);
            if !mercadopago::verify_signature(signature, request_id, data_id, secret) {
                warn!("Rejected Mercado Pago notification {} with a bad signature", id);
                return Err(ApiError::Unauthorized("Invalid signature".to_string()));
            }
        }
        None => warn!("MERCADOPAGO_WEBHOOK_SECRET not set; accepting unsigned notification {}", id),
    }

    let notification = state
        .mercadopago
        .resolve(&kind, &id)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    let Some(notification) = notification else {
        return Ok(Json(json!({ "ignored": true })));
    };

    let outcome = state.service.apply_notification(notification).await?;
    Ok(Json(outcome_body(outcome)))
}

pub async fn iugu_webhook(State(state): State<AppState>, request: Request) -> ApiResult<Json<Value>> {
    let authenticated = match &state.iugu_webhook_token {
        Some(token) => {
            if !iugu::verify_token(header(request.headers(), "authorization"), token) {
                warn!("Rejected Iugu notification with a bad token");
                return Err(ApiError::Unauthorized("Invalid webhook token".to_string()));
            }
            true
        }
        None => false,
    };

    let Form(form) = Form::<WebhookForm>::from_request(request, &state).await?;
    if !authenticated {
        warn!("IUGU_WEBHOOK_TOKEN not set; accepting unauthenticated notification {}", form.event);
    }

    let notification = state.iugu.resolve(&form).await.map_err(|e| ApiError::Upstream(e.to_string()))?;
    let Some(notification) = notification else {
        return Ok(Json(json!({ "ignored": true })));
    };

    let outcome = state.service.apply_notification(notification).await?;
    Ok(Json(outcome_body(outcome)))
}

fn outcome_body(outcome: WebhookOutcome) -> Value {
    serde_json::to_value(&outcome).unwrap_or_else(|_| json!({ "result": "applied" }))
}

pub async fn checkout(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<CheckoutInput>,
) -> ApiResult<(StatusCode, Json<CheckoutView>)> {
    let caller = {
        let mut conn = state.pool.get().await?;
        load_caller(&mut conn, &auth).await?
    };
    caller.require_manage(input.establishment_id)?;

    info!("User {} starting {} checkout for {}", caller.user_id, input.gateway, input.establishment_id);
    let view = state.service.checkout(&state.gateways, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn find_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(establishment_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let caller = {
        let mut conn = state.pool.get().await?;
        load_caller(&mut conn, &auth).await?
    };
    if !caller.works_at(establishment_id) {
        return Err(ApiError::Forbidden("Not a member of this establishment".to_string()));
    }

    Ok(Json(state.service.find(establishment_id).await?))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(establishment_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let caller = {
        let mut conn = state.pool.get().await?;
        load_caller(&mut conn, &auth).await?
    };
    caller.require_manage(establishment_id)?;

    Ok(Json(state.service.cancel(&state.gateways, establishment_id).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}
