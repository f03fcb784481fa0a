use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{delete, get, patch, post},
    Router,
};
use serde::Deserialize;
use shared::auth::{load_caller, AuthUser, Caller, JwtVerifier};
use shared::db::DbPool;
use shared::error::ApiResult;
use shared::extract::{Json, Path};
use shared::SubscriptionChangedData;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::booking::{AppointmentView, BookingInput, BookingService};
use crate::handlers::{
    AccountService, BarberInput, CreatedBarber, EstablishmentSummary, PasswordReset, ProvisionInput, ProvisionedAccount,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub accounts: Arc<AccountService>,
    pub booking: Arc<BookingService>,
    pub jwt: JwtVerifier,
}

impl FromRef<AppState> for JwtVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

impl AppState {
    async fn caller(&self, auth: &AuthUser) -> ApiResult<Caller> {
        let mut conn = self.pool.get().await?;
        load_caller(&mut conn, auth).await
    }
}

#[derive(Debug, Deserialize)]
pub struct ActiveInput {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExtendInput {
    pub days: i64,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(provision_account))
        .route("/establishments/:establishment_id/barbers", post(create_barber))
        .route("/users/:user_id", delete(delete_user))
        .route("/users/:user_id/reset-password", post(reset_password))
        .route("/admin/establishments", get(list_establishments))
        .route("/admin/establishments/:establishment_id", patch(set_active))
        .route("/admin/establishments/:establishment_id/extend", post(extend_subscription))
        .route("/appointments", post(book_appointment))
        .route("/appointments/:appointment_id/cancel", post(cancel_appointment))
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

pub async fn provision_account(
    State(state): State<AppState>,
    Json(input): Json<ProvisionInput>,
) -> ApiResult<(StatusCode, Json<ProvisionedAccount>)> {
    let account = state.accounts.provision_owner(input).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn create_barber(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(establishment_id): Path<Uuid>,
    Json(input): Json<BarberInput>,
) -> ApiResult<(StatusCode, Json<CreatedBarber>)> {
    let caller = state.caller(&auth).await?;
    let barber = state.accounts.create_barber(&caller, establishment_id, input).await?;
    Ok((StatusCode::CREATED, Json(barber)))
}

pub async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let caller = state.caller(&auth).await?;
    state.accounts.delete_user(&caller, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reset_password(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<PasswordReset>> {
    let caller = state.caller(&auth).await?;
    Ok(Json(state.accounts.reset_password(&caller, user_id).await?))
}

pub async fn list_establishments(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<EstablishmentSummary>>> {
    let caller = state.caller(&auth).await?;
    Ok(Json(state.accounts.list_establishments(&caller).await?))
}

pub async fn set_active(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(establishment_id): Path<Uuid>,
    Json(input): Json<ActiveInput>,
) -> ApiResult<Json<EstablishmentSummary>> {
    let caller = state.caller(&auth).await?;
    Ok(Json(state.accounts.set_active(&caller, establishment_id, input.active).await?))
}

pub async fn extend_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(establishment_id): Path<Uuid>,
    Json(input): Json<ExtendInput>,
) -> ApiResult<Json<SubscriptionChangedData>> {
    let caller = state.caller(&auth).await?;
    Ok(Json(state.accounts.extend_subscription(&caller, establishment_id, input.days).await?))
}

pub async fn book_appointment(
    State(state): State<AppState>,
    Json(input): Json<BookingInput>,
) -> ApiResult<(StatusCode, Json<AppointmentView>)> {
    let appointment = state.booking.book(input).await?;
    Ok((StatusCode::CREATED, Json(appointment)))
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(appointment_id): Path<Uuid>,
) -> ApiResult<Json<AppointmentView>> {
    let caller = state.caller(&auth).await?;
    Ok(Json(state.booking.cancel(&caller, appointment_id).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_admin::AuthAdminClient;
    use axum::body::Body;
    use axum::http::{header, Request};
    use shared::billing::DunningPolicy;
    use tower::ServiceExt;

    fn app() -> Router {
        let pool = shared::db::lazy_pool("postgres://localhost/unused");
        let auth = Arc::new(AuthAdminClient::new("http://127.0.0.1:9", "service-key").unwrap());
        create_router(AppState {
            pool: pool.clone(),
            accounts: Arc::new(AccountService::new(pool.clone(), auth, 7)),
            booking: Arc::new(BookingService::new(pool, DunningPolicy::default())),
            jwt: JwtVerifier::new("jwt-secret", None),
        })
    }

    #[tokio::test]
    async fn health_check_responds() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_routes_require_a_token() {
        let response = app()
            .oneshot(Request::builder().uri("/admin/establishments").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_tokens_are_rejected() {
        let request = Request::builder()
            .method("DELETE")
            .uri("/users/6f1c2a9e-1d2b-4c3d-9e8f-0a1b2c3d4e5f")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_booking_body_renders_the_error_envelope() {
        let request = Request::builder()
            .method("POST")
            .uri("/appointments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"establishment_id":"x"}"#))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn booking_in_the_past_is_a_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/appointments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"establishment_id":"6f1c2a9e-1d2b-4c3d-9e8f-0a1b2c3d4e5f","barber_id":"6f1c2a9e-1d2b-4c3d-9e8f-0a1b2c3d4e60","client_name":"João","client_phone":"(11) 98765-4321","service":"Corte","starts_at":"2020-01-01T10:00:00Z","duration_minutes":30}"#,
            ))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
