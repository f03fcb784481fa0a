use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use num_traits::{FromPrimitive, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use shared::billing::{DunningPolicy, PaymentOutcome, SubscriptionState, TransitionEffect};
use shared::db::DbPool;
use shared::error::{ApiError, ApiResult};
use shared::models::*;
use shared::schema::*;
use shared::{outbox, store, DomainEvent, EventType, Gateway, SubscriptionChangedData, SubscriptionStatus};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gateways::{CheckoutRequest, Gateways, PaymentNotification, SubscriptionLocator};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied { subscription_id: Uuid, status: SubscriptionStatus },
    Ignored { reason: String },
    Duplicate,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutInput {
    pub establishment_id: Uuid,
    pub plan_id: Uuid,
    pub gateway: Gateway,
    pub payer_email: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutView {
    pub subscription_id: Uuid,
    pub gateway: Gateway,
    pub external_id: String,
    pub checkout_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub gateway: Option<Gateway>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub grants_access: bool,
}

pub struct SubscriptionService {
    pool: DbPool,
    policy: DunningPolicy,
    default_interval_days: i64,
}

impl SubscriptionService {
    pub fn new(pool: DbPool, policy: DunningPolicy, default_interval_days: i64) -> Self {
        Self { pool, policy, default_interval_days }
    }

    pub fn view(&self, subscription: &Subscription, now: DateTime<Utc>) -> Result<SubscriptionView> {
        let state = subscription.state()?;
        Ok(SubscriptionView {
            id: subscription.id,
            establishment_id: subscription.establishment_id,
            plan_id: subscription.plan_id,
            grants_access: state.has_access(now, &self.policy),
            status: state.status,
            gateway: state.gateway,
            expires_at: state.expires_at,
            retry_count: state.retry_count,
            last_payment_at: subscription.last_payment_at,
        })
    }

    pub async fn find(&self, establishment_id: Uuid) -> ApiResult<SubscriptionView> {
        let mut conn = self.pool.get().await?;
        let subscription = subscriptions::table
            .filter(subscriptions::establishment_id.eq(establishment_id))
            .first::<Subscription>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ApiError::NotFound(format!("No subscription for establishment {}", establishment_id)))?;

        Ok(self.view(&subscription, Utc::now())?)
    }

    /// Applies a resolved gateway notification exactly once.
    pub async fn apply_notification(&self, notification: PaymentNotification) -> ApiResult<WebhookOutcome> {
        let mut conn = self.pool.get().await?;
        let policy = self.policy;
        let default_interval_days = self.default_interval_days;

        conn.transaction::<_, ApiError, _>(move |conn| {
            Box::pin(async move {
                // Concurrent deliveries of the same event serialize on this row.
                let marker = ProcessedWebhook {
                    gateway: notification.gateway.as_str().to_string(),
                    event_key: notification.event_key.clone(),
                    processed_at: Utc::now(),
                };
                let inserted = diesel::insert_into(processed_webhooks::table)
                    .values(&marker)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 0 {
                    info!("{} notification {} already processed", notification.gateway, notification.event_key);
                    return Ok(WebhookOutcome::Duplicate);
                }

                let subscription = locate_for_update(conn, &notification.locator).await?.ok_or_else(|| {
                    ApiError::NotFound(format!(
                        "No subscription matches {} notification {}",
                        notification.gateway, notification.event_key
                    ))
                })?;

                let interval_days = plan_interval(conn, subscription.plan_id).await?.unwrap_or(default_interval_days);
                let now = Utc::now();
                let update = match plan_notification(&subscription, &notification, interval_days, now, &policy)? {
                    NotificationPlan::Ignore { reason } => {
                        warn!(
                            "Ignoring {} notification {} for subscription {}: {}",
                            notification.gateway, notification.event_key, subscription.id, reason
                        );
                        return Ok(WebhookOutcome::Ignored { reason: reason.to_string() });
                    }
                    NotificationPlan::Update(update) => update,
                };
                let next = &update.next;

                diesel::update(subscriptions::table.find(subscription.id))
                    .set((
                        subscriptions::status.eq(next.status.as_str()),
                        subscriptions::gateway.eq(next.gateway.map(|g| g.as_str())),
                        subscriptions::external_id.eq(update.external_id.as_deref()),
                        subscriptions::expires_at.eq(next.expires_at),
                        subscriptions::retry_count.eq(next.retry_count),
                        subscriptions::last_payment_at.eq(update.last_payment_at),
                        subscriptions::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                store::mirror_subscription(conn, subscription.establishment_id, next.status, next.expires_at).await?;

                if let Some(payment_id) = &notification.external_payment_id {
                    record_payment(conn, &subscription, notification.gateway, payment_id, &notification.outcome).await?;
                }

                if let Some((event_type, data)) = &update.event {
                    let event = DomainEvent::new(subscription.establishment_id, *event_type, data)?;
                    outbox::enqueue(conn, &event).await?;
                }

                info!(
                    "Subscription {} is now {} after {} notification {}",
                    subscription.id, next.status, notification.gateway, notification.event_key
                );
                Ok(WebhookOutcome::Applied { subscription_id: subscription.id, status: next.status })
            })
        })
        .await
    }

    pub async fn checkout(&self, gateways: &Gateways, input: CheckoutInput) -> ApiResult<CheckoutView> {
        if !input.payer_email.contains('@') {
            return Err(ApiError::BadRequest("payer_email must be a valid e-mail address".to_string()));
        }

        let mut conn = self.pool.get().await?;
        let establishment = establishments::table
            .find(input.establishment_id)
            .first::<Establishment>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Establishment not found".to_string()))?;
        let plan = saas_plans::table
            .find(input.plan_id)
            .filter(saas_plans::active.eq(true))
            .first::<SaasPlan>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Plan not found".to_string()))?;
        if input.gateway == Gateway::Iugu && plan.iugu_plan_identifier.is_none() {
            return Err(ApiError::BadRequest(format!("Plan {} is not available on Iugu", plan.name)));
        }

        let existing = subscriptions::table
            .filter(subscriptions::establishment_id.eq(establishment.id))
            .first::<Subscription>(&mut conn)
            .await
            .optional()?;
        let existing_state = existing.as_ref().map(Subscription::state).transpose()?;
        if let Some(state) = &existing_state {
            if state.status == SubscriptionStatus::Active && state.gateway.is_some() {
                return Err(ApiError::Conflict("Subscription already active; cancel it before switching".to_string()));
            }
        }

        let gateway = gateways.get(input.gateway);
        let request = CheckoutRequest {
            establishment_id: establishment.id,
            establishment_name: establishment.name.clone(),
            payer_email: input.payer_email.clone(),
            plan_name: plan.name.clone(),
            price: plan.price.to_f64().unwrap_or_default(),
            iugu_plan_identifier: plan.iugu_plan_identifier.clone(),
            existing_customer_id: existing
                .as_ref()
                .filter(|s| s.gateway.as_deref() == Some(input.gateway.as_str()))
                .and_then(|s| s.external_customer_id.clone()),
        };
        let checkout = gateway
            .create_subscription(&request)
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;

        // A tenant still in trial keeps access until the first payment lands.
        let status = match &existing_state {
            Some(state) if state.status.grants_access() => state.status,
            _ => SubscriptionStatus::Pending,
        };
        let expires_at = existing_state.as_ref().and_then(|s| s.expires_at);
        let plan_id = plan.id;
        let gateway_kind = gateway.gateway();
        let stored = {
            let checkout = checkout.clone();
            let existing_id = existing.as_ref().map(|s| s.id);
            conn.transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let subscription_id = match existing_id {
                        Some(id) => {
                            diesel::update(subscriptions::table.find(id))
                                .set((
                                    subscriptions::plan_id.eq(Some(plan_id)),
                                    subscriptions::status.eq(status.as_str()),
                                    subscriptions::gateway.eq(Some(gateway_kind.as_str())),
                                    subscriptions::external_id.eq(Some(checkout.external_id.as_str())),
                                    subscriptions::external_customer_id.eq(checkout.customer_id.as_deref()),
                                    subscriptions::retry_count.eq(0),
                                    subscriptions::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?;
                            id
                        }
                        None => {
                            let row = NewSubscription {
                                id: Uuid::new_v4(),
                                establishment_id: input.establishment_id,
                                plan_id: Some(plan_id),
                                status: status.as_str().to_string(),
                                gateway: Some(gateway_kind.as_str().to_string()),
                                external_id: Some(checkout.external_id.clone()),
                                external_customer_id: checkout.customer_id.clone(),
                                expires_at: None,
                                retry_count: 0,
                            };
                            diesel::insert_into(subscriptions::table).values(&row).execute(conn).await?;
                            row.id
                        }
                    };
                    store::mirror_subscription(conn, input.establishment_id, status, expires_at).await?;
                    Ok(subscription_id)
                })
            })
            .await
        };

        match stored {
            Ok(subscription_id) => {
                info!("Checkout {} started for establishment {} on {}", checkout.external_id, establishment.id, gateway_kind);
                Ok(CheckoutView {
                    subscription_id,
                    gateway: gateway_kind,
                    external_id: checkout.external_id,
                    checkout_url: checkout.checkout_url,
                })
            }
            Err(e) => {
                // Nothing references the gateway subscription; do not leave it billing.
                if let Err(cancel_err) = gateway.cancel_subscription(&checkout.external_id).await {
                    error!("Failed to cancel orphaned {} subscription {}: {}", gateway_kind, checkout.external_id, cancel_err);
                }
                Err(e)
            }
        }
    }

    pub async fn cancel(&self, gateways: &Gateways, establishment_id: Uuid) -> ApiResult<SubscriptionView> {
        let mut conn = self.pool.get().await?;
        let subscription = subscriptions::table
            .filter(subscriptions::establishment_id.eq(establishment_id))
            .first::<Subscription>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ApiError::NotFound(format!("No subscription for establishment {}", establishment_id)))?;

        let state = subscription.state()?;
        if state.status == SubscriptionStatus::Cancelled {
            return Ok(self.view(&subscription, Utc::now())?);
        }
        let (Some(gateway), Some(external_id)) = (state.gateway, subscription.external_id.clone()) else {
            return Err(ApiError::BadRequest("Subscription is not billed by any gateway".to_string()));
        };

        gateways
            .get(gateway)
            .cancel_subscription(&external_id)
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;

        let cancelled = conn
            .transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    let subscription = store::subscription_for_update(conn, establishment_id)
                        .await?
                        .ok_or_else(|| ApiError::NotFound("Subscription disappeared".to_string()))?;
                    let now = Utc::now();

                    let updated = diesel::update(subscriptions::table.find(subscription.id))
                        .set((
                            subscriptions::status.eq(SubscriptionStatus::Cancelled.as_str()),
                            subscriptions::updated_at.eq(now),
                        ))
                        .get_result::<Subscription>(conn)
                        .await?;
                    store::mirror_subscription(conn, establishment_id, SubscriptionStatus::Cancelled, updated.expires_at).await?;

                    let data = SubscriptionChangedData {
                        establishment_id,
                        subscription_id: updated.id,
                        gateway: Some(gateway),
                        status: SubscriptionStatus::Cancelled,
                        expires_at: updated.expires_at,
                        retry_count: updated.retry_count,
                        amount: None,
                        reason: Some("cancelled by owner".to_string()),
                    };
                    let event = DomainEvent::new(establishment_id, EventType::SubscriptionCancelled, &data)?;
                    outbox::enqueue(conn, &event).await?;
                    Ok(updated)
                })
            })
            .await?;

        info!("Subscription {} cancelled for establishment {}", cancelled.id, establishment_id);
        Ok(self.view(&cancelled, Utc::now())?)
    }

    /// Marks subscriptions past expiry plus grace as expired.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let cutoff = now - Duration::days(self.policy.grace_days);
        let candidates = subscriptions::table
            .filter(subscriptions::status.eq_any(vec![
                SubscriptionStatus::Trial.as_str(),
                SubscriptionStatus::Active.as_str(),
                SubscriptionStatus::PastDue.as_str(),
            ]))
            .filter(subscriptions::expires_at.lt(cutoff))
            .select(subscriptions::establishment_id)
            .limit(500)
            .load::<Uuid>(&mut conn)
            .await?;

        let mut expired = 0;
        for establishment_id in candidates {
            let policy = self.policy;
            let changed = conn
                .transaction::<_, anyhow::Error, _>(move |conn| {
                    Box::pin(async move {
                        let Some(subscription) = store::subscription_for_update(conn, establishment_id).await? else {
                            return Ok(false);
                        };
                        let state = subscription.state()?;
                        if !state.is_expired(now, &policy) {
                            return Ok(false);
                        }

                        diesel::update(subscriptions::table.find(subscription.id))
                            .set((
                                subscriptions::status.eq(SubscriptionStatus::Expired.as_str()),
                                subscriptions::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                        store::mirror_subscription(conn, establishment_id, SubscriptionStatus::Expired, state.expires_at).await?;

                        let data = SubscriptionChangedData {
                            establishment_id,
                            subscription_id: subscription.id,
                            gateway: state.gateway,
                            status: SubscriptionStatus::Expired,
                            expires_at: state.expires_at,
                            retry_count: state.retry_count,
                            amount: None,
                            reason: None,
                        };
                        let event = DomainEvent::new(establishment_id, EventType::SubscriptionExpired, &data)?;
                        outbox::enqueue(conn, &event).await?;
                        Ok(true)
                    })
                })
                .await?;
            if changed {
                info!("Subscription of establishment {} expired", establishment_id);
                expired += 1;
            }
        }

        Ok(expired)
    }
}

/// Row changes and event a notification produces for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub next: SubscriptionState,
    pub external_id: Option<String>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub event: Option<(EventType, SubscriptionChangedData)>,
}

#[derive(Debug, Clone)]
pub enum NotificationPlan {
    Ignore { reason: &'static str },
    Update(SubscriptionUpdate),
}

/// Decides what a notification does to a locked subscription row without touching the store.
pub fn plan_notification(
    subscription: &Subscription,
    notification: &PaymentNotification,
    interval_days: i64,
    now: DateTime<Utc>,
    policy: &DunningPolicy,
) -> Result<NotificationPlan> {
    let state = subscription.state()?;
    let transition = state.apply(&notification.outcome, notification.gateway, now, interval_days, policy);
    if let TransitionEffect::Ignored { reason } = transition.effect {
        return Ok(NotificationPlan::Ignore { reason });
    }

    let (last_payment_at, external_id) = match &notification.outcome {
        PaymentOutcome::Succeeded { paid_at, .. } => {
            let switched = state.gateway != Some(notification.gateway);
            let external_id = if switched {
                notification.locator.external_id.clone()
            } else {
                notification.locator.external_id.clone().or_else(|| subscription.external_id.clone())
            };
            (Some(*paid_at), external_id)
        }
        _ => (subscription.last_payment_at, subscription.external_id.clone()),
    };

    let next = transition.next;
    let event = transition.effect.event_type().map(|event_type| {
        let (amount, reason) = match &notification.outcome {
            PaymentOutcome::Succeeded { amount, .. } => (Some(*amount), None),
            PaymentOutcome::Failed { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        let data = SubscriptionChangedData {
            establishment_id: subscription.establishment_id,
            subscription_id: subscription.id,
            gateway: next.gateway,
            status: next.status,
            expires_at: next.expires_at,
            retry_count: next.retry_count,
            amount,
            reason,
        };
        (event_type, data)
    });

    Ok(NotificationPlan::Update(SubscriptionUpdate { next, external_id, last_payment_at, event }))
}

async fn locate_for_update(conn: &mut AsyncPgConnection, locator: &SubscriptionLocator) -> QueryResult<Option<Subscription>> {
    if let Some(external_id) = &locator.external_id {
        let found = subscriptions::table
            .filter(subscriptions::external_id.eq(external_id))
            .for_update()
            .first::<Subscription>(conn)
            .await
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    match locator.establishment_id {
        Some(establishment_id) => store::subscription_for_update(conn, establishment_id).await,
        None => Ok(None),
    }
}

async fn plan_interval(conn: &mut AsyncPgConnection, plan_id: Option<Uuid>) -> QueryResult<Option<i64>> {
    let Some(plan_id) = plan_id else {
        return Ok(None);
    };
    let days = saas_plans::table
        .find(plan_id)
        .select(saas_plans::interval_days)
        .first::<i32>(conn)
        .await
        .optional()?;
    Ok(days.map(i64::from))
}

async fn record_payment(
    conn: &mut AsyncPgConnection,
    subscription: &Subscription,
    gateway: Gateway,
    external_payment_id: &str,
    outcome: &PaymentOutcome,
) -> QueryResult<()> {
    let (amount, status, failure_reason, paid_at) = match outcome {
        PaymentOutcome::Succeeded { amount, paid_at } => (
            BigDecimal::from_f64(*amount).unwrap_or_else(BigDecimal::zero).with_scale(2),
            "paid",
            None,
            Some(*paid_at),
        ),
        PaymentOutcome::Failed { reason } => (BigDecimal::zero(), "failed", Some(reason.clone()), None),
        _ => return Ok(()),
    };

    let payment = NewSaasPayment {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        establishment_id: subscription.establishment_id,
        gateway: gateway.as_str().to_string(),
        external_payment_id: external_payment_id.to_string(),
        amount,
        status: status.to_string(),
        failure_reason,
        paid_at,
    };
    diesel::insert_into(saas_payments::table).values(&payment).execute(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> SubscriptionService {
        SubscriptionService::new(
            shared::db::lazy_pool("postgres://localhost/unused"),
            DunningPolicy::default(),
            30,
        )
    }

    fn row(status: &str, expires_at: Option<DateTime<Utc>>) -> Subscription {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Subscription {
            id: Uuid::new_v4(),
            establishment_id: Uuid::new_v4(),
            plan_id: None,
            status: status.to_string(),
            gateway: Some("mercadopago".to_string()),
            external_id: Some("2c9380848".to_string()),
            external_customer_id: None,
            expires_at,
            retry_count: 1,
            last_payment_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn view_reports_access_within_grace_period() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let view = service().view(&row("past_due", Some(now - Duration::days(2))), now).unwrap();

        assert_eq!(view.status, SubscriptionStatus::PastDue);
        assert_eq!(view.gateway, Some(Gateway::MercadoPago));
        assert!(view.grants_access);
    }

    #[tokio::test]
    async fn view_denies_access_after_grace_or_when_suspended() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let svc = service();

        assert!(!svc.view(&row("active", Some(now - Duration::days(5))), now).unwrap().grants_access);
        assert!(!svc.view(&row("suspended", Some(now + Duration::days(5))), now).unwrap().grants_access);
    }

    fn notification(gateway: Gateway, outcome: PaymentOutcome, external_id: &str) -> PaymentNotification {
        PaymentNotification {
            gateway,
            event_key: format!("payment:{}:{}", Uuid::new_v4(), gateway),
            locator: SubscriptionLocator { external_id: Some(external_id.to_string()), establishment_id: None },
            external_payment_id: Some("98765".to_string()),
            outcome,
        }
    }

    fn rejected() -> PaymentOutcome {
        PaymentOutcome::Failed { reason: "cc_rejected_other_reason".to_string() }
    }

    #[test]
    fn failure_from_other_gateway_plans_no_change() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let subscription = row("active", Some(now + Duration::days(10)));
        let notification = notification(Gateway::Iugu, rejected(), "INV1");

        let plan = plan_notification(&subscription, &notification, 30, now, &DunningPolicy::default()).unwrap();
        assert!(matches!(plan, NotificationPlan::Ignore { .. }));
    }

    #[test]
    fn failure_from_billing_gateway_emits_payment_failed() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let subscription = row("active", Some(now + Duration::days(10)));
        let notification = notification(Gateway::MercadoPago, rejected(), "2c9380848");

        let NotificationPlan::Update(update) =
            plan_notification(&subscription, &notification, 30, now, &DunningPolicy::default()).unwrap()
        else {
            panic!("expected an update");
        };
        assert_eq!(update.next.status, SubscriptionStatus::PastDue);
        assert_eq!(update.next.retry_count, 2);
        assert_eq!(update.external_id.as_deref(), Some("2c9380848"));
        let (event_type, data) = update.event.unwrap();
        assert_eq!(event_type, EventType::PaymentFailed);
        assert_eq!(data.reason.as_deref(), Some("cc_rejected_other_reason"));
    }

    #[test]
    fn payment_on_other_gateway_moves_billing_and_external_id() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let subscription = row("past_due", Some(now - Duration::days(1)));
        let paid = PaymentOutcome::Succeeded { amount: 79.9, paid_at: now };
        let notification = notification(Gateway::Iugu, paid, "IUGU-SUB-1");

        let NotificationPlan::Update(update) =
            plan_notification(&subscription, &notification, 30, now, &DunningPolicy::default()).unwrap()
        else {
            panic!("expected an update");
        };
        assert_eq!(update.next.status, SubscriptionStatus::Active);
        assert_eq!(update.next.gateway, Some(Gateway::Iugu));
        assert_eq!(update.external_id.as_deref(), Some("IUGU-SUB-1"));
        assert_eq!(update.last_payment_at, Some(now));
        assert_eq!(update.event.map(|(t, _)| t), Some(EventType::SubscriptionRenewed));
    }

    /// Store-backed checks run only when `TEST_DATABASE_URL` points at a scratch database.
    mod with_database {
        use super::*;
        use std::sync::Once;

        static MIGRATE: Once = Once::new();

        async fn setup() -> Option<(SubscriptionService, Subscription)> {
            let url = std::env::var("TEST_DATABASE_URL").ok()?;
            MIGRATE.call_once(|| shared::db::run_migrations(&url).unwrap());
            let pool = shared::db::build_pool(&url, 2).await.unwrap();
            let mut conn = pool.get().await.unwrap();

            let establishment_id = Uuid::new_v4();
            diesel::insert_into(establishments::table)
                .values(&NewEstablishment {
                    id: establishment_id,
                    name: "Barbearia Teste".to_string(),
                    slug: format!("barbearia-{}", establishment_id),
                    phone: None,
                    active: true,
                    subscription_status: "active".to_string(),
                    subscription_expires_at: None,
                })
                .execute(&mut conn)
                .await
                .unwrap();
            let subscription = diesel::insert_into(subscriptions::table)
                .values(&NewSubscription {
                    id: Uuid::new_v4(),
                    establishment_id,
                    plan_id: None,
                    status: "active".to_string(),
                    gateway: Some("mercadopago".to_string()),
                    external_id: Some(format!("pre-{}", establishment_id)),
                    external_customer_id: None,
                    expires_at: Some(Utc::now() + Duration::days(20)),
                    retry_count: 0,
                })
                .get_result::<Subscription>(&mut conn)
                .await
                .unwrap();
            drop(conn);

            Some((SubscriptionService::new(pool, DunningPolicy::default(), 30), subscription))
        }

        async fn reload(service: &SubscriptionService, id: Uuid) -> Subscription {
            let mut conn = service.pool.get().await.unwrap();
            subscriptions::table.find(id).first::<Subscription>(&mut conn).await.unwrap()
        }

        async fn key_recorded(service: &SubscriptionService, notification: &PaymentNotification) -> bool {
            let mut conn = service.pool.get().await.unwrap();
            let count = processed_webhooks::table
                .filter(processed_webhooks::gateway.eq(notification.gateway.as_str()))
                .filter(processed_webhooks::event_key.eq(&notification.event_key))
                .count()
                .get_result::<i64>(&mut conn)
                .await
                .unwrap();
            count == 1
        }

        #[tokio::test]
        async fn replayed_notification_is_a_duplicate_without_side_effects() {
            let Some((service, subscription)) = setup().await else {
                return;
            };
            let failure = notification(Gateway::MercadoPago, rejected(), subscription.external_id.as_deref().unwrap());

            let first = service.apply_notification(failure.clone()).await.unwrap();
            assert_eq!(
                first,
                WebhookOutcome::Applied { subscription_id: subscription.id, status: SubscriptionStatus::PastDue }
            );
            let replay = service.apply_notification(failure).await.unwrap();
            assert_eq!(replay, WebhookOutcome::Duplicate);

            assert_eq!(reload(&service, subscription.id).await.retry_count, 1);
        }

        #[tokio::test]
        async fn ignored_notification_still_records_its_key() {
            let Some((service, subscription)) = setup().await else {
                return;
            };
            let failure = notification(Gateway::Iugu, rejected(), subscription.external_id.as_deref().unwrap());

            let outcome = service.apply_notification(failure.clone()).await.unwrap();
            assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
            assert!(key_recorded(&service, &failure).await);

            let unchanged = reload(&service, subscription.id).await;
            assert_eq!(unchanged.status, "active");
            assert_eq!(unchanged.retry_count, 0);
            assert_eq!(unchanged.expires_at, subscription.expires_at);
        }

        #[tokio::test]
        async fn unmatched_notification_rolls_back_its_key() {
            let Some((service, _)) = setup().await else {
                return;
            };
            let orphan = notification(Gateway::MercadoPago, rejected(), &format!("missing-{}", Uuid::new_v4()));

            let result = service.apply_notification(orphan.clone()).await;
            assert!(matches!(result, Err(ApiError::NotFound(_))));
            assert!(!key_recorded(&service, &orphan).await);
        }
    }

    #[test]
    fn webhook_outcome_serializes_with_result_tag() {
        let applied = WebhookOutcome::Applied { subscription_id: Uuid::nil(), status: SubscriptionStatus::Active };
        let json = serde_json::to_value(&applied).unwrap();
        assert_eq!(json["result"], "applied");
        assert_eq!(json["status"], "active");

        assert_eq!(serde_json::to_value(WebhookOutcome::Duplicate).unwrap()["result"], "duplicate");
    }
}
