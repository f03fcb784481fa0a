use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::auth::{Caller, Role};
use shared::billing::next_expiry;
use shared::db::DbPool;
use shared::error::{ApiError, ApiResult};
use shared::models::*;
use shared::schema::*;
use shared::{
    outbox, store, AccountProvisionedData, BarberCreatedData, DomainEvent, EventType, SubscriptionChangedData,
    SubscriptionStatus,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth_admin::{generate_password, AuthAdmin};

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_EXTENSION_DAYS: i64 = 366;

#[derive(Debug, Deserialize)]
pub struct ProvisionInput {
    pub establishment_name: String,
    pub owner_name: String,
    pub email: String,
    pub password: String,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvisionedAccount {
    pub establishment_id: Uuid,
    pub owner_id: Uuid,
    pub subscription_id: Uuid,
    pub slug: String,
    pub trial_ends_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct BarberInput {
    pub name: String,
    pub email: String,
    pub password: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedBarber {
    pub barber_id: Uuid,
    pub user_id: Uuid,
    /// Only present when the password was generated here.
    pub temporary_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PasswordReset {
    pub user_id: Uuid,
    pub temporary_password: String,
}

#[derive(Debug, Serialize)]
pub struct EstablishmentSummary {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub active: bool,
    pub subscription_status: String,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Establishment> for EstablishmentSummary {
    fn from(e: Establishment) -> Self {
        Self {
            id: e.id,
            name: e.name,
            slug: e.slug,
            active: e.active,
            subscription_status: e.subscription_status,
            subscription_expires_at: e.subscription_expires_at,
            created_at: e.created_at,
        }
    }
}

pub struct AccountService {
    pool: DbPool,
    auth: Arc<dyn AuthAdmin>,
    trial_days: i64,
}

impl AccountService {
    pub fn new(pool: DbPool, auth: Arc<dyn AuthAdmin>, trial_days: i64) -> Self {
        Self { pool, auth, trial_days }
    }

    /// Public signup: auth account, tenant, owner profile and trial in one go.
    pub async fn provision_owner(&self, input: ProvisionInput) -> ApiResult<ProvisionedAccount> {
        let establishment_name = required("establishment_name", &input.establishment_name)?;
        let owner_name = required("owner_name", &input.owner_name)?;
        let email = validate_email(&input.email)?;
        validate_password(&input.password)?;

        let user_id = self.auth.create_user(&email, &input.password, &owner_name).await?;

        let trial_ends_at = Utc::now() + Duration::days(self.trial_days);
        let mut conn = self.pool.get().await?;
        let stored = {
            let email = email.clone();
            let phone = input.phone.clone();
            conn.transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    let slug = unique_slug(conn, &slugify(&establishment_name)).await?;
                    let establishment = NewEstablishment {
                        id: Uuid::new_v4(),
                        name: establishment_name.clone(),
                        slug: slug.clone(),
                        phone: phone.clone(),
                        active: true,
                        subscription_status: SubscriptionStatus::Trial.as_str().to_string(),
                        subscription_expires_at: Some(trial_ends_at),
                    };
                    diesel::insert_into(establishments::table).values(&establishment).execute(conn).await?;

                    let owner = NewUsuario {
                        id: user_id,
                        establishment_id: Some(establishment.id),
                        name: owner_name.clone(),
                        email: email.clone(),
                        phone,
                        role: Role::Owner.as_str().to_string(),
                    };
                    diesel::insert_into(usuarios::table).values(&owner).execute(conn).await?;

                    let subscription = NewSubscription {
                        id: Uuid::new_v4(),
                        establishment_id: establishment.id,
                        plan_id: None,
                        status: SubscriptionStatus::Trial.as_str().to_string(),
                        gateway: None,
                        external_id: None,
                        external_customer_id: None,
                        expires_at: Some(trial_ends_at),
                        retry_count: 0,
                    };
                    diesel::insert_into(subscriptions::table).values(&subscription).execute(conn).await?;

                    let data = AccountProvisionedData {
                        establishment_id: establishment.id,
                        establishment_name,
                        owner_id: user_id,
                        owner_name,
                        email,
                        trial_ends_at,
                    };
                    let event = DomainEvent::new(establishment.id, EventType::AccountProvisioned, &data)?;
                    outbox::enqueue(conn, &event).await?;

                    Ok(ProvisionedAccount {
                        establishment_id: establishment.id,
                        owner_id: user_id,
                        subscription_id: subscription.id,
                        slug,
                        trial_ends_at,
                    })
                })
            })
            .await
        };

        match stored {
            Ok(account) => {
                info!("Provisioned establishment {} ({}) for {}", account.establishment_id, account.slug, email);
                Ok(account)
            }
            Err(e) => {
                self.compensate(user_id).await;
                Err(e)
            }
        }
    }

    pub async fn create_barber(&self, caller: &Caller, establishment_id: Uuid, input: BarberInput) -> ApiResult<CreatedBarber> {
        caller.require_manage(establishment_id)?;
        let name = required("name", &input.name)?;
        let email = validate_email(&input.email)?;
        let (password, generated) = match input.password {
            Some(password) => {
                validate_password(&password)?;
                (password, false)
            }
            None => (generate_password(), true),
        };

        let mut conn = self.pool.get().await?;
        let establishment = establishments::table
            .find(establishment_id)
            .first::<Establishment>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Establishment not found".to_string()))?;

        let user_id = self.auth.create_user(&email, &password, &name).await?;

        let phone = input.phone;
        let stored = conn
            .transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    let user = NewUsuario {
                        id: user_id,
                        establishment_id: Some(establishment.id),
                        name: name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                        role: Role::Barber.as_str().to_string(),
                    };
                    diesel::insert_into(usuarios::table).values(&user).execute(conn).await?;

                    let barber = NewBarbeiro {
                        id: Uuid::new_v4(),
                        establishment_id: establishment.id,
                        user_id: Some(user_id),
                        name: name.clone(),
                        phone,
                        active: true,
                    };
                    diesel::insert_into(barbeiros::table).values(&barber).execute(conn).await?;

                    let data = BarberCreatedData {
                        establishment_id: establishment.id,
                        barber_id: barber.id,
                        user_id,
                        name,
                        email,
                    };
                    let event = DomainEvent::new(establishment.id, EventType::BarberCreated, &data)?;
                    outbox::enqueue(conn, &event).await?;
                    Ok(barber.id)
                })
            })
            .await;

        match stored {
            Ok(barber_id) => {
                info!("Barber {} added to establishment {}", barber_id, establishment_id);
                Ok(CreatedBarber {
                    barber_id,
                    user_id,
                    temporary_password: generated.then_some(password),
                })
            }
            Err(e) => {
                self.compensate(user_id).await;
                Err(e)
            }
        }
    }

    pub async fn delete_user(&self, caller: &Caller, user_id: Uuid) -> ApiResult<()> {
        if caller.user_id == user_id {
            return Err(ApiError::BadRequest("You cannot delete your own account".to_string()));
        }

        let mut conn = self.pool.get().await?;
        let target = find_user(&mut conn, user_id).await?;
        authorize_on_user(caller, &target)?;

        conn.transaction::<_, ApiError, _>(move |conn| {
            Box::pin(async move {
                // Appointments keep pointing at the barber row, so it is retired instead of removed.
                diesel::update(barbeiros::table.filter(barbeiros::user_id.eq(user_id)))
                    .set((barbeiros::active.eq(false), barbeiros::user_id.eq(None::<Uuid>)))
                    .execute(conn)
                    .await?;
                diesel::delete(usuarios::table.find(user_id)).execute(conn).await?;
                Ok(())
            })
        })
        .await?;

        self.auth.delete_user(user_id).await?;
        info!("User {} deleted by {}", user_id, caller.user_id);
        Ok(())
    }

    pub async fn reset_password(&self, caller: &Caller, user_id: Uuid) -> ApiResult<PasswordReset> {
        let mut conn = self.pool.get().await?;
        let target = find_user(&mut conn, user_id).await?;
        authorize_on_user(caller, &target)?;

        let temporary_password = generate_password();
        self.auth.update_password(user_id, &temporary_password).await?;
        info!("Password of user {} reset by {}", user_id, caller.user_id);

        Ok(PasswordReset { user_id, temporary_password })
    }

    pub async fn list_establishments(&self, caller: &Caller) -> ApiResult<Vec<EstablishmentSummary>> {
        caller.require_super_admin()?;
        let mut conn = self.pool.get().await?;
        let rows = establishments::table
            .order(establishments::created_at.desc())
            .load::<Establishment>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(EstablishmentSummary::from).collect())
    }

    pub async fn set_active(&self, caller: &Caller, establishment_id: Uuid, active: bool) -> ApiResult<EstablishmentSummary> {
        caller.require_super_admin()?;
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(establishments::table.find(establishment_id))
            .set((establishments::active.eq(active), establishments::updated_at.eq(Utc::now())))
            .get_result::<Establishment>(&mut conn)
            .await?;

        info!("Establishment {} active={} (by {})", establishment_id, active, caller.user_id);
        Ok(updated.into())
    }

    /// Grants `days` of access on top of whatever is left, without a payment.
    pub async fn extend_subscription(&self, caller: &Caller, establishment_id: Uuid, days: i64) -> ApiResult<SubscriptionChangedData> {
        caller.require_super_admin()?;
        if days <= 0 || days > MAX_EXTENSION_DAYS {
            return Err(ApiError::BadRequest(format!("days must be between 1 and {}", MAX_EXTENSION_DAYS)));
        }

        let mut conn = self.pool.get().await?;
        let data = conn
            .transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    establishments::table
                        .find(establishment_id)
                        .select(establishments::id)
                        .first::<Uuid>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| ApiError::NotFound("Establishment not found".to_string()))?;

                    let now = Utc::now();
                    let existing = store::subscription_for_update(conn, establishment_id).await?;
                    let expires_at = next_expiry(now, existing.as_ref().and_then(|s| s.expires_at), days);

                    let subscription = match existing {
                        Some(subscription) => {
                            diesel::update(subscriptions::table.find(subscription.id))
                                .set((
                                    subscriptions::status.eq(SubscriptionStatus::Active.as_str()),
                                    subscriptions::expires_at.eq(Some(expires_at)),
                                    subscriptions::retry_count.eq(0),
                                    subscriptions::updated_at.eq(now),
                                ))
                                .get_result::<Subscription>(conn)
                                .await?
                        }
                        None => {
                            let row = NewSubscription {
                                id: Uuid::new_v4(),
                                establishment_id,
                                plan_id: None,
                                status: SubscriptionStatus::Active.as_str().to_string(),
                                gateway: None,
                                external_id: None,
                                external_customer_id: None,
                                expires_at: Some(expires_at),
                                retry_count: 0,
                            };
                            diesel::insert_into(subscriptions::table)
                                .values(&row)
                                .get_result::<Subscription>(conn)
                                .await?
                        }
                    };
                    store::mirror_subscription(conn, establishment_id, SubscriptionStatus::Active, Some(expires_at)).await?;

                    let data = SubscriptionChangedData {
                        establishment_id,
                        subscription_id: subscription.id,
                        gateway: subscription.state()?.gateway,
                        status: SubscriptionStatus::Active,
                        expires_at: Some(expires_at),
                        retry_count: 0,
                        amount: None,
                        reason: Some(format!("manual extension of {} days", days)),
                    };
                    let event = DomainEvent::new(establishment_id, EventType::SubscriptionRenewed, &data)?;
                    outbox::enqueue(conn, &event).await?;
                    Ok(data)
                })
            })
            .await?;

        info!("Establishment {} extended by {} days until {:?}", establishment_id, days, data.expires_at);
        Ok(data)
    }

    async fn compensate(&self, user_id: Uuid) {
        if let Err(e) = self.auth.delete_user(user_id).await {
            error!("Failed to remove orphaned auth user {}: {}", user_id, e);
        }
    }
}

async fn find_user(conn: &mut AsyncPgConnection, user_id: Uuid) -> ApiResult<Usuario> {
    usuarios::table
        .find(user_id)
        .first::<Usuario>(conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

fn authorize_on_user(caller: &Caller, target: &Usuario) -> ApiResult<()> {
    let allowed = match target.establishment_id {
        Some(establishment_id) => caller.can_manage(establishment_id),
        None => caller.is_super_admin(),
    };
    if allowed {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Not allowed to manage this user".to_string()))
    }
}

async fn unique_slug(conn: &mut AsyncPgConnection, base: &str) -> QueryResult<String> {
    let taken = establishments::table
        .filter(establishments::slug.like(format!("{}%", base)))
        .select(establishments::slug)
        .load::<String>(conn)
        .await?;
    Ok(next_free_slug(base, &taken))
}

fn next_free_slug(base: &str, taken: &[String]) -> String {
    if !taken.iter().any(|s| s == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| format!("{}-{}", base, Uuid::new_v4().simple()))
}

/// Lowercase ASCII slug; Portuguese accents are folded.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let folded = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        };
        if folded.is_ascii_alphanumeric() {
            slug.push(folded);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "barbearia".to_string()
    } else {
        slug
    }
}

fn required(field: &str, value: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn validate_email(raw: &str) -> ApiResult<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(ApiError::BadRequest("email must be a valid e-mail address".to_string())),
    }
}

fn validate_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must have at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}
