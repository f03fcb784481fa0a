use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use shared::auth::Role;
use shared::db::DbPool;
use shared::models::ProcessedEvent;
use shared::schema::{establishments, processed_events, usuarios};
use shared::{AccountProvisionedData, AppointmentData, DomainEvent, EventType, SubscriptionChangedData};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::email::EmailSender;
use crate::templates;
use crate::whatsapp::WhatsappNotifier;

/// Delay between attempts at an event that failed to deliver.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(60) }
    }
}

/// Runs `attempt` until it succeeds, doubling the delay up to `backoff.max`.
pub async fn retry_with_backoff<T, F, Fut>(backoff: Backoff, what: &str, mut attempt: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return value,
            Err(e) => {
                error!("Attempt {} at {} failed, retrying in {:?}: {}", attempts, what, delay, e);
                time::sleep(delay).await;
                delay = (delay * 2).min(backoff.max);
            }
        }
    }
}

/// What an event asks this service to send.
#[derive(Debug, Clone)]
pub enum Notification {
    Booked(AppointmentData),
    Cancelled(AppointmentData),
    Welcome(AccountProvisionedData),
    Billing(EventType, SubscriptionChangedData),
    Nothing,
}

impl Notification {
    /// Fails only on a payload that will never decode.
    pub fn from_event(event: &DomainEvent) -> Result<Self> {
        let notification = match event.event_type {
            EventType::AppointmentBooked => Notification::Booked(event.data()?),
            EventType::AppointmentCancelled => Notification::Cancelled(event.data()?),
            EventType::AccountProvisioned => Notification::Welcome(event.data()?),
            EventType::SubscriptionRenewed
            | EventType::PaymentFailed
            | EventType::SubscriptionSuspended
            | EventType::SubscriptionCancelled
            | EventType::SubscriptionExpired => Notification::Billing(event.event_type, event.data()?),
            EventType::BarberCreated => Notification::Nothing,
        };
        Ok(notification)
    }
}

pub struct EventHandler {
    pool: DbPool,
    whatsapp: Arc<WhatsappNotifier>,
    email: Arc<dyn EmailSender>,
    backoff: Backoff,
}

impl EventHandler {
    pub fn new(pool: DbPool, whatsapp: Arc<WhatsappNotifier>, email: Arc<dyn EmailSender>) -> Self {
        Self { pool, whatsapp, email, backoff: Backoff::default() }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<DomainEvent>(json_str) {
                                Ok(event) => self.handle_until_done(&event).await,
                                Err(e) => warn!("Skipping malformed event: {}", e),
                            },
                            Err(e) => error!("Error parsing payload: {}", e),
                        }
                    }
                    // Reached only once the event is handled or can never be.
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_until_done(&self, event: &DomainEvent) {
        let notification = match Notification::from_event(event) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Skipping event {} with a malformed {} payload: {}", event.id, event.event_type.as_str(), e);
                return;
            }
        };
        let notification = &notification;
        let what = format!("event {} ({})", event.id, event.event_type.as_str());
        retry_with_backoff(self.backoff, &what, move || self.handle_event(event, notification)).await
    }

    pub async fn handle_event(&self, event: &DomainEvent, notification: &Notification) -> Result<()> {
        let mut conn = self.pool.get().await?;

        if self.already_processed(&mut conn, event.id).await? {
            info!("Event {} already processed, skipping", event.id);
            return Ok(());
        }
        // Release the connection while talking to external APIs.
        drop(conn);

        self.deliver(notification).await?;

        let mut conn = self.pool.get().await?;
        self.mark_processed(&mut conn, event).await?;
        Ok(())
    }

    pub async fn deliver(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::Booked(data) => {
                self.whatsapp
                    .notify(data.establishment_id, Some(data.appointment_id), &data.client_phone, &templates::booking_confirmation(data))
                    .await?;
            }
            Notification::Cancelled(data) => {
                self.whatsapp
                    .notify(data.establishment_id, Some(data.appointment_id), &data.client_phone, &templates::booking_cancellation(data))
                    .await?;
            }
            Notification::Welcome(data) => {
                self.email.send(&data.email, &templates::welcome_email(data)?).await?;
            }
            Notification::Billing(event_type, data) => {
                self.notify_owners(*event_type, data).await?;
            }
            Notification::Nothing => debug!("Nothing to notify"),
        }
        Ok(())
    }

    async fn notify_owners(&self, event_type: EventType, data: &SubscriptionChangedData) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let name = establishments::table
            .find(data.establishment_id)
            .select(establishments::name)
            .first::<String>(&mut conn)
            .await?;
        let owners = usuarios::table
            .filter(usuarios::establishment_id.eq(data.establishment_id))
            .filter(usuarios::role.eq(Role::Owner.as_str()))
            .select(usuarios::email)
            .load::<String>(&mut conn)
            .await?;
        drop(conn);

        let Some(email) = templates::billing_email(event_type, &name, data)? else {
            return Ok(());
        };
        if owners.is_empty() {
            warn!("Establishment {} has no owner to notify", data.establishment_id);
        }
        let mut failed = 0;
        for owner in &owners {
            if let Err(e) = self.email.send(owner, &email).await {
                error!("Failed to e-mail {} about {}: {}", owner, event_type.as_str(), e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(anyhow::anyhow!("{} of {} owner e-mails failed", failed, owners.len()));
        }
        Ok(())
    }

    async fn already_processed(&self, conn: &mut AsyncPgConnection, event_id: Uuid) -> Result<bool> {
        let existing = processed_events::table
            .find(event_id)
            .first::<ProcessedEvent>(conn)
            .await
            .optional()?;
        Ok(existing.is_some())
    }

    async fn mark_processed(&self, conn: &mut AsyncPgConnection, event: &DomainEvent) -> Result<()> {
        let processed = ProcessedEvent {
            event_id: event.id,
            event_type: event.event_type.as_str().to_string(),
            processed_at: Some(chrono::Utc::now()),
        };

        diesel::insert_into(processed_events::table)
            .values(&processed)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;

        Ok(())
    }
}
