use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::billing::{Gateway, SubscriptionState, SubscriptionStatus};
use crate::DomainEvent;

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::establishments)]
pub struct Establishment {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub phone: Option<String>,
    pub active: bool,
    pub subscription_status: String,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::establishments)]
pub struct NewEstablishment {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub phone: Option<String>,
    pub active: bool,
    pub subscription_status: String,
    pub subscription_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::saas_plans)]
pub struct SaasPlan {
    pub id: Uuid,
    pub name: String,
    pub price: bigdecimal::BigDecimal,
    pub interval_days: i32,
    pub iugu_plan_identifier: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::subscriptions)]
pub struct Subscription {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: String,
    pub gateway: Option<String>,
    pub external_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::subscriptions)]
pub struct NewSubscription {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: String,
    pub gateway: Option<String>,
    pub external_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

impl Subscription {
    pub fn state(&self) -> anyhow::Result<SubscriptionState> {
        Ok(SubscriptionState {
            status: self.status.parse()?,
            gateway: self.gateway.as_deref().map(str::parse::<Gateway>).transpose()?,
            expires_at: self.expires_at,
            retry_count: self.retry_count,
        })
    }

    pub fn status(&self) -> anyhow::Result<SubscriptionStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Insertable, Serialize)]
#[diesel(table_name = crate::schema::saas_payments)]
pub struct NewSaasPayment {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub establishment_id: Uuid,
    pub gateway: String,
    pub external_payment_id: String,
    pub amount: bigdecimal::BigDecimal,
    pub status: String,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::usuarios)]
pub struct Usuario {
    pub id: Uuid,
    pub establishment_id: Option<Uuid>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::usuarios)]
pub struct NewUsuario {
    pub id: Uuid,
    pub establishment_id: Option<Uuid>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::barbeiros)]
pub struct Barbeiro {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub phone: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::barbeiros)]
pub struct NewBarbeiro {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub phone: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::agendamentos)]
pub struct Agendamento {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub barber_id: Uuid,
    pub client_name: String,
    pub client_phone: String,
    pub service: String,
    pub price: Option<bigdecimal::BigDecimal>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: String,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::agendamentos)]
pub struct NewAgendamento {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub barber_id: Uuid,
    pub client_name: String,
    pub client_phone: String,
    pub service: String,
    pub price: Option<bigdecimal::BigDecimal>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::whatsapp_config)]
pub struct WhatsappConfig {
    pub establishment_id: Uuid,
    pub enabled: bool,
    pub api_url: String,
    pub instance: String,
    pub api_token: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::whatsapp_logs)]
pub struct NewWhatsappLog {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub phone: String,
    pub message: String,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

impl TryFrom<&DomainEvent> for NewOutboxEvent {
    type Error = anyhow::Error;

    fn try_from(event: &DomainEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.as_str().to_string(),
            event_data: serde_json::to_value(event)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_webhooks)]
pub struct ProcessedWebhook {
    pub gateway: String,
    pub event_key: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct ProcessedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BarberCreatedData, EventType};

    #[test]
    fn subscription_row_maps_to_state() {
        let now = Utc::now();
        let row = Subscription {
            id: Uuid::new_v4(),
            establishment_id: Uuid::new_v4(),
            plan_id: None,
            status: "past_due".to_string(),
            gateway: Some("iugu".to_string()),
            external_id: Some("sub_123".to_string()),
            external_customer_id: None,
            expires_at: Some(now),
            retry_count: 2,
            last_payment_at: None,
            created_at: now,
            updated_at: now,
        };

        let state = row.state().unwrap();
        assert_eq!(state.status, SubscriptionStatus::PastDue);
        assert_eq!(state.gateway, Some(Gateway::Iugu));
        assert_eq!(state.retry_count, 2);
    }

    #[test]
    fn outbox_row_stores_whole_event() {
        let aggregate_id = Uuid::new_v4();
        let data = BarberCreatedData {
            establishment_id: aggregate_id,
            barber_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Pedro".to_string(),
            email: "pedro@example.com".to_string(),
        };
        let event = DomainEvent::new(aggregate_id, EventType::BarberCreated, &data).unwrap();

        let row = NewOutboxEvent::try_from(&event).unwrap();
        let decoded: DomainEvent = serde_json::from_value(row.event_data).unwrap();

        assert_eq!(row.event_type, "BarberCreated");
        assert_eq!(decoded.id, event.id);
    }
}
