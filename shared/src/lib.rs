use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

pub mod auth;
pub mod billing;
pub mod db;
pub mod error;
pub mod extract;
pub mod models;
pub mod outbox;
pub mod phone;
pub mod schema;
pub mod signature;
pub mod store;
pub mod telemetry;

pub use billing::{Gateway, SubscriptionStatus};
pub use error::ApiError;

/// Topic every service publishes domain events to.
pub const EVENTS_TOPIC: &str = "barbershop-events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    AccountProvisioned,
    BarberCreated,
    SubscriptionRenewed,
    PaymentFailed,
    SubscriptionSuspended,
    SubscriptionCancelled,
    SubscriptionExpired,
    AppointmentBooked,
    AppointmentCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AccountProvisioned => "AccountProvisioned",
            EventType::BarberCreated => "BarberCreated",
            EventType::SubscriptionRenewed => "SubscriptionRenewed",
            EventType::PaymentFailed => "PaymentFailed",
            EventType::SubscriptionSuspended => "SubscriptionSuspended",
            EventType::SubscriptionCancelled => "SubscriptionCancelled",
            EventType::SubscriptionExpired => "SubscriptionExpired",
            EventType::AppointmentBooked => "AppointmentBooked",
            EventType::AppointmentCancelled => "AppointmentCancelled",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "AccountProvisioned" => EventType::AccountProvisioned,
            "BarberCreated" => EventType::BarberCreated,
            "SubscriptionRenewed" => EventType::SubscriptionRenewed,
            "PaymentFailed" => EventType::PaymentFailed,
            "SubscriptionSuspended" => EventType::SubscriptionSuspended,
            "SubscriptionCancelled" => EventType::SubscriptionCancelled,
            "SubscriptionExpired" => EventType::SubscriptionExpired,
            "AppointmentBooked" => EventType::AppointmentBooked,
            "AppointmentCancelled" => EventType::AppointmentCancelled,
            other => return Err(anyhow::anyhow!("Unknown event type: {}", other)),
        };
        Ok(event_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProvisionedData {
    pub establishment_id: Uuid,
    pub establishment_name: String,
    pub owner_id: Uuid,
    pub owner_name: String,
    pub email: String,
    pub trial_ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarberCreatedData {
    pub establishment_id: Uuid,
    pub barber_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionChangedData {
    pub establishment_id: Uuid,
    pub subscription_id: Uuid,
    pub gateway: Option<Gateway>,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub amount: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentData {
    pub appointment_id: Uuid,
    pub establishment_id: Uuid,
    pub establishment_name: String,
    pub barber_id: Uuid,
    pub barber_name: String,
    pub client_name: String,
    pub client_phone: String,
    pub service: String,
    pub starts_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new<T: Serialize>(aggregate_id: Uuid, event_type: EventType, data: &T) -> anyhow::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id,
            event_type,
            payload: serde_json::to_value(data)?,
            created_at: Utc::now(),
        })
    }

    pub fn data<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_its_name() {
        for event_type in [
            EventType::AccountProvisioned,
            EventType::PaymentFailed,
            EventType::AppointmentCancelled,
        ] {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("OrderCreated".parse::<EventType>().is_err());
    }

    #[test]
    fn domain_event_carries_typed_payload() {
        let establishment_id = Uuid::new_v4();
        let data = BarberCreatedData {
            establishment_id,
            barber_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Joao".to_string(),
            email: "joao@example.com".to_string(),
        };
        let event = DomainEvent::new(establishment_id, EventType::BarberCreated, &data).unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let decoded: DomainEvent = serde_json::from_str(&json).unwrap();
        let payload: BarberCreatedData = decoded.data().unwrap();

        assert_eq!(decoded.aggregate_id, establishment_id);
        assert_eq!(payload.barber_id, data.barber_id);
    }
}
