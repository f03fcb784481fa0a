use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use shared::auth::Caller;
use shared::billing::DunningPolicy;
use shared::db::DbPool;
use shared::error::{ApiError, ApiResult};
use shared::models::*;
use shared::phone::normalize_whatsapp;
use shared::schema::*;
use shared::{outbox, AppointmentData, DomainEvent, EventType};
use tracing::info;
use uuid::Uuid;

pub const STATUS_SCHEDULED: &str = "scheduled";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const MAX_DURATION_MINUTES: i64 = 8 * 60;

#[derive(Debug, Deserialize)]
pub struct BookingInput {
    pub establishment_id: Uuid,
    pub barber_id: Uuid,
    pub client_name: String,
    pub client_phone: String,
    pub service: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub price: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct AppointmentView {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub barber_id: Uuid,
    pub client_name: String,
    pub client_phone: String,
    pub service: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: String,
}

impl From<Agendamento> for AppointmentView {
    fn from(a: Agendamento) -> Self {
        Self {
            id: a.id,
            establishment_id: a.establishment_id,
            barber_id: a.barber_id,
            client_name: a.client_name,
            client_phone: a.client_phone,
            service: a.service,
            starts_at: a.starts_at,
            ends_at: a.ends_at,
            status: a.status,
        }
    }
}

/// Half-open interval `[starts_at, ends_at)` a barber is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl Slot {
    pub fn new(starts_at: DateTime<Utc>, duration_minutes: i64, now: DateTime<Utc>) -> ApiResult<Self> {
        if duration_minutes <= 0 || duration_minutes > MAX_DURATION_MINUTES {
            return Err(ApiError::BadRequest(format!(
                "duration_minutes must be between 1 and {}",
                MAX_DURATION_MINUTES
            )));
        }
        if starts_at <= now {
            return Err(ApiError::BadRequest("starts_at must be in the future".to_string()));
        }
        Ok(Self { starts_at, ends_at: starts_at + Duration::minutes(duration_minutes) })
    }

    /// Back-to-back appointments do not overlap.
    pub fn overlaps(&self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> bool {
        self.starts_at < ends_at && starts_at < self.ends_at
    }
}

pub struct BookingService {
    pool: DbPool,
    policy: DunningPolicy,
}

impl BookingService {
    pub fn new(pool: DbPool, policy: DunningPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn book(&self, input: BookingInput) -> ApiResult<AppointmentView> {
        let now = Utc::now();
        let slot = Slot::new(input.starts_at, input.duration_minutes, now)?;
        let client_name = input.client_name.trim().to_string();
        let service = input.service.trim().to_string();
        if client_name.is_empty() || service.is_empty() {
            return Err(ApiError::BadRequest("client_name and service are required".to_string()));
        }
        let client_phone = normalize_whatsapp(&input.client_phone)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid phone number: {}", input.client_phone)))?;
        let price = match input.price {
            Some(p) if p < 0.0 => return Err(ApiError::BadRequest("price cannot be negative".to_string())),
            Some(p) => BigDecimal::from_f64(p).map(|d| d.with_scale(2)),
            None => None,
        };

        let policy = self.policy;
        let mut conn = self.pool.get().await?;
        let booked = conn
            .transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    let establishment = establishments::table
                        .find(input.establishment_id)
                        .first::<Establishment>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| ApiError::NotFound("Establishment not found".to_string()))?;
                    if !establishment.active {
                        return Err(ApiError::PaymentRequired("Establishment is not accepting bookings".to_string()));
                    }
                    let subscription = subscriptions::table
                        .filter(subscriptions::establishment_id.eq(establishment.id))
                        .first::<Subscription>(conn)
                        .await
                        .optional()?;
                    let has_access = match &subscription {
                        Some(s) => s.state()?.has_access(now, &policy),
                        None => false,
                    };
                    if !has_access {
                        return Err(ApiError::PaymentRequired("Establishment subscription is not active".to_string()));
                    }

                    // Concurrent bookings for the same barber queue here.
                    let barber = barbeiros::table
                        .filter(barbeiros::id.eq(input.barber_id))
                        .filter(barbeiros::establishment_id.eq(establishment.id))
                        .filter(barbeiros::active.eq(true))
                        .for_update()
                        .first::<Barbeiro>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| ApiError::NotFound("Barber not found".to_string()))?;

                    let nearby = agendamentos::table
                        .filter(agendamentos::barber_id.eq(barber.id))
                        .filter(agendamentos::status.ne(STATUS_CANCELLED))
                        .filter(agendamentos::starts_at.lt(slot.ends_at))
                        .filter(agendamentos::ends_at.gt(slot.starts_at))
                        .select((agendamentos::starts_at, agendamentos::ends_at))
                        .load::<(DateTime<Utc>, DateTime<Utc>)>(conn)
                        .await?;
                    if nearby.iter().any(|(s, e)| slot.overlaps(*s, *e)) {
                        return Err(ApiError::Conflict("Barber already has an appointment at this time".to_string()));
                    }

                    let row = NewAgendamento {
                        id: Uuid::new_v4(),
                        establishment_id: establishment.id,
                        barber_id: barber.id,
                        client_name,
                        client_phone,
                        service,
                        price,
                        starts_at: slot.starts_at,
                        ends_at: slot.ends_at,
                        status: STATUS_SCHEDULED.to_string(),
                    };
                    let appointment = diesel::insert_into(agendamentos::table)
                        .values(&row)
                        .get_result::<Agendamento>(conn)
                        .await?;

                    let event = DomainEvent::new(
                        establishment.id,
                        EventType::AppointmentBooked,
                        &event_data(&appointment, &establishment, &barber),
                    )?;
                    outbox::enqueue(conn, &event).await?;
                    Ok(appointment)
                })
            })
            .await?;

        info!("Appointment {} booked with barber {} at {}", booked.id, booked.barber_id, booked.starts_at);
        Ok(booked.into())
    }

    pub async fn cancel(&self, caller: &Caller, appointment_id: Uuid) -> ApiResult<AppointmentView> {
        let caller = caller.clone();
        let mut conn = self.pool.get().await?;
        let cancelled = conn
            .transaction::<_, ApiError, _>(move |conn| {
                Box::pin(async move {
                    let appointment = agendamentos::table
                        .find(appointment_id)
                        .for_update()
                        .first::<Agendamento>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| ApiError::NotFound("Appointment not found".to_string()))?;
                    if !caller.works_at(appointment.establishment_id) {
                        return Err(ApiError::Forbidden("Not a member of this establishment".to_string()));
                    }
                    if appointment.status == STATUS_CANCELLED {
                        return Ok(appointment);
                    }

                    let updated = diesel::update(agendamentos::table.find(appointment.id))
                        .set((
                            agendamentos::status.eq(STATUS_CANCELLED),
                            agendamentos::updated_at.eq(Utc::now()),
                        ))
                        .get_result::<Agendamento>(conn)
                        .await?;

                    let establishment = establishments::table
                        .find(updated.establishment_id)
                        .first::<Establishment>(conn)
                        .await?;
                    let barber = barbeiros::table.find(updated.barber_id).first::<Barbeiro>(conn).await?;
                    let event = DomainEvent::new(
                        establishment.id,
                        EventType::AppointmentCancelled,
                        &event_data(&updated, &establishment, &barber),
                    )?;
                    outbox::enqueue(conn, &event).await?;
                    Ok(updated)
                })
            })
            .await?;

        info!("Appointment {} cancelled", cancelled.id);
        Ok(cancelled.into())
    }
}

fn event_data(appointment: &Agendamento, establishment: &Establishment, barber: &Barbeiro) -> AppointmentData {
    AppointmentData {
        appointment_id: appointment.id,
        establishment_id: establishment.id,
        establishment_name: establishment.name.clone(),
        barber_id: barber.id,
        barber_name: barber.name.clone(),
        client_name: appointment.client_name.clone(),
        client_phone: appointment.client_phone.clone(),
        service: appointment.service.clone(),
        starts_at: appointment.starts_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, hour, minute, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn slot_spans_the_requested_duration() {
        let slot = Slot::new(at(14, 0), 45, now()).unwrap();
        assert_eq!(slot.ends_at, at(14, 45));
    }

    #[test]
    fn slot_rejects_past_start_and_bad_duration() {
        assert!(matches!(Slot::new(now(), 30, now()), Err(ApiError::BadRequest(_))));
        assert!(matches!(Slot::new(at(14, 0), 0, now()), Err(ApiError::BadRequest(_))));
        assert!(matches!(Slot::new(at(14, 0), -15, now()), Err(ApiError::BadRequest(_))));
        assert!(matches!(Slot::new(at(14, 0), MAX_DURATION_MINUTES + 1, now()), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn overlapping_appointments_conflict() {
        let slot = Slot::new(at(14, 0), 60, now()).unwrap();

        assert!(slot.overlaps(at(13, 30), at(14, 30)));
        assert!(slot.overlaps(at(14, 15), at(14, 45)));
        assert!(slot.overlaps(at(13, 0), at(16, 0)));
    }

    #[test]
    fn back_to_back_appointments_do_not_conflict() {
        let slot = Slot::new(at(14, 0), 60, now()).unwrap();

        assert!(!slot.overlaps(at(13, 0), at(14, 0)));
        assert!(!slot.overlaps(at(15, 0), at(15, 30)));
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected_before_touching_the_store() {
        let service = BookingService::new(shared::db::lazy_pool("postgres://localhost/unused"), DunningPolicy::default());
        let result = service
            .book(BookingInput {
                establishment_id: Uuid::new_v4(),
                barber_id: Uuid::new_v4(),
                client_name: "João".to_string(),
                client_phone: "123".to_string(),
                service: "Corte".to_string(),
                starts_at: Utc::now() + Duration::days(1),
                duration_minutes: 30,
                price: Some(45.0),
            })
            .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
