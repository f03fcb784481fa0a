use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use shared::db::DbPool;
use shared::models::{Agendamento, Barbeiro, Establishment};
use shared::schema::{agendamentos, barbeiros, establishments};
use shared::AppointmentData;
use std::sync::Arc;
use tokio::time;
use tracing::{error, info};

use crate::templates;
use crate::whatsapp::WhatsappNotifier;

const BATCH_SIZE: i64 = 200;

pub struct ReminderScheduler {
    pool: DbPool,
    whatsapp: Arc<WhatsappNotifier>,
    lead: Duration,
    period: std::time::Duration,
}

/// Appointments in `(now, now + lead]` are due for a reminder.
pub fn reminder_window(now: DateTime<Utc>, lead: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    (now, now + lead)
}

impl ReminderScheduler {
    pub fn new(pool: DbPool, whatsapp: Arc<WhatsappNotifier>, lead_hours: i64, period: std::time::Duration) -> Self {
        Self { pool, whatsapp, lead: Duration::hours(lead_hours), period }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.period);

        loop {
            interval.tick().await;

            match self.send_due(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("Sent {} appointment reminders", count),
                Err(e) => error!("Error sending reminders: {}", e),
            }
        }
    }

    pub async fn send_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let (from, until) = reminder_window(now, self.lead);
        let mut conn = self.pool.get().await?;

        let due = agendamentos::table
            .inner_join(barbeiros::table)
            .inner_join(establishments::table)
            .filter(agendamentos::status.eq("scheduled"))
            .filter(agendamentos::reminder_sent.eq(false))
            .filter(agendamentos::starts_at.gt(from))
            .filter(agendamentos::starts_at.le(until))
            .order(agendamentos::starts_at.asc())
            .limit(BATCH_SIZE)
            .load::<(Agendamento, Barbeiro, Establishment)>(&mut conn)
            .await?;

        let mut sent = 0;
        for (appointment, barber, establishment) in due {
            // Claim before sending so a second instance cannot remind twice.
            let claimed = diesel::update(
                agendamentos::table
                    .filter(agendamentos::id.eq(appointment.id))
                    .filter(agendamentos::reminder_sent.eq(false)),
            )
            .set((agendamentos::reminder_sent.eq(true), agendamentos::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .await?;
            if claimed == 0 {
                continue;
            }

            let data = AppointmentData {
                appointment_id: appointment.id,
                establishment_id: establishment.id,
                establishment_name: establishment.name,
                barber_id: barber.id,
                barber_name: barber.name,
                client_name: appointment.client_name,
                client_phone: appointment.client_phone,
                service: appointment.service,
                starts_at: appointment.starts_at,
            };
            match self
                .whatsapp
                .notify(data.establishment_id, Some(data.appointment_id), &data.client_phone, &templates::reminder(&data))
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => error!("Reminder for appointment {} failed: {}", data.appointment_id, e),
            }
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_covers_lead_time_ahead() {
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let (from, until) = reminder_window(now, Duration::hours(24));

        assert_eq!(from, now);
        assert_eq!(until, Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap());
    }
}
