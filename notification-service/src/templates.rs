//! Message bodies. Times are shown in Brasília time (UTC-3, no DST).
//! E-mail HTML comes from the askama templates under `templates/emails`.

use anyhow::Result;
use askama::Template;
use chrono::{DateTime, FixedOffset, Utc};
use shared::{AccountProvisionedData, AppointmentData, EventType, SubscriptionChangedData};

const BRASILIA_OFFSET_SECS: i32 = 3 * 3600;
const TIME_FORMAT: &str = "%d/%m/%Y às %H:%M";

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub subject: String,
    pub html: String,
}

pub fn local_time(at: DateTime<Utc>) -> String {
    match FixedOffset::west_opt(BRASILIA_OFFSET_SECS) {
        Some(tz) => at.with_timezone(&tz).format(TIME_FORMAT).to_string(),
        None => at.format(TIME_FORMAT).to_string(),
    }
}

pub fn booking_confirmation(data: &AppointmentData) -> String {
    format!(
        "Olá, {}! Seu horário de {} com {} na {} está confirmado para {}.",
        data.client_name,
        data.service,
        data.barber_name,
        data.establishment_name,
        local_time(data.starts_at)
    )
}

pub fn booking_cancellation(data: &AppointmentData) -> String {
    format!(
        "Olá, {}. Seu horário de {} na {} em {} foi cancelado.",
        data.client_name,
        data.service,
        data.establishment_name,
        local_time(data.starts_at)
    )
}

pub fn reminder(data: &AppointmentData) -> String {
    format!(
        "Lembrete: {}, você tem {} com {} na {} em {}. Até lá!",
        data.client_name,
        data.service,
        data.barber_name,
        data.establishment_name,
        local_time(data.starts_at)
    )
}

#[derive(Template)]
#[template(path = "emails/welcome.html")]
struct WelcomeHtml<'a> {
    owner_name: &'a str,
    establishment_name: &'a str,
    trial_ends_at: String,
}

#[derive(Template)]
#[template(path = "emails/renewed.html")]
struct RenewedHtml<'a> {
    establishment_name: &'a str,
    amount: Option<String>,
    until: String,
}

#[derive(Template)]
#[template(path = "emails/payment_failed.html")]
struct PaymentFailedHtml<'a> {
    establishment_name: &'a str,
    retry_count: i32,
    reason: Option<&'a str>,
}

#[derive(Template)]
#[template(path = "emails/suspended.html")]
struct SuspendedHtml<'a> {
    establishment_name: &'a str,
}

#[derive(Template)]
#[template(path = "emails/cancelled.html")]
struct CancelledHtml<'a> {
    establishment_name: &'a str,
}

#[derive(Template)]
#[template(path = "emails/expired.html")]
struct ExpiredHtml<'a> {
    establishment_name: &'a str,
    until: String,
}

pub fn welcome_email(data: &AccountProvisionedData) -> Result<Email> {
    let html = WelcomeHtml {
        owner_name: &data.owner_name,
        establishment_name: &data.establishment_name,
        trial_ends_at: local_time(data.trial_ends_at),
    }
    .render()?;
    Ok(Email { subject: format!("Bem-vindo! {} está pronta", data.establishment_name), html })
}

/// Notice to the owners; `None` for events that do not concern them.
pub fn billing_email(event_type: EventType, establishment_name: &str, data: &SubscriptionChangedData) -> Result<Option<Email>> {
    let until = data.expires_at.map(local_time).unwrap_or_else(|| "-".to_string());
    let (subject, html) = match event_type {
        EventType::SubscriptionRenewed => (
            format!("Assinatura renovada: {}", establishment_name),
            RenewedHtml { establishment_name, amount: data.amount.map(|a| format!("{:.2}", a)), until }.render()?,
        ),
        EventType::PaymentFailed => (
            format!("Falha no pagamento: {}", establishment_name),
            PaymentFailedHtml { establishment_name, retry_count: data.retry_count, reason: data.reason.as_deref() }
                .render()?,
        ),
        EventType::SubscriptionSuspended => (
            format!("Assinatura suspensa: {}", establishment_name),
            SuspendedHtml { establishment_name }.render()?,
        ),
        EventType::SubscriptionCancelled => (
            format!("Assinatura cancelada: {}", establishment_name),
            CancelledHtml { establishment_name }.render()?,
        ),
        EventType::SubscriptionExpired => (
            format!("Assinatura expirada: {}", establishment_name),
            ExpiredHtml { establishment_name, until }.render()?,
        ),
        _ => return Ok(None),
    };
    Ok(Some(Email { subject, html }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared::SubscriptionStatus;
    use uuid::Uuid;

    fn appointment() -> AppointmentData {
        AppointmentData {
            appointment_id: Uuid::new_v4(),
            establishment_id: Uuid::new_v4(),
            establishment_name: "Barbearia Central".to_string(),
            barber_id: Uuid::new_v4(),
            barber_name: "Carlos".to_string(),
            client_name: "João".to_string(),
            client_phone: "5511987654321".to_string(),
            service: "Corte".to_string(),
            starts_at: Utc.with_ymd_and_hms(2024, 6, 3, 17, 30, 0).unwrap(),
        }
    }

    fn changed(retry_count: i32) -> SubscriptionChangedData {
        SubscriptionChangedData {
            establishment_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            gateway: None,
            status: SubscriptionStatus::PastDue,
            expires_at: Some(Utc.with_ymd_and_hms(2024, 7, 1, 3, 0, 0).unwrap()),
            retry_count,
            amount: Some(79.9),
            reason: Some("cc_rejected_insufficient_amount".to_string()),
        }
    }

    #[test]
    fn times_are_rendered_in_brasilia() {
        assert_eq!(local_time(Utc.with_ymd_and_hms(2024, 6, 3, 17, 30, 0).unwrap()), "03/06/2024 às 14:30");
    }

    #[test]
    fn confirmation_mentions_service_barber_and_time() {
        let text = booking_confirmation(&appointment());
        assert!(text.contains("João"));
        assert!(text.contains("Corte com Carlos"));
        assert!(text.contains("03/06/2024 às 14:30"));
    }

    #[test]
    fn failed_payment_email_carries_attempt_and_reason() {
        let email = billing_email(EventType::PaymentFailed, "Barbearia Central", &changed(2)).unwrap().unwrap();
        assert!(email.subject.contains("Falha no pagamento"));
        assert!(email.html.contains("tentativa 2: cc_rejected_insufficient_amount"));
    }

    #[test]
    fn renewal_email_shows_amount_and_expiry() {
        let email = billing_email(EventType::SubscriptionRenewed, "Barbearia Central", &changed(0)).unwrap().unwrap();
        assert!(email.html.contains("R$ 79.90"));
        assert!(email.html.contains("às 00:00"));
    }

    #[test]
    fn non_billing_events_produce_no_email() {
        assert!(billing_email(EventType::AppointmentBooked, "Barbearia Central", &changed(0)).unwrap().is_none());
    }

    #[test]
    fn markup_in_names_is_escaped() {
        let data = AccountProvisionedData {
            establishment_id: Uuid::new_v4(),
            establishment_name: r#"<a href="https://evil.example">Clique</a>"#.to_string(),
            owner_id: Uuid::new_v4(),
            owner_name: "<img src=x>".to_string(),
            email: "dono@example.com".to_string(),
            trial_ends_at: Utc.with_ymd_and_hms(2024, 6, 10, 15, 0, 0).unwrap(),
        };

        let email = welcome_email(&data).unwrap();
        assert!(!email.html.contains("<img"));
        assert!(!email.html.contains("<a href"));
        assert!(email.html.contains("&lt;img src=x&gt;"));

        let billing = billing_email(EventType::SubscriptionCancelled, "<b>Bar</b>", &changed(0)).unwrap().unwrap();
        assert!(!billing.html.contains("<b>Bar"));
    }
}
