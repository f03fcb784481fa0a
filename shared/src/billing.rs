//! Subscription state machine shared by the gateway webhooks, the expiry
//! sweep and the super-admin extension endpoint.
//!
//! Everything here is pure: callers load the row, call [`SubscriptionState::apply`]
//! and persist whatever [`Transition`] comes back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    MercadoPago,
    Iugu,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::MercadoPago => "mercadopago",
            Gateway::Iugu => "iugu",
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Gateway {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mercadopago" => Ok(Gateway::MercadoPago),
            "iugu" => Ok(Gateway::Iugu),
            other => Err(anyhow::anyhow!("Unknown gateway: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Pending,
    Active,
    PastDue,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Whether a tenant in this status may keep taking bookings.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "trial" => SubscriptionStatus::Trial,
            "pending" => SubscriptionStatus::Pending,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "suspended" => SubscriptionStatus::Suspended,
            "cancelled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            other => return Err(anyhow::anyhow!("Unknown subscription status: {}", other)),
        };
        Ok(status)
    }
}

/// What a gateway reported about a charge or a recurring subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Succeeded { amount: f64, paid_at: DateTime<Utc> },
    Failed { reason: String },
    Suspended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DunningPolicy {
    /// Consecutive failures after which the subscription is suspended.
    pub max_retries: i32,
    /// Days past expiry before the sweep marks a subscription expired.
    pub grace_days: i64,
}

impl Default for DunningPolicy {
    fn default() -> Self {
        Self { max_retries: 3, grace_days: 3 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub gateway: Option<Gateway>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionEffect {
    Renewed { expires_at: DateTime<Utc> },
    RetryScheduled { attempt: i32 },
    Suspended,
    Cancelled,
    Ignored { reason: &'static str },
}

impl TransitionEffect {
    /// Event to enqueue for this effect, if any.
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            TransitionEffect::Renewed { .. } => Some(EventType::SubscriptionRenewed),
            TransitionEffect::RetryScheduled { .. } => Some(EventType::PaymentFailed),
            TransitionEffect::Suspended => Some(EventType::SubscriptionSuspended),
            TransitionEffect::Cancelled => Some(EventType::SubscriptionCancelled),
            TransitionEffect::Ignored { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SubscriptionState,
    pub effect: TransitionEffect,
}

/// Extends from the later of `now` and the current expiry.
pub fn next_expiry(now: DateTime<Utc>, current: Option<DateTime<Utc>>, interval_days: i64) -> DateTime<Utc> {
    let base = match current {
        Some(current) if current > now => current,
        _ => now,
    };
    base + Duration::days(interval_days)
}

impl SubscriptionState {
    pub fn apply(
        &self,
        outcome: &PaymentOutcome,
        gateway: Gateway,
        now: DateTime<Utc>,
        interval_days: i64,
        policy: &DunningPolicy,
    ) -> Transition {
        let from_billing_gateway = self.gateway == Some(gateway);

        match outcome {
            PaymentOutcome::Succeeded { .. } => {
                let expires_at = next_expiry(now, self.expires_at, interval_days);
                Transition {
                    next: SubscriptionState {
                        status: SubscriptionStatus::Active,
                        gateway: Some(gateway),
                        expires_at: Some(expires_at),
                        retry_count: 0,
                    },
                    effect: TransitionEffect::Renewed { expires_at },
                }
            }
            PaymentOutcome::Failed { .. } => {
                if !from_billing_gateway {
                    return self.ignore("failure reported by a gateway that does not bill this subscription");
                }
                if self.status == SubscriptionStatus::Cancelled {
                    return self.ignore("subscription already cancelled");
                }

                // Never paid: stays pending instead of entering dunning.
                let never_paid = self.expires_at.is_none();
                let attempt = self.retry_count + 1;
                let (status, effect) = if attempt >= policy.max_retries {
                    (SubscriptionStatus::Suspended, TransitionEffect::Suspended)
                } else if never_paid {
                    (SubscriptionStatus::Pending, TransitionEffect::RetryScheduled { attempt })
                } else {
                    (SubscriptionStatus::PastDue, TransitionEffect::RetryScheduled { attempt })
                };
                Transition {
                    next: SubscriptionState { status, retry_count: attempt, ..self.clone() },
                    effect,
                }
            }
            PaymentOutcome::Suspended => {
                if !from_billing_gateway {
                    return self.ignore("suspension reported by a gateway that does not bill this subscription");
                }
                if matches!(self.status, SubscriptionStatus::Suspended | SubscriptionStatus::Cancelled) {
                    return self.ignore("subscription already suspended or cancelled");
                }
                Transition {
                    next: SubscriptionState { status: SubscriptionStatus::Suspended, ..self.clone() },
                    effect: TransitionEffect::Suspended,
                }
            }
            PaymentOutcome::Cancelled => {
                if !from_billing_gateway {
                    return self.ignore("cancellation reported by a gateway that does not bill this subscription");
                }
                if self.status == SubscriptionStatus::Cancelled {
                    return self.ignore("subscription already cancelled");
                }
                Transition {
                    next: SubscriptionState { status: SubscriptionStatus::Cancelled, ..self.clone() },
                    effect: TransitionEffect::Cancelled,
                }
            }
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, policy: &DunningPolicy) -> bool {
        if !self.status.grants_access() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at + Duration::days(policy.grace_days) < now,
            None => false,
        }
    }

    /// Paying statuses keep access through the grace period; a cancelled
    /// subscription keeps it until the end of the period already paid for.
    /// Dunning without a paid period grants nothing.
    pub fn has_access(&self, now: DateTime<Utc>, policy: &DunningPolicy) -> bool {
        match self.status {
            SubscriptionStatus::Cancelled => self.expires_at.map_or(false, |expires_at| expires_at > now),
            SubscriptionStatus::PastDue if self.expires_at.is_none() => false,
            status if status.grants_access() => !self.is_expired(now, policy),
            _ => false,
        }
    }

    fn ignore(&self, reason: &'static str) -> Transition {
        Transition {
            next: self.clone(),
            effect: TransitionEffect::Ignored { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    fn active(gateway: Gateway, expires_at: DateTime<Utc>) -> SubscriptionState {
        SubscriptionState {
            status: SubscriptionStatus::Active,
            gateway: Some(gateway),
            expires_at: Some(expires_at),
            retry_count: 0,
        }
    }

    fn paid() -> PaymentOutcome {
        PaymentOutcome::Succeeded { amount: 49.9, paid_at: at(1) }
    }

    fn failed() -> PaymentOutcome {
        PaymentOutcome::Failed { reason: "cc_rejected_insufficient_amount".to_string() }
    }

    #[test]
    fn early_renewal_extends_from_current_expiry() {
        assert_eq!(next_expiry(at(1), Some(at(10)), 30), at(10) + Duration::days(30));
    }

    #[test]
    fn late_renewal_extends_from_now() {
        assert_eq!(next_expiry(at(20), Some(at(10)), 30), at(20) + Duration::days(30));
        assert_eq!(next_expiry(at(20), None, 30), at(20) + Duration::days(30));
    }

    #[test]
    fn success_activates_and_resets_retries() {
        let state = SubscriptionState {
            status: SubscriptionStatus::PastDue,
            gateway: Some(Gateway::Iugu),
            expires_at: Some(at(5)),
            retry_count: 2,
        };

        let transition = state.apply(&paid(), Gateway::Iugu, at(8), 30, &DunningPolicy::default());

        assert_eq!(transition.next.status, SubscriptionStatus::Active);
        assert_eq!(transition.next.retry_count, 0);
        assert_eq!(transition.next.expires_at, Some(at(8) + Duration::days(30)));
        assert_eq!(transition.effect.event_type(), Some(EventType::SubscriptionRenewed));
    }

    #[test]
    fn repeated_failures_walk_through_dunning_to_suspension() {
        let policy = DunningPolicy::default();
        let mut state = active(Gateway::MercadoPago, at(10));

        let first = state.apply(&failed(), Gateway::MercadoPago, at(10), 30, &policy);
        assert_eq!(first.effect, TransitionEffect::RetryScheduled { attempt: 1 });
        assert_eq!(first.next.status, SubscriptionStatus::PastDue);
        assert_eq!(first.next.expires_at, Some(at(10)));
        state = first.next;

        let second = state.apply(&failed(), Gateway::MercadoPago, at(11), 30, &policy);
        assert_eq!(second.effect, TransitionEffect::RetryScheduled { attempt: 2 });
        state = second.next;

        let third = state.apply(&failed(), Gateway::MercadoPago, at(12), 30, &policy);
        assert_eq!(third.effect, TransitionEffect::Suspended);
        assert_eq!(third.next.status, SubscriptionStatus::Suspended);
        assert_eq!(third.next.retry_count, 3);
    }

    #[test]
    fn suspended_subscription_reactivates_on_payment() {
        let state = SubscriptionState {
            status: SubscriptionStatus::Suspended,
            gateway: Some(Gateway::MercadoPago),
            expires_at: Some(at(2)),
            retry_count: 3,
        };

        let transition = state.apply(&paid(), Gateway::MercadoPago, at(15), 30, &DunningPolicy::default());

        assert_eq!(transition.next.status, SubscriptionStatus::Active);
        assert_eq!(transition.next.expires_at, Some(at(15) + Duration::days(30)));
    }

    #[test]
    fn other_gateway_cannot_demote_subscription() {
        let state = active(Gateway::Iugu, at(20));

        let failure = state.apply(&failed(), Gateway::MercadoPago, at(10), 30, &DunningPolicy::default());
        assert!(matches!(failure.effect, TransitionEffect::Ignored { .. }));
        assert_eq!(failure.next, state);

        let cancel = state.apply(&PaymentOutcome::Cancelled, Gateway::MercadoPago, at(10), 30, &DunningPolicy::default());
        assert!(matches!(cancel.effect, TransitionEffect::Ignored { .. }));
    }

    #[test]
    fn payment_from_other_gateway_takes_over_billing() {
        let state = active(Gateway::Iugu, at(20));

        let transition = state.apply(&paid(), Gateway::MercadoPago, at(10), 30, &DunningPolicy::default());

        assert_eq!(transition.next.gateway, Some(Gateway::MercadoPago));
        assert_eq!(transition.next.expires_at, Some(at(20) + Duration::days(30)));
    }

    #[test]
    fn cancellation_keeps_paid_period() {
        let state = active(Gateway::MercadoPago, at(25));

        let transition = state.apply(&PaymentOutcome::Cancelled, Gateway::MercadoPago, at(10), 30, &DunningPolicy::default());

        assert_eq!(transition.next.status, SubscriptionStatus::Cancelled);
        assert_eq!(transition.next.expires_at, Some(at(25)));

        let again = transition.next.apply(&failed(), Gateway::MercadoPago, at(11), 30, &DunningPolicy::default());
        assert!(matches!(again.effect, TransitionEffect::Ignored { .. }));
    }

    #[test]
    fn expiry_honours_grace_period_and_status() {
        let policy = DunningPolicy::default();
        let state = active(Gateway::Iugu, at(10));

        assert!(!state.is_expired(at(12), &policy));
        assert!(state.is_expired(at(14), &policy));

        let cancelled = SubscriptionState { status: SubscriptionStatus::Cancelled, ..state };
        assert!(!cancelled.is_expired(at(20), &policy));
    }

    #[test]
    fn cancelled_subscription_keeps_access_until_paid_period_ends() {
        let policy = DunningPolicy::default();
        let cancelled = SubscriptionState {
            status: SubscriptionStatus::Cancelled,
            ..active(Gateway::Iugu, at(20))
        };

        assert!(cancelled.has_access(at(19), &policy));
        assert!(!cancelled.has_access(at(21), &policy));
        assert!(active(Gateway::Iugu, at(20)).has_access(at(22), &policy));
        assert!(!active(Gateway::Iugu, at(20)).has_access(at(24), &policy));

        let suspended = SubscriptionState { status: SubscriptionStatus::Suspended, ..active(Gateway::Iugu, at(20)) };
        assert!(!suspended.has_access(at(1), &policy));
    }

    #[test]
    fn failed_first_charge_keeps_subscription_pending_without_access() {
        let policy = DunningPolicy::default();
        let pending = SubscriptionState {
            status: SubscriptionStatus::Pending,
            gateway: Some(Gateway::MercadoPago),
            expires_at: None,
            retry_count: 0,
        };
        assert!(!pending.has_access(at(10), &policy));

        let first = pending.apply(&failed(), Gateway::MercadoPago, at(10), 30, &policy);
        assert_eq!(first.next.status, SubscriptionStatus::Pending);
        assert_eq!(first.effect, TransitionEffect::RetryScheduled { attempt: 1 });
        assert!(!first.next.has_access(at(10), &policy));
        assert!(!first.next.has_access(at(10) + Duration::days(365), &policy));

        let second = first.next.apply(&failed(), Gateway::MercadoPago, at(11), 30, &policy);
        let third = second.next.apply(&failed(), Gateway::MercadoPago, at(12), 30, &policy);
        assert_eq!(third.next.status, SubscriptionStatus::Suspended);

        let paid = first.next.apply(&paid(), Gateway::MercadoPago, at(13), 30, &policy);
        assert_eq!(paid.next.status, SubscriptionStatus::Active);
        assert!(paid.next.has_access(at(14), &policy));
    }

    #[test]
    fn past_due_without_expiry_has_no_access() {
        let state = SubscriptionState {
            status: SubscriptionStatus::PastDue,
            gateway: Some(Gateway::Iugu),
            expires_at: None,
            retry_count: 1,
        };
        assert!(!state.has_access(at(1), &DunningPolicy::default()));
    }

    #[test]
    fn status_names_match_storage() {
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert_eq!(serde_json::to_value(SubscriptionStatus::PastDue).unwrap(), "past_due");
        assert_eq!(serde_json::to_value(Gateway::MercadoPago).unwrap(), "mercadopago");
    }
}
