//! Queries more than one service runs against the shared tables.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::billing::SubscriptionStatus;
use crate::models::Subscription;
use crate::schema::{establishments, subscriptions};

/// Copies the subscription status onto the tenant row the frontend reads.
pub async fn mirror_subscription(
    conn: &mut AsyncPgConnection,
    establishment_id: Uuid,
    status: SubscriptionStatus,
    expires_at: Option<DateTime<Utc>>,
) -> QueryResult<()> {
    diesel::update(establishments::table.find(establishment_id))
        .set((
            establishments::subscription_status.eq(status.as_str()),
            establishments::subscription_expires_at.eq(expires_at),
            establishments::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn subscription_for_update(
    conn: &mut AsyncPgConnection,
    establishment_id: Uuid,
) -> QueryResult<Option<Subscription>> {
    subscriptions::table
        .filter(subscriptions::establishment_id.eq(establishment_id))
        .for_update()
        .first::<Subscription>(conn)
        .await
        .optional()
}
