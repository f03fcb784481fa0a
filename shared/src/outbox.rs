use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::db::DbPool;
use crate::models::{DbOutboxEvent, NewOutboxEvent};
use crate::schema::outbox_events;
use crate::{DomainEvent, EVENTS_TOPIC};

const BATCH_SIZE: i64 = 100;

/// Writes an event in the caller's transaction; the relay publishes it later.
pub async fn enqueue(conn: &mut AsyncPgConnection, event: &DomainEvent) -> Result<(), diesel::result::Error> {
    let row = NewOutboxEvent::try_from(event)
        .map_err(|e| diesel::result::Error::SerializationError(e.into()))?;

    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;

    Ok(())
}

pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
    topic: String,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer) -> Self {
        Self { pool, producer, topic: EVENTS_TOPIC.to_string() }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let producer = self.producer.clone();
        let topic = self.topic.clone();

        conn.transaction::<_, anyhow::Error, _>(move |conn| {
            Box::pin(async move {
                for event in claim_batch(conn, BATCH_SIZE).await? {
                    if let Err(e) = publish_event(&producer, &topic, &event).await {
                        error!("Failed to publish event {}: {}", event.id, e);
                        continue;
                    }

                    diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                        .set(outbox_events::processed.eq(true))
                        .execute(conn)
                        .await?;

                    info!("Published outbox event {} ({})", event.id, event.event_type);
                }
                Ok(())
            })
        })
        .await
    }
}

/// Locks a batch of unpublished rows; rows another relay holds are skipped.
pub async fn claim_batch(conn: &mut AsyncPgConnection, limit: i64) -> QueryResult<Vec<DbOutboxEvent>> {
    outbox_events::table
        .filter(outbox_events::processed.eq(false).or(outbox_events::processed.is_null()))
        .order(outbox_events::created_at.asc())
        .limit(limit)
        .for_update()
        .skip_locked()
        .load::<DbOutboxEvent>(conn)
        .await
}

async fn publish_event(producer: &FutureProducer, topic: &str, event: &DbOutboxEvent) -> Result<()> {
    let json = serde_json::to_string(&event.event_data)?;
    let key = event.aggregate_id.to_string();
    let record = FutureRecord::to(topic)
        .payload(&json)
        .key(&key);

    producer.send(record, Duration::from_secs(5)).await
        .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventType;
    use uuid::Uuid;

    /// Needs `TEST_DATABASE_URL` pointing at a scratch database.
    #[tokio::test]
    async fn concurrent_relays_claim_disjoint_rows() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        crate::db::run_migrations(&url).unwrap();
        let pool = crate::db::build_pool(&url, 2).await.unwrap();
        let mut first = pool.get().await.unwrap();
        let mut second = pool.get().await.unwrap();

        for _ in 0..2 {
            let event = DomainEvent::new(Uuid::new_v4(), EventType::BarberCreated, &serde_json::json!({})).unwrap();
            enqueue(&mut first, &event).await.unwrap();
        }

        diesel::sql_query("BEGIN").execute(&mut first).await.unwrap();
        diesel::sql_query("BEGIN").execute(&mut second).await.unwrap();
        let claimed_first = claim_batch(&mut first, 1).await.unwrap();
        let claimed_second = claim_batch(&mut second, 1).await.unwrap();
        diesel::sql_query("ROLLBACK").execute(&mut first).await.unwrap();
        diesel::sql_query("ROLLBACK").execute(&mut second).await.unwrap();

        assert_eq!(claimed_first.len(), 1);
        assert_eq!(claimed_second.len(), 1);
        assert_ne!(claimed_first[0].id, claimed_second[0].id);
    }
}
