use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::handlers::SubscriptionService;

pub struct ExpirySweeper {
    service: Arc<SubscriptionService>,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(service: Arc<SubscriptionService>, period: Duration) -> Self {
        Self { service, period }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.period);

        loop {
            interval.tick().await;

            match self.service.expire_overdue(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("Expired {} overdue subscriptions", count),
                Err(e) => error!("Error sweeping expired subscriptions: {}", e),
            }
        }
    }
}
