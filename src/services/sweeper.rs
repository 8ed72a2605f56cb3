use crate::services::share_service::ShareService;
use std::sync::Arc;
use std::time::Duration;

/// Background loop that retires expired shares. The sweep itself is
/// idempotent, so a missed or doubled tick is harmless.
pub fn spawn(shares: Arc<ShareService>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match shares.deactivate_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Share sweep retired {} shares", n),
                Err(e) => tracing::error!("Share sweep failed: {}", e),
            }
        }
    });
}
