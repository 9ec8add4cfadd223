use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::CacheStore;
use crate::config::Settings;
use crate::server::ShutdownSignal;

/// delay before the first sweep
pub const INITIAL_DELAY: Duration = Duration::from_secs(60);

/// removes expired entries on a fixed period until shutdown is requested
pub async fn run(
    cache: Arc<CacheStore>,
    settings: Arc<Settings>,
    initial_delay: Duration,
    period: Duration,
    mut shutdown: ShutdownSignal,
) {
    let start = tokio::time::Instant::now() + initial_delay;
    let mut ticker = tokio::time::interval_at(start, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = cache.purge_expired(&settings, Instant::now());
                if report.entries > 0 || report.buckets > 0 {
                    info!(
                        "sweep removed {} expired entries and {} empty clients",
                        report.entries, report.buckets
                    );
                } else {
                    debug!("sweep found nothing to remove");
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    info!("expiration sweeper stopped");
}
