use std::time::Duration;

use tracing::{error, info};

use crate::config::RetentionConfig;
use crate::db::Registry;

/// Run one maintenance cycle: retire long-unseen devices, force stale
/// busy/unreached registry rows offline, and stop orphaned running rows.
/// Returns the affected row counts.
pub async fn run_cleanup(registry: &Registry, config: &RetentionConfig) -> (u64, u64, u64) {
    let retired = match registry
        .retire_inactive_devices(config.retire_after_days)
        .await
    {
        Ok(n) => n,
        Err(e) => {
            error!("maintenance: failed to retire inactive devices: {e}");
            0
        }
    };

    let stale = match registry.cleanup_stale_status(config.stale_status_hours).await {
        Ok(n) => n,
        Err(e) => {
            error!("maintenance: failed to clean stale statuses: {e}");
            0
        }
    };

    let orphaned = match registry.stop_orphaned_runs().await {
        Ok(n) => n,
        Err(e) => {
            error!("maintenance: failed to stop orphaned runs: {e}");
            0
        }
    };

    (retired, stale, orphaned)
}

/// Start the hourly registry maintenance task.
pub fn start_maintenance_task(registry: Registry, config: RetentionConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            let (retired, stale, orphaned) = run_cleanup(&registry, &config).await;
            if retired + stale + orphaned > 0 {
                info!(
                    retired_devices = retired,
                    stale_statuses = stale,
                    orphaned_runs = orphaned,
                    "maintenance: cleanup completed"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_on_empty_registry_is_noop() {
        let registry = Registry::open(":memory:").await.unwrap();
        let config = RetentionConfig::default();
        let (retired, stale, orphaned) = run_cleanup(&registry, &config).await;
        assert_eq!((retired, stale, orphaned), (0, 0, 0));
    }
}
