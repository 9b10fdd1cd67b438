use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pvzwatch_core::config::{ITEM_TTL_DAYS, TASK_TTL_HOURS};
use pvzwatch_pipeline::Supervisor;
use pvzwatch_store::Store;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const ERROR_RETRY: Duration = Duration::from_secs(60 * 60);

/// Daily TTL sweep: found items older than 30 days go from the database,
/// terminal task entries older than 24 h go from the in-memory registry.
/// A failed sweep is retried after an hour.
pub async fn run(store: Store, supervisor: Arc<Supervisor>, cancel: CancellationToken) {
    info!("cleanup loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cleanup loop stopped");
                return;
            }
            _ = sleep(DAY) => {}
        }

        loop {
            match store.cleanup_old_items(ITEM_TTL_DAYS) {
                Ok(deleted) => {
                    let swept = supervisor.cleanup_old_tasks(chrono::Duration::hours(TASK_TTL_HOURS));
                    match store.db_stats() {
                        Ok(stats) => info!(
                            deleted,
                            swept,
                            tasks = stats.tasks_count,
                            items = stats.found_items_count,
                            "daily cleanup done"
                        ),
                        Err(e) => warn!(error = %e, "db stats unavailable after cleanup"),
                    }
                    break;
                }
                Err(e) => {
                    error!(error = %e, "cleanup failed, retrying in an hour");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("cleanup loop stopped");
                            return;
                        }
                        _ = sleep(ERROR_RETRY) => {}
                    }
                }
            }
        }
    }
}
