use std::sync::Arc;

use chrono::NaiveDate;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::accounts::Account;
use crate::insights::{GraphSession, MetricFetcher};
use crate::snapshots::SnapshotStore;

/// Records today's follower count on a detached task. Failures are logged, never returned.
pub fn spawn_follower_snapshot(
    fetcher: MetricFetcher,
    store: Arc<dyn SnapshotStore>,
    account: Account,
    session: GraphSession,
    day: NaiveDate,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let count = match fetcher.fetch_followers_count(&session).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                debug!(
                    event = "follower_snapshot_unavailable",
                    account_id = %account.account_id,
                    "upstream returned no followers_count"
                );
                return;
            }
            Err(err) => {
                warn!(
                    event = "follower_snapshot_fetch_failed",
                    account_id = %account.account_id,
                    kind = err.kind.as_str(),
                    error = %err,
                    "failed to fetch followers_count"
                );
                return;
            }
        };

        if let Err(err) = store.record_followers(&account, day, count).await {
            warn!(
                event = "follower_snapshot_write_failed",
                account_id = %account.account_id,
                error = %err,
                "failed to record follower snapshot"
            );
        }
    })
}
