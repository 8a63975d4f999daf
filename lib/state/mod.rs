use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::accounts::{Account, AccountDirectory};
use crate::coalescer::CachedSnapshotReader;
use crate::insights::MetricFetcher;
use crate::orchestrator::{CookieThrottle, CronPrewarm, Prewarmer, Repairer};
use crate::server::credentials::CredentialConfig;
use crate::snapshots::BackfillPlanner;

/// Everything the HTTP handlers call into.
pub struct Services {
    pub accounts: Arc<dyn AccountDirectory>,
    pub fetcher: MetricFetcher,
    pub snapshots: CachedSnapshotReader,
    pub backfill: BackfillPlanner,
    pub prewarmer: Prewarmer,
    pub repairer: Repairer,
    pub cron: CronPrewarm,
    pub prewarm_throttle: CookieThrottle,
    pub credentials: CredentialConfig,
    /// Account for the env and cron credential modes.
    pub env_account: Option<Account>,
}

pub struct AppState {
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services, shutdown_token: CancellationToken) -> Self {
        Self {
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
            services,
        }
    }
}
