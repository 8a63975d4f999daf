use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::Utc;
use diesel::{pg::PgConnection, Connection};
use diesel_async::pooled_connection::deadpool::BuildError;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use dotenv::dotenv;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accounts::{Account, AccountDirectory, PgAccountDirectory};
use crate::cli::{Cli, Command};
use crate::coalescer::{CachedSnapshotReader, CoalescerConfig, ResponseCoalescer};
use crate::config::{Config, ConfigError};
use crate::db::{build_db_pool, DbPool, StoreError};
use crate::graph_client::{GraphClient, GraphClientErr};
use crate::insights::{GraphInsightsSource, MetricFetcher, RetryPolicy};
use crate::logging::{format_error_report, init_logging};
use crate::orchestrator::thumbnails::ThumbnailWarmError;
use crate::orchestrator::{
    CookieThrottle, CronPrewarm, HttpThumbnailWarmer, NoopThumbnailWarmer, PgAuditSink,
    PgRepairStore, Prewarmer, Repairer, ThumbnailWarmer,
};
use crate::server::credentials::CredentialConfig;
use crate::server::setup_server_with_addr;
use crate::snapshots::{
    normalize_lookback, BackfillPlanner, PgSnapshotStore, ReconcileError, SnapshotReader,
    SnapshotReconciler, SnapshotStore,
};
use crate::state::{AppState, Services};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build db pool: {0}")]
    Pool(#[from] BuildError),
    #[error("failed to run migrations: {0}")]
    Migrations(String),
    #[error(transparent)]
    GraphClient(#[from] GraphClientErr),
    #[error(transparent)]
    Thumbnails(#[from] ThumbnailWarmError),
    #[error("failed to bind http server: {0}")]
    Bind(#[from] std::io::Error),
    #[error("{0} is required for this command")]
    MissingSetting(&'static str),
    #[error("no account {ig_account_id} for owner {owner}")]
    AccountNotFound { ig_account_id: String, owner: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

fn run_migrations(db_url: &str) -> Result<(), CommandError> {
    let mut conn =
        PgConnection::establish(db_url).map_err(|err| CommandError::Migrations(err.to_string()))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| CommandError::Migrations(err.to_string()))?;
    Ok(())
}

/// Wires the upstream client, stores and orchestrators from `config`.
pub fn build_services(config: &Config, pool: DbPool) -> Result<Services, CommandError> {
    let client = GraphClient::new(
        &config.graph_api_url,
        &config.graph_api_version,
        config.graph_request_timeout,
    )?;
    let rps = NonZeroU32::new(config.graph_rps).unwrap_or(nonzero!(20u32));
    let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));
    let source = Arc::new(GraphInsightsSource::new(client, rate_limiter));
    let fetcher = MetricFetcher::new(source, RetryPolicy::default());

    let store: Arc<dyn SnapshotStore> = Arc::new(PgSnapshotStore::new(pool.clone()));
    let reconciler = SnapshotReconciler::new(fetcher.clone(), store.clone());
    let coalescer = ResponseCoalescer::new(CoalescerConfig {
        success_ttl: config.cache_success_ttl,
        rate_limited_ttl: config.cache_rate_limited_ttl,
        max_entries: config.cache_max_entries,
    });
    let snapshots = CachedSnapshotReader::new(
        SnapshotReader::new(reconciler.clone()),
        fetcher.clone(),
        coalescer.clone(),
        &config.token_fingerprint_salt,
    );
    let audit = Arc::new(PgAuditSink::new(pool.clone()));
    let thumbnails: Arc<dyn ThumbnailWarmer> = match &config.thumbnail_warm_url {
        Some(url) => Arc::new(HttpThumbnailWarmer::new(url, config.prewarm_task_timeout)?),
        None => Arc::new(NoopThumbnailWarmer),
    };

    Ok(Services {
        accounts: Arc::new(PgAccountDirectory::new(pool.clone())),
        fetcher: fetcher.clone(),
        snapshots: snapshots.clone(),
        backfill: BackfillPlanner::new(fetcher, store),
        prewarmer: Prewarmer::new(
            reconciler.clone(),
            snapshots,
            thumbnails,
            audit.clone(),
            config.prewarm_task_timeout,
        ),
        repairer: Repairer::new(
            Arc::new(PgRepairStore::new(pool)),
            reconciler.clone(),
            coalescer.clone(),
            audit.clone(),
            config.repair_cooldown,
            config.thumbnail_lock_stale_after,
        ),
        cron: CronPrewarm::new(reconciler, coalescer, audit),
        prewarm_throttle: CookieThrottle::new(config.prewarm_cooldown),
        credentials: CredentialConfig {
            cron_secret: config.cron_secret.clone(),
            env_access_token: config.env_access_token.clone(),
        },
        env_account: config.env_account.as_ref().map(Account::from_env),
    })
}

async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    event = "signal_handler_install_failed",
                    error = %err,
                    "could not install signal handlers; shutdown only via token"
                );
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down");
        }
    }

    shutdown_token.cancel();
}

async fn serve(config: &Config, services: Services) -> Result<(), CommandError> {
    let state = Arc::new(AppState::new(services, CancellationToken::new()));
    tokio::spawn(handle_shutdown_signals(state.shutdown_token.clone()));

    let server_handle = setup_server_with_addr(state, config.bind_addr).await?;
    if let Err(err) = server_handle.await {
        error!(event = "http_server_task_failed", error = %err, "http server task aborted");
    }
    info!(event = "server_stopped", "http server stopped");
    Ok(())
}

fn env_token(config: &Config) -> Result<String, CommandError> {
    config
        .env_access_token
        .clone()
        .ok_or(CommandError::MissingSetting("IG_ACCESS_TOKEN"))
}

async fn backfill(
    config: &Config,
    services: Services,
    ig_account_id: Option<String>,
    owner: Option<String>,
    days: i64,
) -> Result<(), CommandError> {
    let token = env_token(config)?;
    let env_account = config.env_account.as_ref().map(Account::from_env);
    let ig_account_id = ig_account_id
        .or_else(|| env_account.as_ref().map(|a| a.platform_user_id.clone()))
        .ok_or(CommandError::MissingSetting("--ig-account-id or IG_USER_ID"))?;
    let owner = owner
        .or_else(|| env_account.as_ref().map(|a| a.owner_user_id.clone()))
        .ok_or(CommandError::MissingSetting("--owner or IG_OWNER_USER_ID"))?;

    let account = match env_account.filter(|account| {
        account.owner_user_id == owner
            && (account.platform_user_id == ig_account_id || account.account_id == ig_account_id)
    }) {
        Some(account) => account,
        None => services
            .accounts
            .resolve(&owner, Some(ig_account_id.as_str()))
            .await?
            .ok_or_else(|| CommandError::AccountNotFound {
                ig_account_id: ig_account_id.clone(),
                owner: owner.clone(),
            })?,
    };

    let lookback_days = normalize_lookback(Some(days));
    let session = services
        .fetcher
        .open_session(&account, &token)
        .await
        .map_err(ReconcileError::from)?;
    let report = services
        .backfill
        .run(&account, &session, lookback_days, Utc::now().date_naive())
        .await?;
    info!(
        event = "backfill_command_finished",
        account_id = %account.account_id,
        lookback_days,
        inserted = report.inserted,
        skipped_no_data = report.skipped_no_data.len(),
        already_complete = report.already_complete,
        chunks = report.chunks,
        "backfill finished"
    );
    Ok(())
}

async fn cron_prewarm(config: &Config, services: Services) -> Result<(), CommandError> {
    let token = env_token(config)?;
    let account = services
        .env_account
        .clone()
        .ok_or(CommandError::MissingSetting("IG_USER_ID"))?;

    let report = services
        .cron
        .run(&account, &token, Utc::now().date_naive())
        .await?;
    info!(
        event = "cron_prewarm_command_finished",
        account_id = %account.account_id,
        chosen_day = ?report.chosen_day,
        fallback = report.fallback,
        wrote = report.wrote,
        took_ms = report.took_ms,
        "cron prewarm finished"
    );
    Ok(())
}

async fn execute(command: Command, config: &Config) -> Result<(), CommandError> {
    run_migrations(&config.db_url)?;
    let pool = build_db_pool(&config.db_url).await?;
    let services = build_services(config, pool)?;

    match command {
        Command::Serve => serve(config, services).await,
        Command::Backfill {
            ig_account_id,
            owner,
            days,
        } => backfill(config, services, ig_account_id, owner, days).await,
        Command::CronPrewarm => cron_prewarm(config, services).await,
    }
}

fn mode_name(command: &Command) -> &'static str {
    match command {
        Command::Serve => "serve",
        Command::Backfill { .. } => "backfill",
        Command::CronPrewarm => "cron_prewarm",
    }
}

/// Runs one CLI invocation and returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    dotenv().ok();

    let command = cli.command();
    let mode = mode_name(&command);
    let logging_context = init_logging("insights_worker", mode, "info");
    let run_span = tracing::info_span!(
        "worker_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    match execute(command, &config).await {
        Ok(()) => 0,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "command_failed",
                mode,
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "command failed"
            );
            eprintln!("{mode} failed: {err}");
            eprintln!("{error_report}");
            1
        }
    }
}
