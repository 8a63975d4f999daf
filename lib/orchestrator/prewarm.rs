use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use super::audit::{record_best_effort, AuditRecord, AuditSink};
use super::followers::spawn_follower_snapshot;
use super::thumbnails::ThumbnailWarmer;
use crate::accounts::Account;
use crate::coalescer::{CachedSnapshotReader, ResponseKind};
use crate::redaction::redact_secrets;
use crate::server::monitoring::{TaskLabels, INSIGHTS_METRICS};
use crate::snapshots::{normalize_read_days, SnapshotReconciler, SnapshotSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrewarmMode {
    Full,
    Thumbs,
    Snapshots,
}

impl PrewarmMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Thumbs => "thumbs",
            Self::Snapshots => "snapshots",
        }
    }

    fn runs_snapshot(self) -> bool {
        matches!(self, Self::Full | Self::Snapshots)
    }

    fn runs_cards(self) -> bool {
        matches!(self, Self::Full | Self::Snapshots)
    }

    fn runs_thumbnails(self) -> bool {
        matches!(self, Self::Full | Self::Thumbs)
    }
}

impl FromStr for PrewarmMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "full" => Ok(Self::Full),
            "thumbs" => Ok(Self::Thumbs),
            "snapshots" => Ok(Self::Snapshots),
            other => Err(format!("unknown prewarm mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Throttled,
    NoAccount,
    NoToken,
}

/// Result of one sub-task. `Timeout` means unknown: the task may still finish in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Done,
    NotRequested,
    Failed,
    Timeout,
}

impl TaskOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::NotRequested => "not_requested",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrewarmDid {
    pub snapshot: TaskOutcome,
    pub cards: TaskOutcome,
    pub thumbnails: TaskOutcome,
}

impl PrewarmDid {
    fn none() -> Self {
        Self {
            snapshot: TaskOutcome::NotRequested,
            cards: TaskOutcome::NotRequested,
            thumbnails: TaskOutcome::NotRequested,
        }
    }

    fn status(&self) -> RunStatus {
        let ran: Vec<TaskOutcome> = [self.snapshot, self.cards, self.thumbnails]
            .into_iter()
            .filter(|outcome| *outcome != TaskOutcome::NotRequested)
            .collect();
        let done = ran.iter().filter(|o| **o == TaskOutcome::Done).count();
        if done == ran.len() {
            RunStatus::Done
        } else if done == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskNote {
    pub task: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrewarmReport {
    pub ok: bool,
    pub mode: PrewarmMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    pub did: PrewarmDid,
    pub took_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub debug: Vec<TaskNote>,
}

#[derive(Debug, Clone)]
pub struct PrewarmInput {
    pub mode: PrewarmMode,
    pub reason: String,
    pub throttled: bool,
    pub account: Option<Account>,
    pub credential: Option<String>,
    pub today: NaiveDate,
}

/// Best-effort warmer triggered by login, account switch or a manual request.
#[derive(Clone)]
pub struct Prewarmer {
    reconciler: SnapshotReconciler,
    snapshots: CachedSnapshotReader,
    thumbnails: Arc<dyn ThumbnailWarmer>,
    audit: Arc<dyn AuditSink>,
    task_timeout: Duration,
}

impl Prewarmer {
    pub fn new(
        reconciler: SnapshotReconciler,
        snapshots: CachedSnapshotReader,
        thumbnails: Arc<dyn ThumbnailWarmer>,
        audit: Arc<dyn AuditSink>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            reconciler,
            snapshots,
            thumbnails,
            audit,
            task_timeout,
        }
    }

    pub async fn run(&self, input: PrewarmInput) -> PrewarmReport {
        let started = Instant::now();
        let skip = |reason: SkipReason| {
            if reason == SkipReason::Throttled {
                if let Some(metrics) = INSIGHTS_METRICS.get() {
                    metrics.throttled_total.inc();
                }
            }
            info!(
                event = "prewarm_skipped",
                mode = input.mode.as_str(),
                reason = %input.reason,
                skipped = ?reason,
                "prewarm skipped"
            );
            PrewarmReport {
                ok: true,
                mode: input.mode,
                skipped: Some(reason),
                status: None,
                did: PrewarmDid::none(),
                took_ms: started.elapsed().as_millis() as u64,
                debug: Vec::new(),
            }
        };

        if input.throttled {
            return skip(SkipReason::Throttled);
        }
        let Some(account) = input.account.clone() else {
            return skip(SkipReason::NoAccount);
        };
        let Some(credential) = input.credential.clone().filter(|token| !token.is_empty()) else {
            return skip(SkipReason::NoToken);
        };

        let mode = input.mode;
        let today = input.today;
        let mut did = PrewarmDid::none();
        let mut debug = Vec::new();

        let snapshot_task = mode.runs_snapshot().then(|| {
            let reconciler = self.reconciler.clone();
            let account = account.clone();
            let credential = credential.clone();
            self.bounded("snapshot", async move {
                let session = reconciler
                    .fetcher()
                    .open_session(&account, &credential)
                    .await
                    .map_err(|err| err.to_string())?;
                let outcome = reconciler
                    .ensure_day(&account, &session, today, SnapshotSource::Prewarm, today)
                    .await
                    .map_err(|err| err.to_string())?;
                spawn_follower_snapshot(
                    reconciler.fetcher().clone(),
                    reconciler.store().clone(),
                    account,
                    session,
                    today,
                );
                Ok(format!("{:?}", outcome.reason))
            })
        });

        let cards_task = mode.runs_cards().then(|| {
            let snapshots = self.snapshots.clone();
            let account = account.clone();
            let credential = credential.clone();
            self.bounded("cards", async move {
                let reply = snapshots
                    .read(&account, &credential, normalize_read_days(None), today, None)
                    .await;
                match reply.response.kind {
                    ResponseKind::Success => Ok(reply.served_from.as_str().to_string()),
                    other => Err(format!("cache warm ended {}", other.as_str())),
                }
            })
        });

        let thumbnails_task = mode.runs_thumbnails().then(|| {
            let thumbnails = self.thumbnails.clone();
            let account = account.clone();
            self.bounded("thumbnails", async move {
                thumbnails
                    .warm(&account)
                    .await
                    .map(|warmed| format!("warmed {warmed}"))
                    .map_err(|err| err.to_string())
            })
        });

        let (snapshot, cards, thumbnails) = tokio::join!(
            optional(snapshot_task),
            optional(cards_task),
            optional(thumbnails_task)
        );
        for (slot, task, result) in [
            (&mut did.snapshot, "snapshot", snapshot),
            (&mut did.cards, "cards", cards),
            (&mut did.thumbnails, "thumbnails", thumbnails),
        ] {
            if let Some((outcome, note)) = result {
                *slot = outcome;
                if outcome != TaskOutcome::Done {
                    debug.push(TaskNote { task, detail: note });
                }
            }
        }

        let status = did.status();
        let took_ms = started.elapsed().as_millis() as u64;
        info!(
            event = "prewarm_finished",
            account_id = %account.account_id,
            mode = mode.as_str(),
            reason = %input.reason,
            status = ?status,
            took_ms,
            "prewarm finished"
        );

        let audit = self.audit.clone();
        let record = AuditRecord {
            owner_user_id: Some(account.owner_user_id.clone()),
            kind: "prewarm",
            action: mode.as_str().to_string(),
            ok: status != RunStatus::Failed,
            details: json!({
                "reason": input.reason,
                "did": did,
                "took_ms": took_ms,
            }),
        };
        tokio::spawn(async move { record_best_effort(audit.as_ref(), record).await });

        PrewarmReport {
            ok: true,
            mode,
            skipped: None,
            status: Some(status),
            did,
            took_ms,
            debug,
        }
    }

    /// Runs `task` on its own task under the per-task timeout. On timeout the task is left
    /// running detached and reported as `Timeout`.
    fn bounded<F>(
        &self,
        name: &'static str,
        task: F,
    ) -> impl Future<Output = (TaskOutcome, String)> + Send + 'static
    where
        F: Future<Output = Result<String, String>> + Send + 'static,
    {
        let limit = self.task_timeout;
        async move {
            let handle = tokio::spawn(task);
            let (outcome, note) = match timeout(limit, handle).await {
                Ok(Ok(Ok(note))) => (TaskOutcome::Done, note),
                Ok(Ok(Err(err))) => (TaskOutcome::Failed, redact_secrets(&err)),
                Ok(Err(join_err)) => (TaskOutcome::Failed, join_err.to_string()),
                Err(_) => (
                    TaskOutcome::Timeout,
                    format!("no result within {}ms", limit.as_millis()),
                ),
            };
            if outcome != TaskOutcome::Done {
                warn!(
                    event = "prewarm_task_incomplete",
                    task = name,
                    outcome = outcome.as_str(),
                    detail = %note,
                    "prewarm sub-task did not complete"
                );
            }
            if let Some(metrics) = INSIGHTS_METRICS.get() {
                metrics
                    .orchestrator_tasks_total
                    .get_or_create(&TaskLabels {
                        task: name,
                        outcome: outcome.as_str(),
                    })
                    .inc();
            }
            (outcome, note)
        }
    }
}

async fn optional<F>(task: Option<F>) -> Option<(TaskOutcome, String)>
where
    F: Future<Output = (TaskOutcome, String)>,
{
    match task {
        Some(task) => Some(task.await),
        None => None,
    }
}

#[cfg(test)]
#[path = "prewarm_tests.rs"]
mod tests;
