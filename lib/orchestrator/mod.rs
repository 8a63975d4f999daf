pub mod audit;
pub mod cron;
pub mod followers;
pub mod prewarm;
pub mod repair;
pub mod thumbnails;
pub mod throttle;

pub use audit::{AuditRecord, AuditSink, PgAuditSink};
pub use cron::{CronPrewarm, CronReport};
pub use prewarm::{PrewarmInput, PrewarmMode, PrewarmReport, Prewarmer};
pub use repair::{
    PgRepairStore, RepairAction, RepairOutcome, RepairRequest, RepairStore, RepairTarget, Repairer,
};
pub use thumbnails::{HttpThumbnailWarmer, NoopThumbnailWarmer, ThumbnailWarmer};
pub use throttle::{CookieThrottle, CooldownGate, ThrottleDecision};
