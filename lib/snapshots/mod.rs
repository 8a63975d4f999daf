pub mod backfill;
pub mod read_model;
pub mod reconciler;
pub mod store;
pub mod types;

pub use backfill::{normalize_lookback, plan_missing_days, BackfillPlan, BackfillPlanner, BackfillReport};
pub use read_model::{normalize_read_days, DailySnapshotReport, PointsSource, SnapshotReader};
pub use reconciler::{EnsureDayOutcome, EnsureReason, SnapshotReconciler};
pub use store::{PgSnapshotStore, SnapshotStore};
pub use types::{DailySnapshot, ReconcileError, SnapshotSource};
