/// Build metadata reported by the CLI, the bootstrap log event and `/metrics`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("INSIGHTS_WORKER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("INSIGHTS_WORKER_GIT_COMMIT_HASH")
);

/// Returns a short git hash for log context and metric labels.
///
/// `"unknown"` is passed through untouched when the build had no git metadata.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }

    let short_len = 12usize.min(GIT_COMMIT_HASH.len());
    &GIT_COMMIT_HASH[..short_len]
}
