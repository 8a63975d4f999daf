use crate::build_info;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Instagram insights snapshot worker",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP API (default)
    Serve,

    /// Fill missing daily snapshots using the environment token
    Backfill {
        #[clap(long)]
        /// Platform-native account id; defaults to IG_USER_ID
        ig_account_id: Option<String>,

        #[clap(long)]
        /// Owner scope; defaults to IG_OWNER_USER_ID
        owner: Option<String>,

        #[clap(long, default_value_t = 90)]
        /// Lookback window in days (1..=120)
        days: i64,
    },

    /// Run one cron prewarm pass for the environment account
    CronPrewarm,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
