use clap::{Parser, Subcommand};

/// Credential lifecycle service for third-party OAuth tokens.
#[derive(Debug, Parser)]
#[command(name = "token-keeper", version, about)]
pub struct Args {
    /// Emit JSON log lines (overrides TOKEN_KEEPER_LOG_JSON).
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the maintenance scheduler and cache sweeper until Ctrl-C (default).
    Serve,
    /// Run one maintenance job now and print its result.
    RunJob {
        /// vault_cleanup, key_rotation or token_refresh_sweep
        name: String,
    },
    /// Check the vault and print service metrics.
    Health,
}
