use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tidesync",
    version,
    about = "Scheduled directory replication to remote hosts over SSH"
)]
pub struct Cli {
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// SQLite database file (defaults to the per-user data directory).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler and the management API.
    Serve(ServeArgs),
    /// Run one task immediately and wait for the result.
    Sync(SyncArgs),
    /// Probe an SSH endpoint with the configured toolchain.
    TestConnection(TestConnectionArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    pub task_id: i64,
}

#[derive(Debug, Args)]
pub struct TestConnectionArgs {
    pub host: String,

    #[arg(long, short, default_value_t = 22)]
    pub port: u16,

    #[arg(long, short)]
    pub user: String,
}
