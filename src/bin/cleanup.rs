use blob_backup::app::{self, Stage};
use clap::Parser;
use std::process::ExitCode;

/// Remove backups older than the retention window from object storage.
#[derive(Parser, Debug)]
#[command(name = "cleanup", version, about)]
struct Args {
    /// The number of days to retain backups (defaults to BACKUP_RETENTION_DAYS)
    days: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let Some(app) = app::bootstrap("cleanup").await else {
        return ExitCode::FAILURE;
    };

    if app::report(Stage::Cleanup, &app.cleanup(args.days).await) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
