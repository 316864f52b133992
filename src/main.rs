use blob_backup::app;
use clap::Parser;
use std::process::ExitCode;

/// Container entry point: back up the configured directory, then prune old backups.
#[derive(Parser, Debug)]
#[command(name = "blob-backup", version, about)]
struct Args {
    /// Do not create and upload a new backup
    #[arg(long)]
    skip_backup: bool,

    /// Do not delete backups past the retention window
    #[arg(long)]
    skip_cleanup: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let Some(app) = app::bootstrap("blob-backup").await else {
        return ExitCode::FAILURE;
    };

    if app.run(args.skip_backup, args.skip_cleanup).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
