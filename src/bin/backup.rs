use blob_backup::app::{self, Stage};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Backup a directory and upload it to object storage.
#[derive(Parser, Debug)]
#[command(name = "backup", version, about)]
struct Args {
    /// The directory to backup (defaults to BACKUP_SOURCE_DIR)
    directory: Option<PathBuf>,

    /// Directory to save the archive in before upload (defaults to BACKUP_OUTPUT_DIR)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let Some(app) = app::bootstrap("backup").await else {
        return ExitCode::FAILURE;
    };

    let result = app
        .backup(args.directory.as_deref(), args.output_dir.as_deref())
        .await;
    if app::report(Stage::Backup, &result) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
