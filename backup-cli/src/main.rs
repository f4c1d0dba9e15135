//! backup-cli - offline recovery for encrypted backup archives
//!
//! Works without the engine's database or a running server: an archive, its backup
//! id and the master key are all that is needed.

mod utils;

use anyhow::{Context, Result};
use backup_engine::crypto::{self, MasterKey};
use backup_engine::error::CryptoError;
use backup_engine::services::cron::CronSchedule;
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status when the key or backup id is wrong, or the archive was tampered with.
const EXIT_AUTHENTICATION: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct ArchiveArgs {
    /// Encrypted archive (`.tar.gz.enc`)
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// Backup id the archive belongs to
    #[arg(long)]
    id: String,

    /// Master key the engine was configured with
    #[arg(short, long, env = "BACKUP_MASTER_KEY", hide_env_values = true)]
    key: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decrypt an archive into a plain `.tar.gz`
    Decrypt {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Output file, must not exist
        #[arg(short, long, value_name = "FILE")]
        out: PathBuf,
    },
    /// Decrypt and unpack an archive into a new directory
    Extract {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Output directory, must not exist
        #[arg(short, long, value_name = "DIR")]
        out: PathBuf,
    },
    /// Validate a schedule and print its next fire times (UTC)
    Schedule {
        expression: String,

        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = utils::logger::init(&cli.log_level) {
        eprintln!("warning: logging disabled: {e}");
    }

    match run(cli.command, Utc::now()) {
        Ok(output) => {
            for line in output {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            if is_authentication_failure(&e) {
                eprintln!("the key or backup id is wrong, or the archive is damaged");
                ExitCode::from(EXIT_AUTHENTICATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_authentication_failure(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<CryptoError>())
        .any(CryptoError::is_authentication_failure)
}

fn open_key(archive: &ArchiveArgs) -> Result<MasterKey> {
    if archive.id.trim().is_empty() {
        anyhow::bail!("backup id must not be empty");
    }
    Ok(MasterKey::new(archive.key.as_bytes())?)
}

/// Executes a command and returns the lines to print.
fn run(command: Command, now: DateTime<Utc>) -> Result<Vec<String>> {
    match command {
        Command::Decrypt { archive, out } => {
            let key = open_key(&archive)?;
            if out.exists() {
                anyhow::bail!("{} already exists", out.display());
            }
            tracing::info!(file = %archive.file.display(), id = %archive.id, "Decrypting archive");
            let bytes = crypto::decrypt_file(&archive.file, &out, &archive.id, &key)
                .with_context(|| format!("failed to decrypt {}", archive.file.display()))?;
            Ok(vec![format!("wrote {} ({bytes} bytes)", out.display())])
        }
        Command::Extract { archive, out } => {
            let key = open_key(&archive)?;
            tracing::info!(file = %archive.file.display(), id = %archive.id, "Extracting archive");
            crypto::extract_archive(&archive.file, &out, &archive.id, &key)
                .with_context(|| format!("failed to extract {}", archive.file.display()))?;
            Ok(vec![format!("extracted into {}", out.display())])
        }
        Command::Schedule { expression, count } => {
            let schedule = CronSchedule::parse(&expression)?;
            let upcoming = schedule.upcoming(now, count);
            if upcoming.is_empty() {
                anyhow::bail!("schedule {expression:?} never fires");
            }
            Ok(upcoming.iter().map(|t| t.to_rfc3339()).collect())
        }
    }
}
