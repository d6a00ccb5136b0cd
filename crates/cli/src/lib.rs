//! Operator commands for the simbridge audit trail.
//!
//! - `verify`: walk the hash chain and report the first broken link
//! - `events`: print recent events from a local audit directory

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

use simbridge_audit::store::{
    FsObjectStore, LocalFileStore, ObjectAuditStore, RetentionMode,
};
use simbridge_audit::{
    fetch_from_store, verify_store, AuditStore, EventFilter, RetentionPolicy, VerifyRange,
    VerifyReport,
};
use simbridge_core::JobId;

/// Exit code when verification finds a broken chain.
pub const EXIT_INTEGRITY_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "simbridge", version, about = "Simulation bridge operator tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Verify the audit hash chain.
    Verify(VerifyArgs),
    /// List recent audit events, newest first.
    Events(EventsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Daily NDJSON files
    Local,
    /// One file per event, as written by the object backend
    Object,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long, value_enum, default_value_t = StoreKind::Local)]
    pub backend: StoreKind,

    /// Audit directory (local) or object store root (object)
    #[arg(long)]
    pub path: PathBuf,

    /// Object key prefix
    #[arg(long, default_value = "audit")]
    pub prefix: String,

    /// First partition to verify (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last partition to verify (YYYY-MM-DD)
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Required object retention mode (governance|compliance)
    #[arg(long, requires = "retention_days")]
    pub retention_mode: Option<RetentionMode>,

    /// Required minimum retention in days
    #[arg(long, requires = "retention_mode")]
    pub retention_days: Option<u32>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Local audit directory
    #[arg(long)]
    pub path: PathBuf,

    /// Event type prefix, e.g. `job.` or `tool.run_simulation.`
    #[arg(long = "type")]
    pub event_type: Option<String>,

    /// Only events about this job
    #[arg(long)]
    pub job: Option<JobId>,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

/// Run a parsed command. Returns the process exit code.
pub async fn execute(
    cli: Cli,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> anyhow::Result<u8> {
    match cli.command {
        Command::Verify(args) => {
            let report = verify(&args).await?;
            render_report(&report, args.json, stdout, stderr)?;
            Ok(if report.ok { 0 } else { EXIT_INTEGRITY_FAILURE })
        }
        Command::Events(args) => {
            events(&args, stdout).await?;
            Ok(0)
        }
    }
}

pub async fn verify(args: &VerifyArgs) -> anyhow::Result<VerifyReport> {
    if !args.path.is_dir() {
        bail!("audit location {} is not a directory", args.path.display());
    }

    let store: Box<dyn AuditStore> = match args.backend {
        StoreKind::Local => Box::new(LocalFileStore::at(&args.path)),
        StoreKind::Object => Box::new(ObjectAuditStore::new(
            FsObjectStore::new(&args.path),
            args.prefix.clone(),
        )),
    };
    let policy = match (args.retention_mode, args.retention_days) {
        (Some(mode), Some(min_days)) => Some(RetentionPolicy { mode, min_days }),
        _ => None,
    };

    verify_store(
        store.as_ref(),
        VerifyRange::between(args.from, args.to),
        policy.as_ref(),
    )
    .await
    .with_context(|| format!("failed to read audit store {}", store.describe()))
}

fn render_report(
    report: &VerifyReport,
    json: bool,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> anyhow::Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *stdout, report)?;
        writeln!(stdout)?;
    } else if report.ok {
        writeln!(
            stdout,
            "ok: {} events verified across {} partitions",
            report.checked, report.partitions
        )?;
    }

    if let Some(failure) = &report.failure {
        writeln!(stderr, "integrity violation at {failure}")?;
        writeln!(stderr, "{} events verified before the failure", report.checked)?;
    }
    Ok(())
}

pub async fn events(args: &EventsArgs, stdout: &mut dyn Write) -> anyhow::Result<()> {
    if !args.path.is_dir() {
        bail!("audit directory {} does not exist", args.path.display());
    }
    let store = LocalFileStore::at(&args.path);
    let filter = EventFilter {
        event_type_prefix: args.event_type.clone(),
        job_id: args.job,
        since: None,
    };

    let events = fetch_from_store(&store, args.limit, &filter)
        .await
        .context("failed to read audit events")?;
    for event in events {
        serde_json::to_writer(&mut *stdout, &event)?;
        writeln!(stdout)?;
    }
    Ok(())
}
