use std::fs::OpenOptions;

use anyhow::{bail, Context};
use colored::Colorize;
use serde::Serialize;
use tracing::debug;
use vbak_engine::{
    BatchOutcome, Engine, EngineConfig, PruneSelector, ReceiveMode, ReceiveReport, SessionRecord,
    VolumeName,
};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    debug!(config = %cli.config.display(), "loading configuration");
    let config = EngineConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let mut engine = Engine::open(config)?;
    let format = cli.format;
    match cli.command {
        Command::Monitor(args) => cmd_monitor(&mut engine, args, format),
        Command::Send(args) => cmd_send(&mut engine, args, format),
        Command::Receive(args) => cmd_receive(&mut engine, args, format),
        Command::Verify(args) => cmd_verify(&mut engine, args, format),
        Command::Diff(args) => cmd_diff(&mut engine, args, format),
        Command::Prune(args) => cmd_prune(&mut engine, args, format),
        Command::List(args) => cmd_list(&engine, args, format),
        Command::Delete(args) => cmd_delete(&mut engine, args),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn selected_volumes(engine: &Engine, args: VolumesArgs) -> anyhow::Result<Vec<VolumeName>> {
    let volumes = if args.volumes.is_empty() {
        engine.config().enabled_volumes()
    } else {
        args.volumes
    };
    if volumes.is_empty() {
        bail!("no volumes given and none enabled in the configuration");
    }
    Ok(volumes)
}

#[derive(Serialize)]
struct BatchRow<'a, T> {
    volume: &'a VolumeName,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Print the per-volume failures of a batch and fail if there were any.
fn finish_batch<T: Serialize>(
    outcome: &BatchOutcome<T>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        let rows: Vec<BatchRow<'_, T>> = outcome
            .completed
            .iter()
            .map(|(volume, report)| BatchRow {
                volume,
                report: Some(report),
                error: None,
            })
            .chain(outcome.failed.iter().map(|(volume, e)| BatchRow {
                volume,
                report: None,
                error: Some(e.to_string()),
            }))
            .collect();
        print_json(&rows)?;
    } else {
        for (volume, e) in &outcome.failed {
            println!("{} {}: {}", "✗".red().bold(), volume.as_str().yellow(), e);
        }
    }
    if !outcome.is_success() {
        let total = outcome.failed.len() + outcome.completed.len();
        bail!("{} of {} volumes failed", outcome.failed.len(), total);
    }
    Ok(())
}

fn cmd_monitor(
    engine: &mut Engine,
    args: VolumesArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let volumes = selected_volumes(engine, args)?;
    let outcome = engine.monitor_all(&volumes)?;
    if format == OutputFormat::Text {
        for (volume, report) in &outcome.completed {
            if report.full_transfer_pending {
                println!(
                    "{} {}: no sessions yet, next send is a full transfer",
                    "•".cyan(),
                    volume.as_str().yellow()
                );
            } else {
                println!(
                    "{} {}: {} bytes changed, {} freed, {} chunks marked",
                    "✓".green().bold(),
                    volume.as_str().yellow(),
                    report.changed_bytes.to_string().bold(),
                    report.freed_bytes,
                    report.chunks_marked
                );
            }
        }
    }
    finish_batch(&outcome, format)
}

fn cmd_send(engine: &mut Engine, args: VolumesArgs, format: OutputFormat) -> anyhow::Result<()> {
    let volumes = selected_volumes(engine, args)?;
    let outcome = engine.send_all(&volumes)?;
    if format == OutputFormat::Text {
        for (volume, report) in &outcome.completed {
            match &report.session {
                Some(session) => {
                    println!(
                        "{} {}: session {}",
                        "✓".green().bold(),
                        volume.as_str().yellow(),
                        session.to_string().cyan()
                    );
                    println!(
                        "  {} stored, {} linked, {} zero, {} bytes sent",
                        report.chunks_stored.to_string().bold(),
                        report.chunks_linked,
                        report.zero_chunks,
                        report.bytes_sent
                    );
                }
                None => println!(
                    "{} {}: {}",
                    "•".cyan(),
                    volume.as_str().yellow(),
                    "no changes".dimmed()
                ),
            }
        }
    }
    finish_batch(&outcome, format)
}

fn print_received(
    verb: &str,
    report: &ReceiveReport,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    println!(
        "{} {} session {}: {} chunks ({} zero), {} bytes fetched",
        "✓".green().bold(),
        verb,
        report.session.to_string().cyan(),
        report.chunks.to_string().bold(),
        report.zero_chunks,
        report.bytes_fetched
    );
    Ok(())
}

fn cmd_receive(
    engine: &mut Engine,
    args: ReceiveArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)
        .with_context(|| format!("opening {}", args.output.display()))?;
    let report = engine.receive(
        &args.target.volume,
        args.target.session,
        ReceiveMode::Extract(&mut output),
    )?;
    output.sync_all()?;
    print_received("Restored", &report, format)?;
    if format == OutputFormat::Text {
        println!(
            "  Written to {} ({} bytes)",
            args.output.display().to_string().bold(),
            report.volume_size
        );
    }
    Ok(())
}

fn cmd_verify(engine: &mut Engine, args: SessionArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = engine.verify(&args.volume, args.session)?;
    print_received("Verified", &report, format)
}

fn cmd_diff(engine: &mut Engine, args: DiffArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = engine.diff(&args.target.volume, args.target.session, args.remap)?;
    if format == OutputFormat::Json {
        return print_json(&report);
    }
    if let Some(size) = report.reference_size {
        println!(
            "{} volume is {} bytes, session recorded {}",
            "!".yellow().bold(),
            size,
            report.volume_size
        );
    }
    if report.differing.is_empty() {
        println!(
            "{} Session {} matches the volume.",
            "✓".green().bold(),
            report.session.to_string().cyan()
        );
        return Ok(());
    }
    println!(
        "{} chunks differ from session {}:",
        report.differing.len().to_string().red().bold(),
        report.session.to_string().cyan()
    );
    for addr in &report.differing {
        println!("  {}", addr.to_string().dimmed());
    }
    if args.remap {
        println!("Marked for resend on the next {}.", "send".bold());
    }
    Ok(())
}

fn prune_selector(args: &PruneArgs) -> anyhow::Result<PruneSelector> {
    match (args.session, args.from, args.to, args.before) {
        (Some(name), None, None, None) => Ok(PruneSelector::Single(name)),
        (None, Some(from), Some(to), None) => Ok(PruneSelector::Range { from, to }),
        (None, None, None, Some(bound)) => Ok(PruneSelector::Before(bound)),
        _ => bail!("give exactly one of --session, --from/--to, or --before"),
    }
}

fn cmd_prune(engine: &mut Engine, args: PruneArgs, format: OutputFormat) -> anyhow::Result<()> {
    let selector = prune_selector(&args)?;
    let report = engine.prune(&args.volume, &selector)?;
    if format == OutputFormat::Json {
        return print_json(&report);
    }
    println!(
        "{} Pruned {} sessions into {}",
        "✓".green().bold(),
        report.removed.len().to_string().bold(),
        report.target.to_string().cyan()
    );
    for session in &report.removed {
        println!("  {} {}", "removed:".red(), session);
    }
    println!(
        "  {} chunks kept, {} superseded",
        report.chunks_relocated, report.chunks_discarded
    );
    Ok(())
}

#[derive(Serialize)]
struct SessionRow {
    name: String,
    captured_at: i64,
    volume_size: u64,
    chunk_size: u64,
    layout: &'static str,
    sequence: u64,
    previous: Option<String>,
}

impl From<&SessionRecord> for SessionRow {
    fn from(record: &SessionRecord) -> Self {
        Self {
            name: record.name.to_string(),
            captured_at: record.captured_at,
            volume_size: record.volume_size,
            chunk_size: record.chunk_size,
            layout: record.layout.as_str(),
            sequence: record.sequence,
            previous: record.previous.map(|p| p.to_string()),
        }
    }
}

fn cmd_list(engine: &Engine, args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let Some(volume) = args.volume else {
        let volumes = engine.list_volumes()?;
        if format == OutputFormat::Json {
            return print_json(&volumes);
        }
        if volumes.is_empty() {
            println!("No archived volumes.");
        }
        for volume in &volumes {
            println!("{}", volume.as_str().yellow());
        }
        return Ok(());
    };

    let sessions = engine.list_sessions(&volume)?;
    if format == OutputFormat::Json {
        let rows: Vec<SessionRow> = sessions.iter().map(SessionRow::from).collect();
        return print_json(&rows);
    }
    println!("Volume {}: {} sessions", volume.as_str().yellow().bold(), sessions.len());
    for record in &sessions {
        let captured = chrono::DateTime::from_timestamp(record.captured_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {} #{:<4} {:>14} bytes  {}",
            record.name.to_string().cyan(),
            record.sequence,
            record.volume_size,
            captured.dimmed()
        );
    }
    Ok(())
}

fn cmd_delete(engine: &mut Engine, args: DeleteArgs) -> anyhow::Result<()> {
    if !args.yes {
        bail!(
            "deleting {} removes every session; pass --yes to confirm",
            args.volume.as_str()
        );
    }
    engine.delete_volume(&args.volume)?;
    println!("{} Deleted volume {}", "✓".green().bold(), args.volume.as_str().yellow());
    Ok(())
}
