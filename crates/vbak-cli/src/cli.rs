use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vbak_types::{SessionName, TypeError, VolumeName};

#[derive(Parser)]
#[command(
    name = "vbak",
    about = "vbak: incremental, deduplicating block-volume backups",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file
    #[arg(short, long, global = true, default_value = "vbak.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record volume changes without sending
    Monitor(VolumesArgs),
    /// Send changed chunks as a new session
    Send(VolumesArgs),
    /// Restore a session into an image file
    Receive(ReceiveArgs),
    /// Fetch and hash-check every chunk of a session
    Verify(SessionArgs),
    /// Compare a session with the current volume
    Diff(DiffArgs),
    /// Merge old sessions into their successor
    Prune(PruneArgs),
    /// List archived volumes or a volume's sessions
    List(ListArgs),
    /// Delete a volume from the archive and destination
    Delete(DeleteArgs),
}

pub fn parse_volume(value: &str) -> Result<VolumeName, TypeError> {
    VolumeName::new(value)
}

#[derive(Args)]
pub struct VolumesArgs {
    /// Volumes to process (default: every enabled volume)
    #[arg(value_parser = parse_volume)]
    pub volumes: Vec<VolumeName>,
}

#[derive(Args)]
pub struct SessionArgs {
    #[arg(value_parser = parse_volume)]
    pub volume: VolumeName,
    /// Session to use (default: the newest)
    #[arg(short, long)]
    pub session: Option<SessionName>,
}

#[derive(Args)]
pub struct ReceiveArgs {
    #[command(flatten)]
    pub target: SessionArgs,
    /// Image file to write
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct DiffArgs {
    #[command(flatten)]
    pub target: SessionArgs,
    /// Mark differing chunks so the next send repairs them
    #[arg(long)]
    pub remap: bool,
}

#[derive(Args)]
pub struct PruneArgs {
    #[arg(value_parser = parse_volume)]
    pub volume: VolumeName,
    /// A single session
    #[arg(short, long, conflicts_with_all = ["from", "to", "before"])]
    pub session: Option<SessionName>,
    /// First session of an inclusive range
    #[arg(long, requires = "to", conflicts_with = "before")]
    pub from: Option<SessionName>,
    /// Last session of an inclusive range
    #[arg(long, requires = "from", conflicts_with = "before")]
    pub to: Option<SessionName>,
    /// Every session older than this one
    #[arg(long)]
    pub before: Option<SessionName>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Show the sessions of this volume
    #[arg(value_parser = parse_volume)]
    pub volume: Option<VolumeName>,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[arg(value_parser = parse_volume)]
    pub volume: VolumeName,
    /// Required to confirm the deletion
    #[arg(long)]
    pub yes: bool,
}
