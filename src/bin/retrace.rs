//! retrace: trace inspection CLI
//!
//! ## Commands
//!
//! - **info**: header, fingerprint and recording settings
//! - **pids**: every process id that owns a segment
//! - **dump**: decoded message listing of one process segment
//! - **fork-path**: expand a fork path to its per-fork bit string
//!
//! ## Example Usage
//!
//! ```bash
//! retrace info run.trace
//! retrace dump run.trace --pid 4242 --json
//! retrace fork-path child-2-1-1
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use retrace::inspect;
use retrace::wire::list_pids;
use retrace::ForkPath;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "retrace", author, version, about = "Inspect record/replay traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the trace header
    Info {
        trace: PathBuf,
        /// Print the header as JSON
        #[arg(long)]
        json: bool,
    },
    /// List process ids with a segment in the trace
    Pids { trace: PathBuf },
    /// List decoded messages of one process segment
    Dump {
        trace: PathBuf,
        /// Process segment to list (default: the root process)
        #[arg(long)]
        pid: Option<u32>,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Expand a fork path ("1101", "child", "child-2-1-1")
    ForkPath { path: String },
}

fn open(path: &Path) -> Result<BufReader<File>> {
    debug!(path = %path.display(), "opening trace");
    let file = File::open(path).with_context(|| format!("opening trace {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Info { trace, json } => {
            let header = inspect::header(open(&trace)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&header)?);
                return Ok(());
            }
            println!("session:          {}", header.session_id);
            println!("recorded at:      {}", header.recorded_at.to_rfc3339());
            println!("format version:   {}", header.format_version);
            println!("root pid:         {}", header.root_pid);
            println!("monitor level:    {}", header.monitor_level);
            println!("stacktraces:      {}", header.stacktraces);
            println!("checkpoint calls: {}", header.checkpoint_calls);
            if !header.argv.is_empty() {
                println!("argv:             {}", header.argv.join(" "));
            }
            for (key, value) in &header.metadata {
                println!("meta {}: {}", key, value);
            }
            println!("engine version:   {}", header.fingerprint.engine_version);
            for (name, digest) in &header.fingerprint.checksums {
                println!("  {} {}", digest, name);
            }
        }
        Commands::Pids { trace } => {
            for pid in list_pids(open(&trace)?)? {
                println!("{}", pid);
            }
        }
        Commands::Dump { trace, pid, json } => {
            for entry in inspect::dump(open(&trace)?, pid)? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    println!(
                        "{:>6} {:>8}  [{}] {}",
                        entry.index, entry.offset, entry.thread, entry.message
                    );
                }
            }
        }
        Commands::ForkPath { path } => {
            let parsed = ForkPath::parse(&path).with_context(|| format!("parsing {:?}", path))?;
            match parsed {
                ForkPath::AlwaysParent => println!("parent (every fork)"),
                ForkPath::AlwaysChild => println!("child (every fork)"),
                ForkPath::Bits(_) => println!("{}", parsed.expanded()),
            }
        }
    }
    Ok(())
}
