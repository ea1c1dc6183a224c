//! deferkv Durable Log Tool
//!
//! Inspect, verify and compact a deferkv durable log file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use deferkv::config::WalSyncStrategy;
use deferkv::wal::{DurableLog, WalRecovery};
use tracing_subscriber::{fmt, EnvFilter};

/// deferkv log tool
#[derive(Parser, Debug)]
#[command(name = "deferkv-wal")]
#[command(about = "Inspect and maintain a deferkv durable log")]
#[command(version)]
struct Args {
    /// Log file
    #[arg(short, long, default_value = "./deferkv_data/deferkv.wal")]
    log: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List logged writes with their flushed flag
    Dump {
        /// Only show writes not yet flushed
        #[arg(short, long)]
        unflushed: bool,
    },

    /// Check frame checksums without modifying the file
    Verify,

    /// Drop flushed writes (and any corrupt tail) from the log
    Compact,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,deferkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> deferkv::Result<()> {
    match &args.command {
        Commands::Dump { unflushed } => {
            let records = DurableLog::scan(&args.log)?;
            for record in records.iter().filter(|r| !*unflushed || !r.flushed) {
                println!(
                    "{:>10}  {:<8}  {:>13}  {}  ({} bytes)",
                    record.sequence_id,
                    if record.flushed { "flushed" } else { "PENDING" },
                    record.written_at,
                    record.key,
                    record.value.len()
                );
            }
            let pending = records.iter().filter(|r| !r.flushed).count();
            println!("{} writes, {} pending", records.len(), pending);
        }
        Commands::Verify => {
            let result = WalRecovery::verify(&args.log)?;
            println!("entries:    {}", result.entries_recovered);
            println!("corrupted:  {}", result.entries_corrupted);
            println!("last seq:   {}", result.last_seq);
            println!("valid size: {} bytes", result.valid_bytes);
            if result.entries_corrupted > 0 {
                std::process::exit(2);
            }
        }
        Commands::Compact => {
            let (log, recovery) = DurableLog::open(&args.log, WalSyncStrategy::EveryWrite)?;
            if recovery.was_truncated {
                tracing::warn!("Dropped corrupt tail before compacting");
            }
            let result = log.compact()?;
            println!(
                "kept {} writes, {} -> {} bytes",
                result.records_kept, result.bytes_before, result.bytes_after
            );
        }
    }
    Ok(())
}
