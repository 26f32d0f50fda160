//! Implementation of `hotbak copy` subcommand.

use std::path::PathBuf;
use std::sync::mpsc;

use clap::Args;
use tracing::info;

use crate::engine::{Engine, DEFAULT_CHUNK_SIZE};
use crate::logging;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct CopyArgs {
    /// Source directory to back up; may be written to while the copy runs
    #[arg(short = 's', long = "source")]
    pub source: PathBuf,

    /// Destination directory receiving the backup
    #[arg(short = 'd', long = "dest")]
    pub dest: PathBuf,

    /// Hold capture armed after the tree copy completes, until Ctrl+C
    #[arg(long)]
    pub hold: bool,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,

    /// Walker chunk size in bytes
    #[arg(long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

pub fn execute(args: CopyArgs) -> Result<()> {
    let engine =
        Engine::new(args.source.clone(), args.dest.clone()).map(|e| e.with_chunk_size(args.chunk_size))?;

    if args.hold {
        engine.set_keep_capturing(true);
    }

    let handle = engine.start_backup()?;

    if args.hold {
        info!("capture held after tree copy; press Ctrl+C to finish");
        let (tx, rx) = mpsc::channel();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;
        let _ = rx.recv();
        engine.set_keep_capturing(false);
    }

    let report = engine.finish_backup(handle)?;
    logging::log_copier_metrics(
        logging::CopierSnapshot {
            files_copied: report.files_copied,
            bytes_copied: report.bytes_copied,
            chunks_copied: report.chunks_copied,
            replayed_writes: report.replayed_writes,
            replayed_bytes: report.replayed_bytes,
            structural_replays: report.structural_replays,
        },
        false,
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            source = %report.source.display(),
            dest = %report.dest.display(),
            files = report.files_copied,
            bytes = report.bytes_copied,
            "backup complete"
        );
    }
    Ok(())
}
