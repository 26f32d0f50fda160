//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Snapshot of walker/replay progress, sampled from the session counters so
/// copy throughput and replay volume are visible in logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopierSnapshot {
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub chunks_copied: u64,
    pub replayed_writes: u64,
    pub replayed_bytes: u64,
    pub structural_replays: u64,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

/// Emit structured copy/replay metrics. Callers should pass in a sampled
/// snapshot to avoid excessive log volume.
pub fn log_copier_metrics(snapshot: CopierSnapshot, level_warn: bool) {
    if level_warn {
        warn!(
            target = "hotbak::copier",
            files_copied = snapshot.files_copied,
            bytes_copied = snapshot.bytes_copied,
            chunks_copied = snapshot.chunks_copied,
            replayed_writes = snapshot.replayed_writes,
            replayed_bytes = snapshot.replayed_bytes,
            structural_replays = snapshot.structural_replays,
            "copier_stalled"
        );
    } else {
        info!(
            target = "hotbak::copier",
            files_copied = snapshot.files_copied,
            bytes_copied = snapshot.bytes_copied,
            chunks_copied = snapshot.chunks_copied,
            replayed_writes = snapshot.replayed_writes,
            replayed_bytes = snapshot.replayed_bytes,
            structural_replays = snapshot.structural_replays,
            "copier_snapshot"
        );
    }
}
