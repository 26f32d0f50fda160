use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod cli;
pub mod copier;
pub mod engine;
pub mod logging;
pub mod track;
pub mod verify;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid source directory: {0}")]
    InvalidSourceDir(String),
    #[error("invalid destination directory: {0}")]
    InvalidDestDir(String),
    #[error("a backup session is already active")]
    SessionActive,
    #[error("no backup session is active")]
    NoActiveSession,
    #[error("destination replay failed for {path}")]
    Replay {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("copy failed for {path}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backup thread panicked")]
    WalkerPanicked,
    #[error("trees differ in {0} place(s)")]
    TreesDiffer(usize),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    // Initialize logging before doing anything else. Defaults to human format for the CLI.
    logging::init_logging(logging::LogFormat::Human)?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
