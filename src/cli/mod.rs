//! CLI module; subcommands live here.

use clap::{CommandFactory, Parser, Subcommand};

use crate::Result;

pub mod copy;
pub mod verify;

#[derive(Debug, Clone)]
pub enum Command {
    Copy(copy::CopyArgs),
    Verify(verify::VerifyArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Copy(c) => copy::execute(c),
        Command::Verify(v) => verify::execute(v),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "hotbak", version, about = "Hot backup of a live directory tree")]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Copy a source tree into a destination while it may still be written
    /// to, finishing with a per-file consistent backup.
    Copy(copy::CopyArgs),
    /// Recursively compare two trees byte for byte.
    Verify(verify::VerifyArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Copy(args)) => Command::Copy(args),
        Some(Subcommands::Verify(args)) => Command::Verify(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
