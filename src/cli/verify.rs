//! Implementation of `hotbak verify` subcommand.

use std::path::PathBuf;

use clap::Args;
use tracing::{info, warn};

use crate::verify::diff_trees;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    /// First tree (typically the source)
    pub left: PathBuf,

    /// Second tree (typically the backup)
    pub right: PathBuf,
}

pub fn execute(args: VerifyArgs) -> Result<()> {
    let differences = diff_trees(&args.left, &args.right)?;
    if differences.is_empty() {
        info!(
            left = %args.left.display(),
            right = %args.right.display(),
            "trees identical"
        );
        return Ok(());
    }
    for diff in &differences {
        warn!("{diff}");
    }
    Err(Error::TreesDiffer(differences.len()).into())
}
