//! Command-line argument parsing and the `--input` seed-file reader.
//!
//! Deliberately thin: this module owns no domain logic, only the argument
//! surface. Uses a `clap::Parser` derive rather than hand-rolled `argv`
//! scanning; a duplicate `--input` flag is still rejected as an argument
//! error, and blank lines in an `--input` file are still ignored.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Parser;

use crate::error::{DedupeError, Result};

/// `fastdedupe [OPTIONS] <FILES>...`
#[derive(Parser, Debug)]
#[command(name = "fastdedupe", about = "Offline block-level file deduplication", version)]
pub struct Cli {
    /// Persistent-store file.
    #[arg(long = "db-file", value_name = "FILE", default_value = "files.db")]
    pub db_file: PathBuf,

    /// Text file of additional seed paths, one per line. Can only be given
    /// once; a second occurrence is an argument error, matching the
    /// original's `file_as_input` guard.
    #[arg(long = "input", value_name = "FILE")]
    pub input: Vec<PathBuf>,

    /// Walk directory seeds recursively.
    #[arg(long)]
    pub recursive: bool,

    /// Re-check clean records against the kernel extent map and migrate
    /// index membership on change, without a full content re-hash.
    #[arg(long = "update-extents")]
    pub update_extents: bool,

    /// Run the dedupe phase after reconciliation.
    #[arg(long)]
    pub dedupe: bool,

    /// Seed paths (files or, with `--recursive`, directories).
    #[arg(value_name = "PATH")]
    pub files: Vec<PathBuf>,
}

/// The fully resolved set of options the driver needs, after merging
/// `--input` seeds into the positional file list and validating the
/// argument-error conditions below.
pub struct Options {
    pub db_file: PathBuf,
    pub recursive: bool,
    pub update_extents: bool,
    pub dedupe: bool,
    pub seeds: BTreeSet<PathBuf>,
}

impl Cli {
    /// Parse `argv`, reconcile `--input` with the positional seeds, and
    /// validate the "no seed paths" and "duplicate --input" argument-error
    /// conditions. Unknown flags are already rejected by `clap` itself.
    pub fn parse_options(argv: impl IntoIterator<Item = String>) -> Result<Options> {
        let cli = Cli::try_parse_from(argv).map_err(|err| {
            use clap::error::ErrorKind;
            // `--help`/`--version` are not argument errors: clap's own exit
            // path prints the right text and uses exit code 0.
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                err.exit();
            }
            DedupeError::InvalidArgument(err.to_string())
        })?;

        if cli.input.len() > 1 {
            return Err(DedupeError::InvalidArgument("--input may only be given once".to_string()));
        }

        let mut seeds: BTreeSet<PathBuf> = cli.files.into_iter().collect();
        if let Some(input_file) = cli.input.into_iter().next() {
            for line in read_input_file(&input_file)? {
                seeds.insert(line);
            }
        }

        if seeds.is_empty() {
            return Err(DedupeError::InvalidArgument("no seed paths given".to_string()));
        }

        Ok(Options {
            db_file: cli.db_file,
            recursive: cli.recursive,
            update_extents: cli.update_extents,
            dedupe: cli.dedupe,
            seeds,
        })
    }
}

/// Read additional seed paths from `--input`, one per line. Blank lines are
/// ignored.
fn read_input_file(path: &std::path::Path) -> Result<Vec<PathBuf>> {
    let contents = std::fs::read_to_string(path).map_err(|err| DedupeError::io(format!("read input file {path:?}"), &err))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}
