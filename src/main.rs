//! layertar - deterministic container layer tarball assembler.
//!
//! Builds a single layer tar from a list of inputs: files, empty files,
//! pre-built tar archives, Debian packages and symlinks. Given identical
//! inputs the output is byte-identical across runs.

use anyhow::Result;
use clap::Parser;

use layertar::cli::{self, Args};

fn main() -> Result<()> {
    let argv = cli::expand_arg_files(std::env::args().collect())?;
    let args = Args::parse_from(argv);
    cli::run(&args)
}
