use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vaultfs::v6::mkfs::create_image;

#[derive(Parser)]
#[command(name = "mkfs", about = "Create a V6 filesystem image")]
struct Cli {
    /// Image file to create (must not exist)
    image: PathBuf,

    /// Size of the filesystem in sectors (capped at 65535)
    nblocks: Option<u32>,

    /// Number of inodes (default: nblocks / 4)
    ninodes: Option<u32>,

    /// Journal size in sectors; 0 picks a default proportional to the
    /// image. Omit to create an image without a journal.
    log_blocks: Option<u16>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let nblocks = cli.nblocks.unwrap_or(0xffff).min(0xffff);
    if nblocks == 0 {
        eprintln!("mkfs: nblocks must be positive");
        return ExitCode::from(2);
    }
    let ninodes = cli.ninodes.unwrap_or(nblocks / 4).max(1);

    match create_image(&cli.image, nblocks, ninodes, cli.log_blocks) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("mkfs: {}: {error}", cli.image.display());
            ExitCode::FAILURE
        }
    }
}
