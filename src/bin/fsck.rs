use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vaultfs::v6::{fsck, OpenFlags, V6Fs};

#[derive(Parser)]
#[command(name = "fsck", about = "Check (and repair) a V6 filesystem image")]
struct Cli {
    /// Apply repairs instead of only reporting them
    #[arg(short = 'y')]
    yes: bool,

    /// Image file to check
    image: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let flags = OpenFlags {
        readonly: !cli.yes,
        nolog: true,
        ..Default::default()
    };

    let result = (|| {
        let mut fs = V6Fs::open_with_caches(&cli.image, flags, 30, 100)?;
        let clean = fsck::fsck(&mut fs, cli.yes)?;
        fs.close()?;
        Ok::<bool, vaultfs::v6::FsError>(clean)
    })();

    match result {
        // With -y a corrupt image has been repaired, which is success.
        Ok(clean) if clean || cli.yes => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("fsck: {}: {error}", cli.image.display());
            ExitCode::FAILURE
        }
    }
}
