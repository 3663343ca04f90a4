use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vaultfs::v6::{replay, OpenFlags, V6Fs};

#[derive(Parser)]
#[command(name = "apply", about = "Force journal replay on a V6 filesystem image")]
struct Cli {
    /// Image file whose journal should be replayed
    image: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = (|| {
        // Open without the journal write path so the on-disk log is
        // left exactly as the crash produced it, then roll it forward.
        let mut fs = V6Fs::open(
            &cli.image,
            OpenFlags {
                nolog: true,
                ..Default::default()
            },
        )?;
        replay::replay(&mut fs)?;
        fs.close()
    })();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("apply: {}: {error}", cli.image.display());
            ExitCode::FAILURE
        }
    }
}
