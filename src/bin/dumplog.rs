use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vaultfs::v6::bufio::ImageReader;
use vaultfs::v6::layout::{Superblock, SECTOR_SIZE, SUPERBLOCK_SECTOR};
use vaultfs::v6::log::read_log_header;
use vaultfs::v6::record::LogEntry;
use vaultfs::v6::{DiskImage, FsError};

#[derive(Parser)]
#[command(name = "dumplog", about = "Print the journal records of a V6 image")]
struct Cli {
    /// Image file whose journal should be printed
    image: PathBuf,

    /// Byte offset to start from, or `c` for the checkpoint
    /// (default: the start of the log ring)
    start: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match dump(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("dumplog: {}: {error}", cli.image.display());
            ExitCode::FAILURE
        }
    }
}

fn dump(cli: &Cli) -> Result<(), FsError> {
    let image = DiskImage::open(&cli.image, true)?;

    let mut sector = [0u8; SECTOR_SIZE];
    image.read_block(&mut sector, SUPERBLOCK_SECTOR)?;
    let sb = Superblock::decode(&sector);
    let hdr = read_log_header(&image, &sb)?;

    let logstart = hdr.logstart() * SECTOR_SIZE as u32;
    let start = match cli.start.as_deref() {
        Some("c") => hdr.l_checkpoint,
        Some(text) => {
            let offset: u32 = text
                .parse()
                .map_err(|_| FsError::InvalidArgument("start must be a number or `c`"))?;
            offset.max(logstart)
        }
        None => logstart,
    };

    let mut reader = ImageReader::new(image.try_clone_file()?);
    reader.seek(start);

    loop {
        println!("[offset {}]", reader.tell());
        match LogEntry::load(&mut reader) {
            Ok(entry) => println!("{}", entry.show(Some(&sb))),
            Err(error) => {
                println!("* Exiting because: {error}");
                return Ok(());
            }
        }
    }
}
