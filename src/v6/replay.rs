//! Crash recovery: roll the filesystem image forward to the last
//! committed transaction.
//!
//! Replay starts at the header's checkpoint and walks the ring.
//! Before applying anything, each prospective transaction is
//! pre-scanned: if it does not open with a Begin or no matching Commit
//! is found before the log runs out, the records are ignored —
//! rollback by inaction, since nothing a partial transaction described
//! was allowed to reach the filesystem image.

use super::bitmap::Bitmap;
use super::bufio::ImageReader;
use super::layout::{LogHeader, SECTOR_SIZE};
use super::log::read_log_header;
use super::record::{LogCorrupt, LogEntry, LogReadError, LogRecord, Lsn};
use super::{FsError, V6Fs};

struct Replay {
    r: ImageReader,
    hdr: LogHeader,
    sequence: Lsn,
    freemap: Bitmap,
}

impl Replay {
    /// Read the next entry, following a Rewind to the ring start and
    /// enforcing the expected sequence numbering.
    fn read_next(&mut self) -> Result<LogEntry, LogReadError> {
        let entry = self.load_checked()?;
        if entry.record == LogRecord::Rewind {
            self.r.seek(self.hdr.logstart() * SECTOR_SIZE as u32);
            return self.load_checked();
        }
        Ok(entry)
    }

    fn load_checked(&mut self) -> Result<LogEntry, LogReadError> {
        let entry = LogEntry::load(&mut self.r)?;
        if entry.sequence != self.sequence {
            return Err(LogCorrupt::BadSequence.into());
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(entry)
    }

    /// Without consuming input, check that the reader is positioned at
    /// a complete Begin..Commit transaction.
    fn check_tx(&mut self) -> bool {
        let start_pos = self.r.tell();
        let start_seq = self.sequence;

        let result = self.check_tx_inner();
        self.r.seek(start_pos);
        match result {
            Ok(()) => {
                self.sequence = start_seq;
                true
            }
            Err(error) => {
                // Keep the advanced sequence so a later checkpoint sits
                // above every LSN the log has ever used.
                tracing::info!(%error, "reached log end");
                false
            }
        }
    }

    fn check_tx_inner(&mut self) -> Result<(), LogReadError> {
        let entry = self.read_next()?;
        if entry.record != LogRecord::Begin {
            return Err(LogCorrupt::BadTransaction("no LogBegin").into());
        }
        let begin_seq = entry.sequence;

        loop {
            let entry = self.read_next()?;
            if let LogRecord::Commit { sequence } = entry.record {
                if sequence != begin_seq {
                    return Err(LogCorrupt::BadTransaction(
                        "begin/commit sequence mismatch",
                    )
                    .into());
                }
                return Ok(());
            }
        }
    }

    fn apply(&mut self, fs: &mut V6Fs, entry: &LogEntry) -> Result<(), FsError> {
        match &entry.record {
            LogRecord::Begin | LogRecord::Commit { .. } | LogRecord::Rewind => Ok(()),
            LogRecord::Patch {
                blockno,
                offset_in_block,
                bytes,
            } => {
                let bp = fs.bread(*blockno)?;
                let mut b = bp.lock();
                let at = *offset_in_block as usize;
                b.data.mem[at..at + bytes.len()].copy_from_slice(bytes);
                b.mark_dirty();
                Ok(())
            }
            LogRecord::BlockAlloc {
                blockno,
                zero_on_replay,
            } => {
                if *zero_on_replay != 0 {
                    let bp = fs.bget(*blockno)?;
                    let mut b = bp.lock();
                    b.data.mem.fill(0);
                    b.mark_dirty();
                }
                self.freemap.set(*blockno as usize, false);
                Ok(())
            }
            LogRecord::BlockFree { blockno } => {
                self.freemap.set(*blockno as usize, true);
                Ok(())
            }
        }
    }
}

/// Replay the journal of a dirty image, then persist the freemap,
/// advance the checkpoint, and mark the filesystem clean.
pub fn replay(fs: &mut V6Fs) -> Result<(), FsError> {
    let hdr = read_log_header(&fs.image, &fs.sb)?;

    let mut freemap = Bitmap::new(fs.sb.s_fsize as usize, fs.sb.datastart() as usize);
    fs.image.read_at(
        freemap.data_mut(),
        hdr.mapstart() as u64 * SECTOR_SIZE as u64,
    )?;
    freemap.tidy();

    let mut r = ImageReader::new(fs.image.try_clone_file()?);
    r.seek(hdr.l_checkpoint);
    let mut replay = Replay {
        r,
        sequence: hdr.l_sequence,
        freemap,
        hdr,
    };

    let first = replay.sequence;
    while replay.check_tx() {
        loop {
            let entry = replay.read_next().map_err(FsError::from)?;
            replay.apply(fs, &entry)?;
            if matches!(entry.record, LogRecord::Commit { .. }) {
                break;
            }
        }
    }
    tracing::info!(
        from = first,
        to = replay.sequence,
        "played log entries"
    );

    replay.hdr.l_sequence = replay.sequence;
    replay.hdr.l_checkpoint = replay.r.tell();
    fs.image.write_at(
        replay.freemap.data(),
        replay.hdr.mapstart() as u64 * SECTOR_SIZE as u64,
    )?;

    // Inode allocations are not journaled; force a table re-scan.
    fs.sb.s_fmod = 1;
    fs.sb.s_ninode = 0;

    // Make the replayed sectors durable before the new checkpoint
    // becomes visible in the header.
    if !fs.sync() {
        return Err(FsError::Corrupt("cache flush during replay failed"));
    }

    fs.image
        .write_block(&replay.hdr.encode(), fs.sb.s_fsize as u32)?;
    fs.sb.s_fmod = 1;
    fs.unclean = false;
    Ok(())
}
