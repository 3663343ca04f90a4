//! The write-ahead journal.
//!
//! Records are appended through a buffered writer positioned inside
//! the log ring. Before every append, space for a Rewind record is
//! reserved; when the next record would cross the end of the ring, a
//! Rewind is emitted and the writer wraps to the start. Block frees
//! are deferred: a freed block only re-enters the freemap when the
//! enclosing transaction commits, so it cannot be reallocated before
//! the free is durable.

use std::ops::{Deref, DerefMut};
use std::time::Instant;

use smallvec::SmallVec;

use super::bitmap::Bitmap;
use super::bufio::ImageWriter;
use super::fsops;
use super::layout::{
    LogHeader, Superblock, LOG_MAGIC_NUM, SECTOR_SIZE, SUPERBLOCK_SECTOR,
};
use super::record::{LogCorrupt, LogEntry, LogRecord, Lsn};
use super::{DiskImage, FsError, V6Fs};

/// Seconds between periodic checkpoints.
const CHECKPOINT_INTERVAL_SECS: u64 = 30;

/// Read and validate the log header of an image.
pub fn read_log_header(image: &DiskImage, sb: &Superblock) -> Result<LogHeader, FsError> {
    let mut sector = [0u8; SECTOR_SIZE];
    image.read_block(&mut sector, sb.s_fsize as u32)?;
    let hdr = LogHeader::decode(&sector);

    if hdr.l_magic != LOG_MAGIC_NUM
        || hdr.l_hdrblock != sb.s_fsize as u32
        || hdr.l_checkpoint < hdr.logstart() * SECTOR_SIZE as u32
    {
        return Err(LogCorrupt::BadHeader.into());
    }
    Ok(hdr)
}

/// The journal write path of one open filesystem.
pub struct Log {
    pub(crate) w: ImageWriter,
    pub(crate) hdr: LogHeader,
    /// A transaction is open.
    pub in_tx: bool,
    /// LSN of the last record written.
    pub sequence: Lsn,
    /// Highest LSN durable in the log.
    pub committed: Lsn,
    /// Highest LSN applied to the filesystem image.
    pub applied: Lsn,
    /// Authoritative free-block map (set bit = free).
    pub freemap: Bitmap,

    datastart: u32,
    fsize: u32,
    checkpoint_time: Instant,
    pub(crate) begin_sequence: Lsn,
    last_balloc: u16,
    /// Blocks freed inside the open transaction; folded into the
    /// freemap at commit.
    freed: SmallVec<[u16; 16]>,
}

impl Log {
    /// Open the journal of an image whose header has been validated.
    pub fn open(image: &DiskImage, sb: &Superblock) -> Result<Self, FsError> {
        let hdr = read_log_header(image, sb)?;

        let mut freemap = Bitmap::new(sb.s_fsize as usize, sb.datastart() as usize);
        image.read_at(
            freemap.data_mut(),
            hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        freemap.tidy();

        let mut w = ImageWriter::new(image.try_clone_file()?);
        w.seek(hdr.l_checkpoint)?;

        // Start one below the header sequence so the first record
        // matches the header if we crash before a checkpoint.
        let sequence = hdr.l_sequence.wrapping_sub(1);

        Ok(Self {
            w,
            in_tx: false,
            sequence,
            committed: sequence,
            applied: sequence,
            freemap,
            datastart: sb.datastart(),
            fsize: sb.s_fsize as u32,
            checkpoint_time: Instant::now(),
            begin_sequence: sequence,
            last_balloc: 0,
            freed: SmallVec::new(),
            hdr,
        })
    }

    /// Append one record, wrapping the ring first when it would not
    /// fit together with a reserved Rewind. Returns the record's LSN.
    pub fn append(&mut self, record: LogRecord) -> Result<Lsn, FsError> {
        let reserve = LogEntry::new(0, LogRecord::Rewind).nbytes() as u32;

        self.sequence = self.sequence.wrapping_add(1);
        let mut entry = LogEntry::new(self.sequence, record);

        let pos = self.w.tell();
        if pos + reserve > self.hdr.logend() * SECTOR_SIZE as u32 {
            LogEntry::new(self.sequence, LogRecord::Rewind).save(&mut self.w)?;
            self.sequence = self.sequence.wrapping_add(1);
            entry.sequence = self.sequence;
            self.w.seek(self.hdr.logstart() * SECTOR_SIZE as u32)?;
        }

        entry.save(&mut self.w)?;
        Ok(self.sequence)
    }

    /// Allocate a block from the freemap near the previous allocation,
    /// logging the allocation when inside a transaction. Returns 0
    /// when no block is free.
    pub fn balloc(&mut self, metadata: bool) -> Result<u16, FsError> {
        let blockno = self.balloc_near(self.last_balloc, metadata)?;
        self.last_balloc = blockno;
        Ok(blockno)
    }

    /// Allocate the first free block at or after `near`.
    pub fn balloc_near(&mut self, near: u16, metadata: bool) -> Result<u16, FsError> {
        let near = if (near as u32) < self.datastart || (near as u32) >= self.fsize {
            self.datastart
        } else {
            near as u32
        };
        let Some(blockno) = self.freemap.find_set(near as usize) else {
            return Ok(0);
        };
        self.freemap.set(blockno, false);
        if self.in_tx {
            self.append(LogRecord::BlockAlloc {
                blockno: blockno as u16,
                zero_on_replay: metadata as u8,
            })?;
        }
        Ok(blockno as u16)
    }

    /// Log a block free. The freemap bit is only set at commit, so the
    /// block cannot be handed out again before the free is durable.
    pub fn bfree(&mut self, blockno: u16) -> Result<(), FsError> {
        assert!(self.in_tx, "bfree outside a transaction");
        self.freed.push(blockno);
        self.append(LogRecord::BlockFree { blockno })?;
        Ok(())
    }

    /// Force buffered records to disk, advancing `committed`.
    pub fn flush(&mut self) -> Result<(), FsError> {
        self.w.flush()?;
        self.committed = if self.in_tx {
            self.begin_sequence
        } else {
            self.sequence
        };
        Ok(())
    }

    /// The on-disk log header as currently held in core.
    pub fn header(&self) -> &LogHeader {
        &self.hdr
    }

    /// Bytes of ring space available before the writer catches up with
    /// the checkpoint.
    pub fn space(&self) -> u32 {
        let pos = self.w.tell();
        let cp = self.hdr.l_checkpoint;
        if cp >= pos {
            cp - pos
        } else {
            self.hdr.logbytes() - (pos - cp)
        }
    }

    pub(crate) fn fold_freed(&mut self) {
        let freed = std::mem::take(&mut self.freed);
        for blockno in freed {
            self.freemap.set(blockno as usize, true);
        }
    }

    pub(crate) fn checkpoint_due(&self) -> bool {
        self.space() < self.hdr.logbytes() / 2
            || self.checkpoint_time.elapsed().as_secs() >= CHECKPOINT_INTERVAL_SECS
    }

    pub(crate) fn touch_checkpoint_time(&mut self) {
        self.checkpoint_time = Instant::now();
    }

    /// Add a journal (header, freemap, ring) to an open filesystem
    /// that lacks one. `log_blocks` of 0 picks a size proportional to
    /// the image.
    pub fn create(fs: &mut V6Fs, log_blocks: u16) -> Result<(), FsError> {
        let sb = &fs.sb;
        let data_blocks = sb.s_fsize as u32 - sb.datastart();
        let mapsize = data_blocks.div_ceil(8 * SECTOR_SIZE as u32) as u16;
        let log_blocks = if log_blocks == 0 {
            sb.s_fsize / 64 + 8
        } else {
            log_blocks
        };

        let hdr = LogHeader {
            l_magic: LOG_MAGIC_NUM,
            l_hdrblock: sb.s_fsize as u32,
            l_logsize: mapsize + log_blocks,
            l_mapsize: mapsize,
            l_checkpoint: 0,
            l_sequence: rand::random::<u32>(),
        };
        let hdr = LogHeader {
            l_checkpoint: hdr.logstart() * SECTOR_SIZE as u32,
            ..hdr
        };

        fs.image
            .set_len(hdr.l_hdrblock as u64 * SECTOR_SIZE as u64)?;
        fs.image.set_len(hdr.logend() as u64 * SECTOR_SIZE as u64)?;

        let freemap = fsops::freemap_snapshot(fs)?;
        fs.image.write_at(
            freemap.data(),
            hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        fs.image.write_block(&hdr.encode(), hdr.l_hdrblock)?;

        fs.sb.s_uselog = 1;
        fs.sb.s_nfree = 0; // the freemap is authoritative now
        fs.image
            .write_block(&fs.sb.encode(), SUPERBLOCK_SECTOR)?;
        Ok(())
    }
}

/// A scoped transaction. Dropping the guard commits; errors during an
/// implicit drop-commit are logged, so prefer [Txn::commit] on paths
/// that can report them. A nested `begin` yields an inactive guard, so
/// an operation composed of smaller logged steps commits once.
pub struct Txn<'a> {
    fs: &'a mut V6Fs,
    active: bool,
}

impl<'a> Txn<'a> {
    /// Commit the transaction now, reporting any failure.
    pub fn commit(mut self) -> Result<(), FsError> {
        let active = self.active;
        self.active = false;
        self.fs.commit_tx(active)
    }
}

impl Deref for Txn<'_> {
    type Target = V6Fs;

    fn deref(&self) -> &V6Fs {
        self.fs
    }
}

impl DerefMut for Txn<'_> {
    fn deref_mut(&mut self) -> &mut V6Fs {
        self.fs
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(error) = self.fs.commit_tx(true) {
            tracing::error!(?error, "implicit transaction commit failed");
        }
    }
}

impl V6Fs {
    /// Open a transaction. Without a journal, or when one is already
    /// open, the returned guard is a no-op.
    pub fn begin(&mut self) -> Result<Txn<'_>, FsError> {
        let mut active = false;
        if let Some(log) = &mut self.log {
            if !log.in_tx {
                log.append(LogRecord::Begin)?;
                log.begin_sequence = log.sequence;
                log.in_tx = true;
                active = true;
            }
        }
        Ok(Txn { fs: self, active })
    }

    pub(crate) fn commit_tx(&mut self, active: bool) -> Result<(), FsError> {
        if !active {
            return Ok(());
        }
        {
            let log = self.log.as_mut().expect("commit without a journal");
            let begin = log.begin_sequence;
            log.append(LogRecord::Commit { sequence: begin })?;
            log.fold_freed();
            log.in_tx = false;
        }
        if self.log.as_ref().unwrap().checkpoint_due() {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Advance the replay start point: make the log durable, write
    /// every patched sector back, persist the freemap, and publish the
    /// new checkpoint in the log header (the header write is what
    /// makes the checkpoint take effect).
    pub fn checkpoint(&mut self) -> Result<(), FsError> {
        {
            let log = self.log.as_mut().expect("checkpoint without a journal");
            assert!(!log.in_tx, "checkpoint inside a transaction");

            log.hdr.l_checkpoint = log.w.tell();
            log.hdr.l_sequence = log.sequence.wrapping_add(1);

            // A null transaction marks the new replay start.
            log.append(LogRecord::Begin)?;
            let begin = log.sequence;
            log.append(LogRecord::Commit { sequence: begin })?;
            log.flush()?;
        }

        if !self.sync() {
            return Err(FsError::Corrupt("cache flush during checkpoint failed"));
        }

        let log = self.log.as_mut().unwrap();
        log.applied = log.committed;
        log.fold_freed();
        self.image.write_at(
            log.freemap.data(),
            log.hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        self.image
            .write_block(&log.hdr.encode(), log.hdr.l_hdrblock)?;
        log.touch_checkpoint_time();
        tracing::debug!(
            checkpoint = log.hdr.l_checkpoint,
            sequence = log.hdr.l_sequence,
            "checkpoint written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::mkfs;
    use crate::v6::OpenFlags;

    fn journaled_fs(dir: &tempfile::TempDir, log_blocks: u16) -> V6Fs {
        let path = dir.path().join("img");
        mkfs::create_image(&path, 512, 64, Some(log_blocks)).unwrap();
        V6Fs::open(&path, OpenFlags::default()).unwrap()
    }

    #[test]
    fn test_append_assigns_increasing_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = journaled_fs(&dir, 8);

        let log = fs.log.as_mut().unwrap();
        let first = log.append(LogRecord::Begin).unwrap();
        let second = log
            .append(LogRecord::Commit { sequence: first })
            .unwrap();
        assert_eq!(second, first.wrapping_add(1));
        assert_eq!(log.sequence, second);
    }

    #[test]
    fn test_append_wraps_with_rewind() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = journaled_fs(&dir, 3);

        let log = fs.log.as_mut().unwrap();
        let logstart = log.hdr.logstart() * SECTOR_SIZE as u32;
        let logend = log.hdr.logend() * SECTOR_SIZE as u32;

        let mut wrapped = false;
        let mut previous = log.w.tell();
        for _ in 0..200 {
            let first = log.append(LogRecord::Begin).unwrap();
            log.append(LogRecord::Commit { sequence: first }).unwrap();
            let pos = log.w.tell();
            if pos < previous {
                wrapped = true;
                assert!(pos >= logstart);
                break;
            }
            previous = pos;
        }
        assert!(wrapped, "two hundred records must overflow a tiny ring");
        assert!(previous <= logend + 64, "records stay near the ring");

        // Keep the image consistent for the implicit shutdown: move the
        // replay start to the current position.
        fs.checkpoint().unwrap();
    }

    #[test]
    fn test_space_shrinks_as_records_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = journaled_fs(&dir, 8);

        let log = fs.log.as_mut().unwrap();
        let before = log.space();
        let first = log.append(LogRecord::Begin).unwrap();
        log.append(LogRecord::Commit { sequence: first }).unwrap();
        assert!(log.space() < before);

        fs.checkpoint().unwrap();
    }

    #[test]
    fn test_deferred_frees_fold_at_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = journaled_fs(&dir, 8);

        // Allocate a block, then free it inside a transaction: the
        // freemap must not hand it out again until the commit.
        let (blockno, free_before) = {
            let log = fs.log.as_mut().unwrap();
            let free_before = log.freemap.count_set();
            (log.balloc_near(0, false).unwrap(), free_before)
        };
        assert_ne!(blockno, 0);

        let mut txn = fs.begin().unwrap();
        txn.log.as_mut().unwrap().bfree(blockno).unwrap();
        assert!(
            !txn.log.as_ref().unwrap().freemap.get(blockno as usize),
            "freed block stays unavailable until commit"
        );
        txn.commit().unwrap();

        let log = fs.log.as_ref().unwrap();
        assert!(log.freemap.get(blockno as usize));
        assert_eq!(log.freemap.count_set(), free_before);
    }

    #[test]
    fn test_balloc_near_prefers_hint() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = journaled_fs(&dir, 8);

        let log = fs.log.as_mut().unwrap();
        let datastart = fs.sb.datastart() as u16;

        // A bad hint falls back to the first free block.
        let low = log.balloc_near(0, false).unwrap();
        assert!(low >= datastart);

        let hinted = log.balloc_near(100, false).unwrap();
        assert!(hinted >= 100);

        log.freemap.set(low as usize, true);
        log.freemap.set(hinted as usize, true);
    }
}
