//! A journaling filesystem in the Version-6 UNIX on-disk format.
//!
//! [`V6Fs`] mediates every access to an image file through two bounded
//! caches (sectors and inodes). Mutating operations run inside a
//! transaction ([`log::Txn`]) when the image carries a journal: every
//! metadata change is logged as a byte-granular patch before the cache
//! copy is allowed back to disk, so a crash at any point rolls forward
//! to the last committed transaction on the next mount.

pub mod bitmap;
pub mod bufio;
pub mod cache;
pub mod cursor;
pub mod fsck;
pub mod fsops;
pub mod inode;
pub mod layout;
pub mod log;
pub mod mkfs;
pub mod record;
pub mod replay;

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use self::cache::{
    BlockData, BufRef, Cache, CacheEntry, InodeRef, LookupError, DEFAULT_NBUF,
    DEFAULT_NINODE,
};
use self::layout::{
    iblock, iindex, DiskInode, Superblock, BOOTBLOCK_MAGIC_NUM, INODES_PER_BLOCK,
    INODE_SIZE, ROOT_INUMBER, SECTOR_SIZE, SUPERBLOCK_SECTOR,
};
use self::log::Log;
use self::record::{LogCorrupt, LogReadError, Lsn};

#[derive(Debug, thiserror::Error)]
/// Errors surfaced by filesystem operations.
pub enum FsError {
    #[error(transparent)]
    /// An underlying read, write, or stat failed.
    Io(#[from] io::Error),
    #[error(transparent)]
    /// The journal is structurally corrupt.
    LogCorrupt(#[from] LogCorrupt),
    #[error("{0}")]
    /// A bounded resource (cache slots, free blocks, free inodes) ran out.
    Exhausted(&'static str),
    #[error("invalid argument: {0}")]
    /// API misuse by the caller.
    InvalidArgument(&'static str),
    #[error("filesystem corrupt: {0}")]
    /// An on-disk invariant does not hold.
    Corrupt(&'static str),
    #[error("not a directory")]
    /// Path traversal hit a non-directory component.
    NotDir,
    #[error("no such file or directory")]
    /// A path component does not exist.
    NoEntry,
    #[error("file exists")]
    /// Exclusive creation found an existing entry.
    Exists,
    #[error("directory not empty")]
    /// rmdir on a directory that still has entries.
    NotEmpty,
    #[error("name too long")]
    /// A path component exceeds the 14-byte name limit.
    NameTooLong,
    #[error("file too large")]
    /// An operation would exceed the maximum file size.
    FileTooBig,
    #[error("permission denied")]
    /// The permission callback refused access.
    AccessDenied,
}

impl From<LogReadError> for FsError {
    fn from(value: LogReadError) -> Self {
        match value {
            LogReadError::Corrupt(c) => FsError::LogCorrupt(c),
            LogReadError::Io(e) => FsError::Io(e),
        }
    }
}

/// Returns true on the write that `CRASH_AT=n` asks to kill, once.
pub(crate) fn should_crash() -> bool {
    static REMAINING: OnceLock<Option<AtomicI64>> = OnceLock::new();
    let counter = REMAINING.get_or_init(|| {
        std::env::var("CRASH_AT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .map(AtomicI64::new)
    });
    match counter {
        Some(left) => left.fetch_sub(1, Ordering::SeqCst) == 1,
        None => false,
    }
}

fn crash() -> ! {
    eprintln!("crashing because of CRASH_AT environment variable");
    std::process::abort();
}

/// The raw image file, addressed by sector.
pub struct DiskImage {
    file: File,
}

impl DiskImage {
    /// Open an image file.
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Duplicate the underlying handle for a buffered reader/writer.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Read one sector.
    pub fn read_block(&self, mem: &mut [u8], blockno: u32) -> io::Result<()> {
        self.file
            .read_exact_at(&mut mem[..SECTOR_SIZE], blockno as u64 * SECTOR_SIZE as u64)
    }

    /// Write one sector. Honors the `CRASH_AT` test hook.
    pub fn write_block(&self, mem: &[u8], blockno: u32) -> io::Result<()> {
        if should_crash() {
            crash();
        }
        self.file
            .write_all_at(&mem[..SECTOR_SIZE], blockno as u64 * SECTOR_SIZE as u64)
    }

    /// Read raw bytes at an absolute offset.
    pub fn read_at(&self, mem: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(mem, offset)
    }

    /// Write raw bytes at an absolute offset.
    pub fn write_at(&self, mem: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(mem, offset)
    }

    /// Grow or shrink the image file.
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Options controlling how an image is opened.
pub struct OpenFlags {
    /// Open read-only; no replay, no journal, no superblock updates.
    pub readonly: bool,
    /// Refuse an image that was not cleanly unmounted and cannot be
    /// replayed.
    pub must_be_clean: bool,
    /// Do not open (or replay) the journal even if present.
    pub nolog: bool,
    /// Create a journal on a legacy image that lacks one.
    pub mklog: bool,
    /// Permit replay when combined with `must_be_clean`.
    pub replay: bool,
}

/// An open V6 filesystem.
pub struct V6Fs {
    /// Opened read-only.
    pub readonly: bool,
    /// The image was dirty when opened.
    pub unclean: bool,
    /// The image file.
    pub image: DiskImage,
    /// In-core superblock.
    pub sb: Superblock,
    /// The journal, when the image has one and it is in use.
    pub log: Option<Log>,
    pub(crate) bcache: Cache<BlockData>,
    pub(crate) icache: Cache<DiskInode>,
    closed: bool,
}

impl V6Fs {
    /// Open `path` with default cache sizes.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self, FsError> {
        Self::open_with_caches(path, flags, DEFAULT_NBUF, DEFAULT_NINODE)
    }

    /// Open `path` with explicit cache capacities.
    pub fn open_with_caches(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        nbuf: usize,
        ninode: usize,
    ) -> Result<Self, FsError> {
        let image = DiskImage::open(path.as_ref(), flags.readonly)?;

        let mut sector = [0u8; SECTOR_SIZE];
        image.read_block(&mut sector, SUPERBLOCK_SECTOR)?;
        let mut sb = Superblock::decode(&sector);

        let mut magic = [0u8; 2];
        image.read_at(&mut magic, 0)?;
        if u16::from_le_bytes(magic) != BOOTBLOCK_MAGIC_NUM {
            return Err(FsError::Corrupt("boot block missing magic number"));
        }

        let unclean = sb.s_dirty != 0;

        // Legacy V6 images can have garbage where the log fields live.
        if sb.s_uselog != 0 {
            if let Err(error) = log::read_log_header(&image, &sb) {
                tracing::warn!(?error, "invalid log header, clearing s_uselog");
                sb.s_uselog = 0;
            }
        }

        let replay_allowed = flags.replay && !flags.nolog;
        if flags.must_be_clean && unclean && (sb.s_uselog == 0 || !replay_allowed) {
            return Err(FsError::Corrupt("file system not cleanly unmounted"));
        }

        if !flags.readonly {
            sb.s_fmod = 0;
        }

        let mut fs = Self {
            readonly: flags.readonly,
            unclean,
            image,
            sb,
            log: None,
            bcache: Cache::new("buffer", nbuf),
            icache: Cache::new("inode", ninode),
            closed: false,
        };

        if !flags.nolog && !flags.readonly {
            if fs.sb.s_uselog == 0 && flags.mklog {
                tracing::info!("creating journal and freemap");
                Log::create(&mut fs, 0)?;
            }
            if fs.sb.s_uselog != 0 {
                if fs.unclean {
                    replay::replay(&mut fs)?;
                }
                fs.log = Some(Log::open(&fs.image, &fs.sb)?);
            }
        }

        if !fs.readonly {
            fs.sb.s_dirty = 1;
            fs.write_superblock()?;
        }
        Ok(fs)
    }

    /// Cleanly shut down: checkpoint (or sync), clear `s_dirty`, and
    /// discard the caches. Dropping the filesystem does the same with
    /// errors only logged.
    pub fn close(mut self) -> Result<(), FsError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.readonly {
            if self.log.is_some() {
                self.checkpoint()?;
                self.log = None;
            } else if !self.sync() {
                return Err(FsError::Corrupt("sync failed during shutdown"));
            }
            self.sb.s_fmod = 0;
            if !self.unclean {
                self.sb.s_dirty = 0;
            }
            self.write_superblock()?;
        }
        self.bcache.invalidate();
        self.icache.invalidate();
        Ok(())
    }

    /// Newest durable LSN, if journaling.
    pub(crate) fn committed(&self) -> Option<Lsn> {
        self.log.as_ref().map(|l| l.committed)
    }

    /// Write the in-core superblock to disk.
    pub fn write_superblock(&self) -> Result<(), FsError> {
        self.image
            .write_block(&self.sb.encode(), SUPERBLOCK_SECTOR)?;
        Ok(())
    }

    /// Write back all dirty cache entries (inodes first, then
    /// buffers), plus the superblock in the legacy regime. Returns
    /// false if any write failed.
    pub fn sync(&mut self) -> bool {
        let committed = self.committed();
        let V6Fs {
            sb,
            image,
            bcache,
            icache,
            ..
        } = self;

        let mut ok = icache.flush(committed, &mut |entry| {
            writeback_inode(sb, image, bcache, committed, entry)
        });
        if !bcache.flush(committed, &mut |entry| {
            Ok(image.write_block(&entry.data.mem, entry.id as u32)?)
        }) {
            ok = false;
        }

        // With a journal there is nothing interesting in the
        // superblock: the freemap replaces the free list and the inode
        // cache is rebuilt on mount.
        if self.log.is_none() && self.sb.s_fmod != 0 {
            self.sb.s_fmod = 0;
            if let Err(error) = self.write_superblock() {
                tracing::error!(?error, "superblock write failed");
                ok = false;
            }
        }
        ok
    }

    /// Discard every cached block and inode and re-read the superblock.
    pub fn invalidate(&mut self) -> Result<(), FsError> {
        self.icache.invalidate();
        self.bcache.invalidate();
        let mut sector = [0u8; SECTOR_SIZE];
        self.image.read_block(&mut sector, SUPERBLOCK_SECTOR)?;
        self.sb = Superblock::decode(&sector);
        Ok(())
    }

    /// True when `blockno` is not a valid data block of this image.
    pub fn badblock(&self, blockno: u16) -> bool {
        (blockno as u32) < self.sb.datastart() || blockno >= self.sb.s_fsize
    }

    /// Highest inumber representable in this image's inode table.
    pub fn max_inum(&self) -> u16 {
        (self.sb.s_isize as u32 * INODES_PER_BLOCK as u32).min(u16::MAX as u32) as u16
    }

    /// Get the cache slot for a block without reading it from disk,
    /// for callers about to overwrite the whole sector.
    pub fn bget(&mut self, blockno: u16) -> Result<BufRef, FsError> {
        let committed = self.committed();
        let result = bcache_lookup(&mut self.bcache, &self.image, committed, blockno);
        match result {
            Err(FsError::Exhausted(_)) if self.log.is_some() => {
                // Likely pinned by uncommitted log records; make them
                // durable and retry once.
                self.log.as_mut().unwrap().flush()?;
                let committed = self.committed();
                bcache_lookup(&mut self.bcache, &self.image, committed, blockno)
            }
            other => other,
        }
    }

    /// Read a block through the buffer cache.
    pub fn bread(&mut self, blockno: u16) -> Result<BufRef, FsError> {
        let bp = self.bget(blockno)?;
        {
            let mut b = bp.lock();
            if !b.initialized {
                self.image.read_block(&mut b.data.mem, blockno as u32)?;
                b.initialized = true;
            }
        }
        Ok(bp)
    }

    /// Get an inode through the inode cache.
    pub fn iget(&mut self, inum: u16) -> Result<InodeRef, FsError> {
        let Some(block) = iblock(&self.sb, inum) else {
            return Err(FsError::InvalidArgument("inumber out of range"));
        };

        let committed = self.committed();
        let result = {
            let V6Fs {
                sb,
                image,
                bcache,
                icache,
                ..
            } = self;
            icache_lookup(icache, sb, image, bcache, committed, inum)
        };
        let ip = match result {
            Err(FsError::Exhausted(_)) if self.log.is_some() => {
                self.log.as_mut().unwrap().flush()?;
                let committed = self.committed();
                let V6Fs {
                    sb,
                    image,
                    bcache,
                    icache,
                    ..
                } = self;
                icache_lookup(icache, sb, image, bcache, committed, inum)?
            }
            other => other?,
        };

        let needs_init = !ip.lock().initialized;
        if needs_init {
            let bp = self.bread(block as u16)?;
            let b = bp.lock();
            let mut state = ip.lock();
            state.data =
                DiskInode::decode(&b.data.mem[iindex(inum) * INODE_SIZE..]);
            state.initialized = true;
        }
        Ok(ip)
    }

    /// Allocate a zero-filled block and return its buffer. `metadata`
    /// marks blocks (indirect, directory) whose replayed allocation
    /// must re-zero the sector.
    pub fn balloc(&mut self, metadata: bool) -> Result<BufRef, FsError> {
        if !self.bcache.can_alloc(self.committed(), 1) {
            if let Some(log) = &mut self.log {
                log.flush()?;
            }
            if !self.bcache.can_alloc(self.committed(), 1) {
                return Err(FsError::Exhausted("block allocation out of buffers"));
            }
        }

        let blockno = match &mut self.log {
            Some(log) => log.balloc(metadata)?,
            None => self.balloc_freelist()?,
        };
        if blockno == 0 {
            return Err(FsError::Exhausted("no free blocks on device"));
        }

        let bp = self.bget(blockno)?;
        {
            let mut b = bp.lock();
            b.data.mem.fill(0);
            b.mark_dirty();
        }
        Ok(bp)
    }

    /// Release a block to the free pool and drop its cached contents.
    pub fn bfree(&mut self, blockno: u16) -> Result<(), FsError> {
        if self.badblock(blockno) {
            return Err(FsError::InvalidArgument("attempt to free bad block"));
        }
        match &mut self.log {
            Some(log) => log.bfree(blockno)?,
            None => self.bfree_freelist(blockno)?,
        }
        self.bcache.free(blockno);
        Ok(())
    }

    /// Allocate an inode, zero-filled and marked initialized.
    pub fn ialloc(&mut self) -> Result<InodeRef, FsError> {
        if !self.icache.can_alloc(self.committed(), 1) {
            if let Some(log) = &mut self.log {
                log.flush()?;
            }
            if !self.icache.can_alloc(self.committed(), 1) {
                return Err(FsError::Exhausted("inode cache overflow"));
            }
        }

        if self.sb.s_ninode == 0 {
            // Out of cached free inodes: scan the whole table from the
            // start until the cache refills. This is what V6 did.
            let end = self.max_inum();
            for inum in 1..=end {
                if self.sb.s_ninode as usize >= self.sb.s_inode.len() {
                    break;
                }
                let ip = self.iget(inum)?;
                let free = !ip.lock().data.is_allocated();
                if free {
                    self.sb.s_inode[self.sb.s_ninode as usize] = inum;
                    self.sb.s_ninode += 1;
                }
            }
        }
        if self.sb.s_ninode == 0 {
            return Err(FsError::Exhausted("out of inodes"));
        }

        self.sb.s_ninode -= 1;
        let inum = self.sb.s_inode[self.sb.s_ninode as usize];
        self.sb.s_fmod = 1;

        let ip = self.iget(inum)?;
        {
            let mut state = ip.lock();
            state.data = DiskInode::zeroed();
            state.initialized = true;
        }
        Ok(ip)
    }

    /// Return an inumber to the superblock free cache (best effort:
    /// a full cache simply forgets it until the next table scan).
    pub fn ifree(&mut self, inum: u16) -> Result<(), FsError> {
        if inum < ROOT_INUMBER || inum > self.max_inum() {
            return Err(FsError::InvalidArgument("ifree: invalid inumber"));
        }
        if (self.sb.s_ninode as usize) < self.sb.s_inode.len() {
            self.sb.s_inode[self.sb.s_ninode as usize] = inum;
            self.sb.s_ninode += 1;
        }
        self.sb.s_fmod = 1;
        Ok(())
    }

    /// Record a byte range of a cached sector in the journal and mark
    /// the buffer dirty. The bytes must already be in place.
    pub fn log_patch_buf(
        &mut self,
        bp: &BufRef,
        offset_in_block: u16,
        len: usize,
    ) -> Result<(), FsError> {
        let mut b = bp.lock();
        b.mark_dirty();
        if let Some(log) = &mut self.log {
            assert!(log.in_tx, "patch recorded outside a transaction");
            let start = offset_in_block as usize;
            assert!(start + len <= SECTOR_SIZE, "patch spans sector boundary");
            let bytes = b.data.mem[start..start + len].to_vec();
            let lsn = log.append(record::LogRecord::Patch {
                blockno: b.id,
                offset_in_block,
                bytes,
            })?;
            b.logged = Some(lsn);
        }
        Ok(())
    }

    /// Record the full on-disk image of a cached inode in the journal
    /// and mark it dirty.
    pub fn log_patch_inode(&mut self, ip: &InodeRef) -> Result<(), FsError> {
        let mut state = ip.lock();
        state.mark_dirty();
        if let Some(log) = &mut self.log {
            assert!(log.in_tx, "patch recorded outside a transaction");
            let offset = layout::inode_disk_offset(&self.sb, state.id)
                .expect("cached inode with invalid inumber");
            let lsn = log.append(record::LogRecord::Patch {
                blockno: (offset / SECTOR_SIZE as u32) as u16,
                offset_in_block: (offset % SECTOR_SIZE as u32) as u16,
                bytes: state.data.encode().to_vec(),
            })?;
            state.logged = Some(lsn);
        }
        Ok(())
    }

    /// Resolve `path` relative to `start` (or the root), following the
    /// plain lookup rules (no creation).
    pub fn namei(
        &mut self,
        path: &str,
        start: Option<u16>,
    ) -> Result<Option<InodeRef>, FsError> {
        let mut ip = self.iget(start.unwrap_or(ROOT_INUMBER))?;
        for component in fsops::path_components(path) {
            let is_dir = ip.lock().data.is_dir();
            if !is_dir {
                return Ok(None);
            }
            let Some(found) = inode::dir_lookup(self, &ip, component.as_bytes())?
            else {
                return Ok(None);
            };
            ip = self.iget(found.entry.d_inumber)?;
        }
        Ok(Some(ip))
    }

    fn balloc_freelist(&mut self) -> Result<u16, FsError> {
        // s_free[0] == 0 terminates the list: no more free blocks.
        if self.sb.s_nfree == 0 || (self.sb.s_nfree == 1 && self.sb.s_free[0] == 0) {
            return Ok(0);
        }
        self.sb.s_fmod = 1;

        self.sb.s_nfree -= 1;
        let blockno = self.sb.s_free[self.sb.s_nfree as usize];

        if self.sb.s_nfree == 0 {
            // Re-fill s_free from the block we just allocated.
            let bp = self.bread(blockno)?;
            let b = bp.lock();
            for (i, slot) in self.sb.s_free.iter_mut().enumerate() {
                *slot = u16::from_le_bytes(
                    b.data.mem[i * 2..i * 2 + 2].try_into().unwrap(),
                );
            }
            self.sb.s_nfree = self.sb.s_free.len() as u16;
        }
        Ok(blockno)
    }

    // The free list is a chain of blocks, each beginning with 100
    // block numbers: the first points to the next chain block, the
    // other 99 are free blocks holding garbage.
    fn bfree_freelist(&mut self, blockno: u16) -> Result<(), FsError> {
        self.sb.s_fmod = 1;

        if self.sb.s_nfree as usize == self.sb.s_free.len() {
            // The in-core array is full: spill it into the freed block,
            // which goes straight to disk.
            let bp = self.bget(blockno)?;
            {
                let mut b = bp.lock();
                b.data.mem.fill(0);
                for (i, v) in self.sb.s_free.iter().enumerate() {
                    b.data.mem[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
                }
                b.initialized = true;
                self.image.write_block(&b.data.mem, blockno as u32)?;
            }
            self.sb.s_free[0] = blockno;
            self.sb.s_nfree = 1;
            return Ok(());
        }

        if self.sb.s_nfree == 0 {
            // First free block ever: plant the terminating zero.
            self.sb.s_free[0] = 0;
            self.sb.s_nfree = 1;
        }

        self.sb.s_free[self.sb.s_nfree as usize] = blockno;
        self.sb.s_nfree += 1;
        Ok(())
    }
}

impl Drop for V6Fs {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            tracing::error!(?error, "filesystem shutdown failed");
        }
    }
}

/// Look up a block in the buffer cache, recycling a victim with
/// write-back to the image. Does not retry on a full cache.
pub(crate) fn bcache_lookup(
    bcache: &mut Cache<BlockData>,
    image: &DiskImage,
    committed: Option<Lsn>,
    blockno: u16,
) -> Result<BufRef, FsError> {
    let mut writeback = |entry: &mut CacheEntry<BlockData>| {
        Ok(image.write_block(&entry.data.mem, entry.id as u32)?)
    };
    match bcache.lookup(blockno, committed, &mut writeback) {
        Ok(bp) => Ok(bp),
        Err(LookupError::Full) => Err(FsError::Exhausted("buffer cache full")),
        Err(LookupError::Failed(e)) => Err(e),
    }
}

fn icache_lookup(
    icache: &mut Cache<DiskInode>,
    sb: &Superblock,
    image: &DiskImage,
    bcache: &mut Cache<BlockData>,
    committed: Option<Lsn>,
    inum: u16,
) -> Result<InodeRef, FsError> {
    let mut writeback = |entry: &mut CacheEntry<DiskInode>| {
        writeback_inode(sb, image, bcache, committed, entry)
    };
    match icache.lookup(inum, committed, &mut writeback) {
        Ok(ip) => Ok(ip),
        Err(LookupError::Full) => Err(FsError::Exhausted("inode cache full")),
        Err(LookupError::Failed(e)) => Err(e),
    }
}

/// Copy a cached inode back into its containing sector.
fn writeback_inode(
    sb: &Superblock,
    image: &DiskImage,
    bcache: &mut Cache<BlockData>,
    committed: Option<Lsn>,
    entry: &mut CacheEntry<DiskInode>,
) -> Result<(), FsError> {
    let Some(block) = iblock(sb, entry.id) else {
        return Err(FsError::Corrupt("cached inode with invalid inumber"));
    };
    let bp = bcache_lookup(bcache, image, committed, block as u16)?;
    let mut b = bp.lock();
    if !b.initialized {
        image.read_block(&mut b.data.mem, block)?;
        b.initialized = true;
    }
    entry
        .data
        .encode_into(&mut b.data.mem[iindex(entry.id) * INODE_SIZE..]);
    b.mark_dirty();
    Ok(())
}
