//! File-block mapping and inode-level operations.
//!
//! Mapping a file block index to a disk sector follows the V6 rules:
//! eight direct pointers for small files; under ILARG the first seven
//! `i_addr` slots each name a single-indirect block of 256 pointers,
//! and the eighth names a double-indirect block. The 24-bit size field
//! caps a file at 0x10000 blocks, so the last seven slots of a
//! double-indirect block can never be used.

use super::cache::{BufRef, InodeRef};
use super::cursor::Cursor;
use super::layout::{
    Dirent, DIRENT_SIZE, IADDR_SIZE, ILARG, INDBLK_SIZE, MAX_FILE_SIZE, SECTOR_SIZE,
};
use super::{FsError, V6Fs};

/// First file block index that requires the double-indirect block.
const FIRST_DINDIR_BLOCK: u32 = ((IADDR_SIZE - 1) * INDBLK_SIZE) as u32;

/// Whether an inode field change should be journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoLog {
    /// Record the change in the journal.
    Log,
    /// Only mark the in-core inode dirty.
    NoLog,
}

#[derive(Debug, Clone, Copy)]
/// The pointer path from an inode to one of its file blocks.
enum BlockPath {
    Direct(usize),
    Single { slot: usize, idx: usize },
    Double { mid: usize, idx: usize },
}

fn block_path(mode: u16, file_block: u32) -> Result<BlockPath, FsError> {
    if mode & ILARG == 0 {
        if file_block >= IADDR_SIZE as u32 {
            return Err(FsError::FileTooBig);
        }
        return Ok(BlockPath::Direct(file_block as usize));
    }

    if file_block < FIRST_DINDIR_BLOCK {
        Ok(BlockPath::Single {
            slot: file_block as usize / INDBLK_SIZE,
            idx: file_block as usize % INDBLK_SIZE,
        })
    } else if file_block < 0x10000 {
        let rel = (file_block - FIRST_DINDIR_BLOCK) as usize;
        Ok(BlockPath::Double {
            mid: rel / INDBLK_SIZE,
            idx: rel % INDBLK_SIZE,
        })
    } else {
        Err(FsError::FileTooBig)
    }
}

/// Current UNIX time, truncated to the 32-bit inode time field.
fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Update the access time. Never journaled.
pub fn atouch(fs: &V6Fs, ip: &InodeRef) {
    if fs.readonly {
        return;
    }
    let mut state = ip.lock();
    let now = unix_now();
    state.data.set_atime(now);
    state.mark_dirty();
}

/// Update the modification time.
pub fn mtouch(fs: &mut V6Fs, ip: &InodeRef, dolog: DoLog) -> Result<(), FsError> {
    {
        let mut state = ip.lock();
        let now = unix_now();
        state.data.set_mtime(now);
        state.mark_dirty();
    }
    if dolog == DoLog::Log {
        fs.log_patch_inode(ip)?;
    }
    Ok(())
}

/// Set the file size, journaling the inode.
pub fn set_size(fs: &mut V6Fs, ip: &InodeRef, size: u32) -> Result<(), FsError> {
    ip.lock().data.set_size(size);
    fs.log_patch_inode(ip)
}

fn inode_ptr(ip: &InodeRef, slot: usize) -> u16 {
    ip.lock().data.i_addr[slot]
}

fn set_inode_ptr(
    fs: &mut V6Fs,
    ip: &InodeRef,
    slot: usize,
    blockno: u16,
) -> Result<(), FsError> {
    ip.lock().data.i_addr[slot] = blockno;
    fs.log_patch_inode(ip)
}

fn buffer_ptr(bp: &BufRef, idx: usize) -> u16 {
    let b = bp.lock();
    u16::from_le_bytes(b.data.mem[idx * 2..idx * 2 + 2].try_into().unwrap())
}

fn set_buffer_ptr(
    fs: &mut V6Fs,
    bp: &BufRef,
    idx: usize,
    blockno: u16,
) -> Result<(), FsError> {
    {
        let mut b = bp.lock();
        b.data.mem[idx * 2..idx * 2 + 2].copy_from_slice(&blockno.to_le_bytes());
    }
    fs.log_patch_buf(bp, (idx * 2) as u16, 2)
}

/// Follow (and under `allocate`, build) the pointer held in `i_addr[slot]`.
fn step_inode(
    fs: &mut V6Fs,
    ip: &InodeRef,
    slot: usize,
    allocate: bool,
) -> Result<Option<BufRef>, FsError> {
    match inode_ptr(ip, slot) {
        0 if !allocate => Ok(None),
        0 => {
            let bp = fs.balloc(true)?;
            let blockno = bp.lock().id;
            set_inode_ptr(fs, ip, slot, blockno)?;
            Ok(Some(bp))
        }
        blockno => Ok(Some(fs.bread(blockno)?)),
    }
}

/// Follow (and under `allocate`, build) the pointer at `idx` inside an
/// indirect block. `metadata` describes the pointed-to block.
fn step_buffer(
    fs: &mut V6Fs,
    parent: &BufRef,
    idx: usize,
    allocate: bool,
    metadata: bool,
) -> Result<Option<BufRef>, FsError> {
    match buffer_ptr(parent, idx) {
        0 if !allocate => Ok(None),
        0 => {
            let bp = fs.balloc(metadata)?;
            let blockno = bp.lock().id;
            set_buffer_ptr(fs, parent, idx, blockno)?;
            Ok(Some(bp))
        }
        blockno => Ok(Some(fs.bread(blockno)?)),
    }
}

/// Get the buffer holding file block `file_block` of `ip`.
///
/// Returns `None` for a hole when `allocate` is false. With `allocate`
/// the inode is converted to ILARG as needed, missing indirect blocks
/// are built, and the leaf block is allocated.
pub fn getblock(
    fs: &mut V6Fs,
    ip: &InodeRef,
    file_block: u32,
    allocate: bool,
) -> Result<Option<BufRef>, FsError> {
    let (is_dir, is_large) = {
        let state = ip.lock();
        (state.data.is_dir(), state.data.is_large())
    };
    if allocate {
        if let Some(log) = &fs.log {
            assert!(log.in_tx, "allocating getblock outside a transaction");
        }
        if file_block >= IADDR_SIZE as u32 && !is_large {
            make_large(fs, ip)?;
        }
    }

    let mode = ip.lock().data.i_mode;
    match block_path(mode, file_block)? {
        BlockPath::Direct(slot) => match inode_ptr(ip, slot) {
            0 if !allocate => Ok(None),
            0 => {
                let bp = fs.balloc(is_dir)?;
                let blockno = bp.lock().id;
                set_inode_ptr(fs, ip, slot, blockno)?;
                Ok(Some(bp))
            }
            blockno => Ok(Some(fs.bread(blockno)?)),
        },
        BlockPath::Single { slot, idx } => {
            let Some(ind) = step_inode(fs, ip, slot, allocate)? else {
                return Ok(None);
            };
            step_buffer(fs, &ind, idx, allocate, is_dir)
        }
        BlockPath::Double { mid, idx } => {
            let Some(dbl) = step_inode(fs, ip, IADDR_SIZE - 1, allocate)? else {
                return Ok(None);
            };
            let Some(ind) = step_buffer(fs, &dbl, mid, allocate, true)? else {
                return Ok(None);
            };
            step_buffer(fs, &ind, idx, allocate, is_dir)
        }
    }
}

/// Convert a small inode to ILARG by moving its direct pointers into a
/// freshly allocated indirect block.
fn make_large(fs: &mut V6Fs, ip: &InodeRef) -> Result<(), FsError> {
    if ip.lock().data.is_large() {
        return Ok(());
    }

    let bp = fs.balloc(true)?;
    let blockno = {
        let addrs = ip.lock().data.i_addr;
        let mut b = bp.lock();
        for (i, v) in addrs.iter().enumerate() {
            b.data.mem[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        b.id
    };
    fs.log_patch_buf(&bp, 0, IADDR_SIZE * 2)?;

    {
        let mut state = ip.lock();
        state.data.i_addr = [0; IADDR_SIZE];
        state.data.i_addr[0] = blockno;
        state.data.i_mode |= ILARG;
    }
    fs.log_patch_inode(ip)
}

/// Convert an ILARG inode back to direct addressing, preserving the
/// first eight block pointers. Every other reachable block is freed.
fn make_small(fs: &mut V6Fs, ip: &InodeRef, dolog: DoLog) -> Result<(), FsError> {
    if !ip.lock().data.is_large() {
        return Ok(());
    }

    let first = inode_ptr(ip, 0);
    let saved = if first != 0 {
        let ibp = fs.bread(first)?;
        let mut b = ibp.lock();
        let mut saved = [0u16; IADDR_SIZE];
        for (i, v) in saved.iter_mut().enumerate() {
            *v = u16::from_le_bytes(b.data.mem[i * 2..i * 2 + 2].try_into().unwrap());
        }
        // Zero the moved pointers so the subtree walk below does not
        // free them. The indirect block itself is freed in the walk.
        b.data.mem[..IADDR_SIZE * 2].fill(0);
        b.mark_dirty();
        saved
    } else {
        [0u16; IADDR_SIZE]
    };

    for slot in 0..IADDR_SIZE - 1 {
        let blockno = inode_ptr(ip, slot);
        if blockno != 0 {
            free_indirect(fs, blockno)?;
            ip.lock().data.i_addr[slot] = 0;
        }
    }
    let dbl = inode_ptr(ip, IADDR_SIZE - 1);
    if dbl != 0 {
        free_double_indirect(fs, dbl)?;
    }

    {
        let mut state = ip.lock();
        state.data.i_addr = saved;
        state.data.i_mode &= !ILARG;
        state.mark_dirty();
    }
    if dolog == DoLog::Log {
        fs.log_patch_inode(ip)?;
    }
    Ok(())
}

/// Free every block reachable through a single-indirect block, then
/// the indirect block itself.
fn free_indirect(fs: &mut V6Fs, blockno: u16) -> Result<(), FsError> {
    let ibp = fs.bread(blockno)?;
    for idx in 0..INDBLK_SIZE {
        let leaf = buffer_ptr(&ibp, idx);
        if leaf != 0 {
            fs.bfree(leaf)?;
        }
    }
    drop(ibp);
    fs.bfree(blockno)
}

fn free_double_indirect(fs: &mut V6Fs, blockno: u16) -> Result<(), FsError> {
    let dbp = fs.bread(blockno)?;
    for mid in 0..INDBLK_SIZE {
        let ind = buffer_ptr(&dbp, mid);
        if ind != 0 {
            free_indirect(fs, ind)?;
        }
    }
    drop(dbp);
    fs.bfree(blockno)
}

/// Free blocks of an ILARG inode beyond file block index `keep`,
/// releasing indirect blocks that become wholly unused.
fn prune_large(fs: &mut V6Fs, ip: &InodeRef, keep: u32) -> Result<(), FsError> {
    for slot in (0..IADDR_SIZE - 1).rev() {
        let base = (slot * INDBLK_SIZE) as u32;
        let blockno = inode_ptr(ip, slot);
        if blockno == 0 {
            continue;
        }
        if keep <= base {
            free_indirect(fs, blockno)?;
            set_inode_ptr(fs, ip, slot, 0)?;
        } else if keep < base + INDBLK_SIZE as u32 {
            let ibp = fs.bread(blockno)?;
            for idx in (keep - base) as usize..INDBLK_SIZE {
                let leaf = buffer_ptr(&ibp, idx);
                if leaf != 0 {
                    fs.bfree(leaf)?;
                    set_buffer_ptr(fs, &ibp, idx, 0)?;
                }
            }
        }
    }

    let dbl = inode_ptr(ip, IADDR_SIZE - 1);
    if dbl == 0 {
        return Ok(());
    }
    if keep <= FIRST_DINDIR_BLOCK {
        free_double_indirect(fs, dbl)?;
        set_inode_ptr(fs, ip, IADDR_SIZE - 1, 0)?;
        return Ok(());
    }

    let dbp = fs.bread(dbl)?;
    for mid in (0..INDBLK_SIZE).rev() {
        let base = FIRST_DINDIR_BLOCK + (mid * INDBLK_SIZE) as u32;
        let ind = buffer_ptr(&dbp, mid);
        if ind == 0 {
            continue;
        }
        if keep <= base {
            free_indirect(fs, ind)?;
            set_buffer_ptr(fs, &dbp, mid, 0)?;
        } else if keep < base + INDBLK_SIZE as u32 {
            let ibp = fs.bread(ind)?;
            for idx in (keep - base) as usize..INDBLK_SIZE {
                let leaf = buffer_ptr(&ibp, idx);
                if leaf != 0 {
                    fs.bfree(leaf)?;
                    set_buffer_ptr(fs, &ibp, idx, 0)?;
                }
            }
        }
    }
    Ok(())
}

fn prune_small(fs: &mut V6Fs, ip: &InodeRef, keep: u32) -> Result<(), FsError> {
    for slot in (keep as usize..IADDR_SIZE).rev() {
        let blockno = inode_ptr(ip, slot);
        if blockno != 0 {
            fs.bfree(blockno)?;
            set_inode_ptr(fs, ip, slot, 0)?;
        }
    }
    Ok(())
}

/// Shrink (or zero) a file, freeing blocks beyond the new size and
/// converting back to direct addressing when the result fits.
pub fn truncate(
    fs: &mut V6Fs,
    ip: &InodeRef,
    size: u32,
    dolog: DoLog,
) -> Result<(), FsError> {
    if size > MAX_FILE_SIZE {
        return Err(FsError::FileTooBig);
    }

    let mut converted = false;
    if size <= (IADDR_SIZE * SECTOR_SIZE) as u32 && ip.lock().data.is_large() {
        make_small(fs, ip, DoLog::NoLog)?;
        converted = true;
    }

    let keep = size.div_ceil(SECTOR_SIZE as u32);
    if ip.lock().data.is_large() {
        prune_large(fs, ip, keep)?;
    } else {
        prune_small(fs, ip, keep)?;
    }

    {
        let mut state = ip.lock();
        state.data.set_size(size);
        state.mark_dirty();
    }
    if dolog == DoLog::Log || converted {
        fs.log_patch_inode(ip)?;
    }
    Ok(())
}

/// Truncate to zero and clear the on-disk inode, releasing it.
pub fn clear(fs: &mut V6Fs, ip: &InodeRef) -> Result<(), FsError> {
    truncate(fs, ip, 0, DoLog::NoLog)?;
    {
        let mut state = ip.lock();
        state.data = super::layout::DiskInode::zeroed();
        state.mark_dirty();
    }
    fs.log_patch_inode(ip)
}

#[derive(Debug, Clone)]
/// A located directory entry: its byte position in the directory file
/// and a copy of its contents.
pub struct DirSlot {
    /// Byte offset of the entry within the directory.
    pub pos: u32,
    /// Copy of the entry at that position.
    pub entry: Dirent,
}

/// Find `name` in a directory. Entries with a zero inumber are free
/// slots and never match.
pub fn dir_lookup(
    fs: &mut V6Fs,
    dir: &InodeRef,
    name: &[u8],
) -> Result<Option<DirSlot>, FsError> {
    if !dir.lock().data.is_dir() {
        return Err(FsError::NotDir);
    }
    let mut cursor = Cursor::new(dir.clone());
    while let Some((pos, entry)) = cursor.next_dirent(fs)? {
        if entry.d_inumber != 0 && entry.name() == name {
            return Ok(Some(DirSlot { pos, entry }));
        }
    }
    Ok(None)
}

/// Find `name` in a directory, or claim a slot for it: an existing
/// entry with the same name, else the first free entry, else a fresh
/// entry appended to the directory. The caller installs the inumber
/// with [set_dirent_inum] afterwards.
pub fn dir_create(
    fs: &mut V6Fs,
    dir: &InodeRef,
    name: &[u8],
) -> Result<DirSlot, FsError> {
    if !dir.lock().data.is_dir() {
        return Err(FsError::NotDir);
    }
    if name.len() > super::layout::NAME_MAX {
        return Err(FsError::NameTooLong);
    }

    let mut spare: Option<DirSlot> = None;
    let mut cursor = Cursor::new(dir.clone());
    while let Some((pos, entry)) = cursor.next_dirent(fs)? {
        if entry.name() == name {
            return Ok(DirSlot { pos, entry });
        }
        if spare.is_none() && entry.d_inumber == 0 {
            spare = Some(DirSlot { pos, entry });
        }
    }

    let mut slot = match spare {
        Some(slot) => slot,
        None => {
            // Append a fresh zero entry, extending the directory.
            let pos = dir.lock().data.size();
            let bp = getblock(fs, dir, pos / SECTOR_SIZE as u32, true)?
                .expect("allocating getblock returned a hole");
            {
                let mut b = bp.lock();
                let at = pos as usize % SECTOR_SIZE;
                b.data.mem[at..at + DIRENT_SIZE].fill(0);
                b.mark_dirty();
            }
            set_size(fs, dir, pos + DIRENT_SIZE as u32)?;
            mtouch(fs, dir, DoLog::Log)?;
            DirSlot {
                pos,
                entry: Dirent::empty(),
            }
        }
    };

    // Write the name into the slot. The bytes are journaled by the
    // whole-entry patch in set_dirent_inum.
    slot.entry.set_name(name);
    let bp = getblock(fs, dir, slot.pos / SECTOR_SIZE as u32, false)?
        .ok_or(FsError::Corrupt("directory entry block missing"))?;
    {
        let mut b = bp.lock();
        let at = slot.pos as usize % SECTOR_SIZE;
        slot.entry.encode_into(&mut b.data.mem[at..at + DIRENT_SIZE]);
        b.mark_dirty();
    }
    Ok(slot)
}

/// Install an inumber into a directory slot, journaling the whole
/// 16-byte entry and the directory's mtime. An inumber of zero frees
/// the slot and clears its name.
pub fn set_dirent_inum(
    fs: &mut V6Fs,
    dir: &InodeRef,
    slot: &DirSlot,
    inum: u16,
) -> Result<(), FsError> {
    let bp = getblock(fs, dir, slot.pos / SECTOR_SIZE as u32, false)?
        .ok_or(FsError::Corrupt("directory entry block missing"))?;
    {
        let mut b = bp.lock();
        let at = slot.pos as usize % SECTOR_SIZE;
        let mut entry = Dirent::decode(&b.data.mem[at..at + DIRENT_SIZE]);
        entry.d_inumber = inum;
        if inum == 0 {
            entry.set_name(b"");
        }
        entry.encode_into(&mut b.data.mem[at..at + DIRENT_SIZE]);
        b.mark_dirty();
    }
    fs.log_patch_buf(&bp, (slot.pos as usize % SECTOR_SIZE) as u16, DIRENT_SIZE)?;
    mtouch(fs, dir, DoLog::Log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::cursor::Cursor;
    use crate::v6::layout::IALLOC;
    use crate::v6::{mkfs, OpenFlags, V6Fs};

    fn fresh_fs(dir: &tempfile::TempDir, nblocks: u32) -> V6Fs {
        let path = dir.path().join("img");
        mkfs::create_image(&path, nblocks, 64, None).unwrap();
        V6Fs::open(&path, OpenFlags::default()).unwrap()
    }

    fn fresh_file(fs: &mut V6Fs) -> InodeRef {
        let ip = fs.ialloc().unwrap();
        let mut state = ip.lock();
        state.data.i_mode = IALLOC | 0o644;
        state.mark_dirty();
        drop(state);
        ip
    }

    #[test]
    fn test_block_path_boundaries() {
        // Small files address eight direct blocks and nothing more.
        assert!(matches!(block_path(0, 0), Ok(BlockPath::Direct(0))));
        assert!(matches!(block_path(0, 7), Ok(BlockPath::Direct(7))));
        assert!(matches!(block_path(0, 8), Err(FsError::FileTooBig)));

        // ILARG: seven single-indirect subtrees, then the double.
        assert!(matches!(
            block_path(ILARG, 0),
            Ok(BlockPath::Single { slot: 0, idx: 0 })
        ));
        assert!(matches!(
            block_path(ILARG, 7 * 256 - 1),
            Ok(BlockPath::Single { slot: 6, idx: 255 })
        ));
        assert!(matches!(
            block_path(ILARG, 7 * 256),
            Ok(BlockPath::Double { mid: 0, idx: 0 })
        ));
        assert!(matches!(
            block_path(ILARG, 0xffff),
            Ok(BlockPath::Double { mid: 248, idx: 255 })
        ));
        assert!(matches!(block_path(ILARG, 0x10000), Err(FsError::FileTooBig)));
    }

    #[test]
    fn test_growth_converts_to_large() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir, 512);
        let ip = fresh_file(&mut fs);

        let data: Vec<u8> = (0..9 * SECTOR_SIZE).map(|i| (i % 253) as u8).collect();
        let mut cursor = Cursor::new(ip.clone());
        cursor.write(&mut fs, &data).unwrap();

        {
            let state = ip.lock();
            assert!(state.data.is_large(), "nine blocks require ILARG");
            assert_ne!(state.data.i_addr[0], 0);
            assert_eq!(state.data.size(), data.len() as u32);
        }

        let mut cursor = Cursor::new(ip.clone());
        let mut out = vec![0u8; data.len()];
        assert_eq!(cursor.read(&mut fs, &mut out).unwrap(), data.len());
        assert_eq!(out, data);

        clear(&mut fs, &ip).unwrap();
    }

    #[test]
    fn test_sparse_double_indirect() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir, 512);
        let ip = fresh_file(&mut fs);

        // One write far past the single-indirect range builds only the
        // double-indirect chain, not two thousand data blocks.
        let deep_pos = 2000 * SECTOR_SIZE as u32;
        let mut cursor = Cursor::new(ip.clone());
        cursor.seek(deep_pos).unwrap();
        cursor.write(&mut fs, b"deep").unwrap();

        {
            let state = ip.lock();
            assert!(state.data.is_large());
            assert_ne!(state.data.i_addr[IADDR_SIZE - 1], 0);
            assert_eq!(state.data.size(), deep_pos + 4);
        }

        // The untouched range reads as zeros.
        let mut cursor = Cursor::new(ip.clone());
        let mut head = [0xffu8; 64];
        cursor.read(&mut fs, &mut head).unwrap();
        assert!(head.iter().all(|b| *b == 0));

        cursor.seek(deep_pos).unwrap();
        let mut tail = [0u8; 4];
        cursor.read(&mut fs, &mut tail).unwrap();
        assert_eq!(&tail, b"deep");

        truncate(&mut fs, &ip, 0, DoLog::NoLog).unwrap();
        {
            let state = ip.lock();
            assert!(!state.data.is_large());
            assert_eq!(state.data.i_addr, [0; IADDR_SIZE]);
            assert_eq!(state.data.size(), 0);
        }
        clear(&mut fs, &ip).unwrap();
    }

    #[test]
    fn test_truncate_back_to_small_keeps_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir, 512);
        let ip = fresh_file(&mut fs);

        let data: Vec<u8> = (0..10 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        let mut cursor = Cursor::new(ip.clone());
        cursor.write(&mut fs, &data).unwrap();
        assert!(ip.lock().data.is_large());

        truncate(&mut fs, &ip, SECTOR_SIZE as u32, DoLog::NoLog).unwrap();
        {
            let state = ip.lock();
            assert!(!state.data.is_large(), "one block fits direct addressing");
            assert_eq!(state.data.size(), SECTOR_SIZE as u32);
            assert_ne!(state.data.i_addr[0], 0);
            assert_eq!(&state.data.i_addr[1..], &[0u16; 7]);
        }

        // The surviving block kept its contents through the
        // large-to-small conversion.
        let mut cursor = Cursor::new(ip.clone());
        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(cursor.read(&mut fs, &mut out).unwrap(), SECTOR_SIZE);
        assert_eq!(out, data[..SECTOR_SIZE]);

        clear(&mut fs, &ip).unwrap();
    }

    #[test]
    fn test_truncate_returns_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir, 512);

        let free_before = crate::v6::fsops::num_free_blocks(&mut fs).unwrap();
        let ip = fresh_file(&mut fs);

        let mut cursor = Cursor::new(ip.clone());
        cursor.write(&mut fs, &vec![1u8; 4 * SECTOR_SIZE]).unwrap();
        let free_during = crate::v6::fsops::num_free_blocks(&mut fs).unwrap();
        assert_eq!(free_during, free_before - 4);

        clear(&mut fs, &ip).unwrap();
        let free_after = crate::v6::fsops::num_free_blocks(&mut fs).unwrap();
        assert_eq!(free_after, free_before);
    }

    #[test]
    fn test_dir_create_reuses_free_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir, 512);

        let root = fs.iget(crate::v6::layout::ROOT_INUMBER).unwrap();
        let size_before = root.lock().data.size();

        let slot = dir_create(&mut fs, &root, b"first").unwrap();
        set_dirent_inum(&mut fs, &root, &slot, 5).unwrap();
        assert_eq!(root.lock().data.size(), size_before + DIRENT_SIZE as u32);

        // Freeing the entry and creating a new name reuses the slot
        // instead of growing the directory.
        set_dirent_inum(&mut fs, &root, &slot, 0).unwrap();
        let reused = dir_create(&mut fs, &root, b"second").unwrap();
        assert_eq!(reused.pos, slot.pos);
        assert_eq!(root.lock().data.size(), size_before + DIRENT_SIZE as u32);
    }
}
