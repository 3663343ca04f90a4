//! Offline consistency check and repair.
//!
//! Two passes, each accumulating byte patches that are applied
//! atomically at the end: pass 1 rebuilds the block allocation map by
//! walking every inode's block tree, zeroing pointers that are out of
//! range, beyond end of file, cross-allocated, or inside an invalid
//! indirect block. Pass 2 walks the directory tree from the root,
//! repairing entries and accumulating observed link counts, which are
//! then reconciled with the stored ones. Afterwards the legacy free
//! list is rebuilt from the surviving allocation map.
//!
//! The check scans the image as-is: a journaling image with
//! unreplayed transactions is examined in its pre-replay state (run
//! `apply` first to roll the log forward). Repairs drop the image back
//! to the legacy free-list regime.

use std::collections::{BTreeMap, HashSet};

use super::cache::InodeRef;
use super::cursor::Cursor;
use super::fsops;
use super::inode::{self, DirSlot};
use super::layout::{
    inode_disk_offset, DiskInode, IADDR_SIZE, IFBLK, IFCHR, IFMT, INDBLK_SIZE,
    ROOT_INUMBER, SECTOR_SIZE,
};
use super::bitmap::Bitmap;
use super::{FsError, V6Fs};

/// File block index where the double-indirect block takes over.
const FIRST_DINDIR_BLOCK: u32 = ((IADDR_SIZE - 1) * INDBLK_SIZE) as u32;

struct NewLink {
    dir_inum: u16,
    inum: u16,
    name: &'static str,
}

struct Fsck<'a> {
    fs: &'a mut V6Fs,
    /// Set bit = free. Starts all-free; visiting a block claims it.
    freemap: Bitmap,
    /// Observed link count per inumber.
    nlinks: Vec<u8>,
    /// Byte patches keyed by absolute disk offset.
    patches: BTreeMap<u32, Vec<u8>>,
    /// Missing `.`/`..` entries, applied after other repairs because
    /// they may need block allocation.
    newlinks: Vec<NewLink>,
    ctx: String,
}

impl<'a> Fsck<'a> {
    fn new(fs: &'a mut V6Fs) -> Self {
        let mut freemap =
            Bitmap::new(fs.sb.s_fsize as usize, fs.sb.datastart() as usize);
        freemap.fill();
        let nlinks = vec![0u8; ROOT_INUMBER as usize + fs.max_inum() as usize];
        Self {
            fs,
            freemap,
            nlinks,
            patches: BTreeMap::new(),
            newlinks: Vec::new(),
            ctx: String::new(),
        }
    }

    fn report(&self, msg: &str) {
        if self.ctx.is_empty() {
            println!("{msg}");
        } else {
            println!("{}: {msg}", self.ctx);
        }
    }

    fn valid_inum(&self, inum: u16) -> bool {
        inum >= ROOT_INUMBER && (inum as usize) < self.nlinks.len()
    }

    fn patch(&mut self, offset: u32, bytes: &[u8]) {
        assert!(
            offset as usize % SECTOR_SIZE + bytes.len() <= SECTOR_SIZE,
            "patch spans sector boundary"
        );
        self.patches.entry(offset).or_insert_with(|| bytes.to_vec());
    }

    fn patch16(&mut self, offset: u32, value: u16) {
        self.patch(offset, &value.to_le_bytes());
    }

    fn inode_ptr_offset(&self, inum: u16, slot: usize) -> u32 {
        inode_disk_offset(&self.fs.sb, inum).expect("scanned inode out of range")
            + 8
            + (slot * 2) as u32
    }

    /// Claim `blockno` for the current owner. Returns false (and
    /// reports) when the pointer should be zeroed instead.
    fn visit(&mut self, blockno: u16, beyond_eof: bool) -> bool {
        if self.fs.badblock(blockno) {
            self.report(&format!("block {blockno}: bad block number in inode"));
            return false;
        }
        if beyond_eof {
            self.report(&format!("block {blockno}: allocated beyond end of file"));
            return false;
        }
        if !self.freemap.get(blockno as usize) {
            self.report(&format!("block {blockno}: cross-allocated"));
            return false;
        }
        self.freemap.set(blockno as usize, false);
        true
    }

    /// Pass 1 over one inode's block tree.
    fn scan_inode_blocks(&mut self, inum: u16) -> Result<bool, FsError> {
        let ip = self.fs.iget(inum)?;
        let (mode, size, addrs) = {
            let state = ip.lock();
            (state.data.i_mode, state.data.size(), state.data.i_addr)
        };
        if mode & IFMT == IFCHR || mode & IFMT == IFBLK {
            return Ok(true);
        }

        let mut ok = true;
        let nb = size.div_ceil(SECTOR_SIZE as u32);

        if ip.lock().data.is_large() {
            let nb = nb.min(0x10000);
            for (slot, &blockno) in addrs.iter().take(IADDR_SIZE - 1).enumerate() {
                if blockno == 0 {
                    continue;
                }
                let base = (slot * INDBLK_SIZE) as u32;
                let claimed = self.visit(blockno, base >= nb);
                let kept = claimed
                    && self.scan_indirect(
                        blockno,
                        (nb.saturating_sub(base)).min(INDBLK_SIZE as u32) as usize,
                    )?;
                if !kept {
                    self.patch16(self.inode_ptr_offset(inum, slot), 0);
                    ok = false;
                }
            }

            let dbl = addrs[IADDR_SIZE - 1];
            if dbl != 0 {
                let claimed = self.visit(dbl, FIRST_DINDIR_BLOCK >= nb);
                let kept = claimed && self.scan_double(dbl, nb)?;
                if !kept {
                    self.patch16(self.inode_ptr_offset(inum, IADDR_SIZE - 1), 0);
                    ok = false;
                }
            }
        } else {
            let valid = nb.min(IADDR_SIZE as u32);
            for (slot, &blockno) in addrs.iter().enumerate() {
                if blockno == 0 {
                    continue;
                }
                if !self.visit(blockno, slot as u32 >= valid) {
                    self.patch16(self.inode_ptr_offset(inum, slot), 0);
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    /// Validate and claim the contents of a single-indirect block.
    /// Returns false when the whole block is invalid and the parent
    /// pointer must be zeroed.
    fn scan_indirect(&mut self, blockno: u16, valid: usize) -> Result<bool, FsError> {
        let entries = self.read_ptr_block(blockno)?;

        // An indirect block with out-of-range pointers was probably
        // never initialized; drop the whole subtree.
        for &entry in &entries {
            if entry != 0 && self.fs.badblock(entry) {
                self.report(&format!("block {blockno}: invalid indirect block"));
                return Ok(false);
            }
        }

        for (idx, &entry) in entries.iter().enumerate() {
            if entry == 0 {
                continue;
            }
            if !self.visit(entry, idx >= valid) {
                self.patch16(blockno as u32 * SECTOR_SIZE as u32 + (idx * 2) as u32, 0);
            }
        }
        Ok(true)
    }

    fn scan_double(&mut self, blockno: u16, nb: u32) -> Result<bool, FsError> {
        let entries = self.read_ptr_block(blockno)?;

        // The file size cap means the last seven slots can never be
        // used; a nonzero one marks a bogus double-indirect block.
        for &entry in &entries {
            if entry != 0 && self.fs.badblock(entry) {
                self.report(&format!("block {blockno}: invalid indirect block"));
                return Ok(false);
            }
        }
        if entries[INDBLK_SIZE - (IADDR_SIZE - 1)..]
            .iter()
            .any(|&e| e != 0)
        {
            self.report(&format!("block {blockno}: invalid indirect block"));
            return Ok(false);
        }

        for (mid, &entry) in entries.iter().enumerate() {
            if entry == 0 {
                continue;
            }
            let base = FIRST_DINDIR_BLOCK + (mid * INDBLK_SIZE) as u32;
            let claimed = self.visit(entry, base >= nb);
            let kept = claimed
                && self.scan_indirect(
                    entry,
                    (nb.saturating_sub(base)).min(INDBLK_SIZE as u32) as usize,
                )?;
            if !kept {
                self.patch16(blockno as u32 * SECTOR_SIZE as u32 + (mid * 2) as u32, 0);
            }
        }
        Ok(true)
    }

    fn read_ptr_block(&mut self, blockno: u16) -> Result<[u16; INDBLK_SIZE], FsError> {
        let bp = self.fs.bread(blockno)?;
        let b = bp.lock();
        let mut entries = [0u16; INDBLK_SIZE];
        for (i, entry) in entries.iter_mut().enumerate() {
            *entry = u16::from_le_bytes(b.data.mem[i * 2..i * 2 + 2].try_into().unwrap());
        }
        Ok(entries)
    }

    fn scan_inodes(&mut self) -> Result<bool, FsError> {
        let mut ok = true;
        for inum in ROOT_INUMBER..self.nlinks.len() as u16 {
            self.ctx = format!("inode {inum}");
            if !self.scan_inode_blocks(inum)? {
                ok = false;
            }
        }
        self.ctx.clear();
        Ok(ok)
    }

    /// Disk offset of the directory entry at byte `pos` of `dir`.
    fn dirent_offset(&mut self, dir: &InodeRef, pos: u32) -> Result<u32, FsError> {
        let bp = inode::getblock(self.fs, dir, pos / SECTOR_SIZE as u32, false)?
            .ok_or(FsError::Corrupt("directory entry block missing"))?;
        let blockno = bp.lock().id;
        Ok(blockno as u32 * SECTOR_SIZE as u32 + pos % SECTOR_SIZE as u32)
    }

    /// Pass 2 over one directory (recursing into subdirectories).
    fn scan_directory(&mut self, ip: &InodeRef, parent: u16) -> Result<bool, FsError> {
        let self_inum = ip.lock().id;
        let parent = if parent == 0 { self_inum } else { parent };

        let mut ok = true;
        let mut dot_ok = false;
        let mut dotdot_ok = false;
        let mut names: HashSet<Vec<u8>> = HashSet::new();

        let mut cursor = Cursor::new(ip.clone());
        while let Some((pos, de)) = cursor.next_dirent(self.fs)? {
            if de.d_inumber == 0 {
                continue;
            }
            let name = de.name().to_vec();
            let display = String::from_utf8_lossy(&name).into_owned();

            if !self.valid_inum(de.d_inumber) {
                self.report(&format!(
                    "invalid inumber {} for {display}",
                    de.d_inumber
                ));
                let offset = self.dirent_offset(ip, pos)?;
                self.patch16(offset, 0);
                ok = false;
                continue;
            }
            if !names.insert(name.clone()) {
                self.report(&format!("duplicate directory entry for \"{display}\""));
                let offset = self.dirent_offset(ip, pos)?;
                self.patch16(offset, 0);
                ok = false;
                continue;
            }
            if name == b"." {
                if de.d_inumber != self_inum {
                    self.report("incorrect \".\" inumber");
                    let offset = self.dirent_offset(ip, pos)?;
                    self.patch16(offset, self_inum);
                    ok = false;
                }
                dot_ok = true;
                self.nlinks[self_inum as usize] += 1;
                continue;
            }
            if name == b".." {
                if de.d_inumber != parent {
                    self.report("incorrect \"..\" inumber");
                    let offset = self.dirent_offset(ip, pos)?;
                    self.patch16(offset, parent);
                    ok = false;
                }
                dotdot_ok = true;
                self.nlinks[parent as usize] += 1;
                continue;
            }

            self.nlinks[de.d_inumber as usize] += 1;
            let child = self.fs.iget(de.d_inumber)?;
            let (allocated, is_dir) = {
                let state = child.lock();
                (state.data.is_allocated(), state.data.is_dir())
            };
            if !allocated {
                self.report(&format!(
                    "directory entry {display} for unallocated inode {}",
                    de.d_inumber
                ));
                self.nlinks[de.d_inumber as usize] -= 1;
                let offset = self.dirent_offset(ip, pos)?;
                self.patch16(offset, 0);
                ok = false;
                continue;
            }
            if is_dir {
                if self.nlinks[de.d_inumber as usize] != 1 {
                    self.report(&format!(
                        "hard link \"{display}\" to directory {}",
                        de.d_inumber
                    ));
                    self.nlinks[de.d_inumber as usize] -= 1;
                    let offset = self.dirent_offset(ip, pos)?;
                    self.patch16(offset, 0);
                    ok = false;
                    continue;
                }
                let descended = format!("{}{display}/", self.ctx);
                let saved = std::mem::replace(&mut self.ctx, descended);
                if !self.scan_directory(&child, self_inum)? {
                    ok = false;
                }
                self.ctx = saved;
            }
        }

        if !dot_ok {
            self.report("missing \".\"");
            self.newlinks.push(NewLink {
                dir_inum: self_inum,
                inum: self_inum,
                name: ".",
            });
            self.nlinks[self_inum as usize] += 1;
        }
        if !dotdot_ok {
            self.report("missing \"..\"");
            self.newlinks.push(NewLink {
                dir_inum: self_inum,
                inum: parent,
                name: "..",
            });
            self.nlinks[parent as usize] += 1;
        }
        Ok(ok && dot_ok && dotdot_ok)
    }

    /// Reconcile stored link counts with the observed ones, clearing
    /// inodes nothing references.
    fn fix_nlink(&mut self) -> Result<bool, FsError> {
        let mut ok = true;
        for inum in ROOT_INUMBER..self.nlinks.len() as u16 {
            let ip = self.fs.iget(inum)?;
            let (allocated, stored) = {
                let state = ip.lock();
                (state.data.is_allocated(), state.data.i_nlink)
            };
            let observed = self.nlinks[inum as usize];
            if observed == 0 {
                if allocated {
                    self.report(&format!("clearing unreachable inode {inum}"));
                    let offset = inode_disk_offset(&self.fs.sb, inum).unwrap();
                    self.patch(offset, &DiskInode::zeroed().encode());
                    ok = false;
                }
            } else if observed != stored {
                self.report(&format!(
                    "inode {inum}: link count {stored} should be {observed}"
                ));
                let offset = inode_disk_offset(&self.fs.sb, inum).unwrap();
                self.patch(offset + 2, &[observed]);
                ok = false;
            }
        }
        Ok(ok)
    }

    /// Apply the accumulated patches through fresh caches, rebuild the
    /// free list, and install any queued `.`/`..` entries.
    fn apply(&mut self) -> Result<(), FsError> {
        self.fs.invalidate()?;
        let patches = std::mem::take(&mut self.patches);
        for (offset, bytes) in patches {
            let bp = self.fs.bread((offset / SECTOR_SIZE as u32) as u16)?;
            let mut b = bp.lock();
            let at = offset as usize % SECTOR_SIZE;
            b.data.mem[at..at + bytes.len()].copy_from_slice(&bytes);
            b.mark_dirty();
        }
        self.fs.sync();

        // Repairs put the image back on the legacy free list; the
        // journal must be recreated explicitly afterwards.
        self.fs.sb.s_uselog = 0;
        self.rebuild_freelist()?;

        let newlinks = std::mem::take(&mut self.newlinks);
        for nl in newlinks {
            let dir = self.fs.iget(nl.dir_inum)?;
            let slot: DirSlot = inode::dir_create(self.fs, &dir, nl.name.as_bytes())?;
            inode::set_dirent_inum(self.fs, &dir, &slot, nl.inum)?;
        }
        self.fs.sync();
        Ok(())
    }

    /// Push every unclaimed block onto the legacy free list, walking
    /// backward so the list hands out ascending block runs.
    fn rebuild_freelist(&mut self) -> Result<(), FsError> {
        self.fs.sb.s_nfree = 0;
        let start = self.fs.sb.datastart();
        for blockno in (start..self.fs.sb.s_fsize as u32).rev() {
            if self.freemap.get(blockno as usize) {
                self.fs.bfree(blockno as u16)?;
            }
        }
        Ok(())
    }
}

/// Scan (and with `write`, repair) an open filesystem. Returns true
/// when the image was already consistent.
pub fn fsck(fs: &mut V6Fs, write: bool) -> Result<bool, FsError> {
    let mut fsck = Fsck::new(fs);
    let mut clean = true;

    if !fsck.scan_inodes()? {
        println!("scan inodes required fixes");
        clean = false;
        if write {
            fsck.apply()?;
        }
    }

    let disk_freemap = fsops::freemap_snapshot(fsck.fs).ok();
    if disk_freemap.as_ref() != Some(&fsck.freemap) {
        println!("free list was incorrect");
        clean = false;
    }

    let root = fsck.fs.iget(ROOT_INUMBER)?;
    if !fsck.scan_directory(&root, ROOT_INUMBER)? {
        println!("scan directories required fixes");
        clean = false;
        if write {
            drop(root);
            fsck.apply()?;
        }
    } else {
        drop(root);
    }

    if !fsck.fix_nlink()? {
        println!("fix link count required fixes");
        clean = false;
    }

    // Validate the superblock's inode free cache against the scan.
    if fsck.fs.sb.s_ninode as usize > fsck.fs.sb.s_inode.len() {
        println!("invalid s_ninode");
        fsck.fs.sb.s_ninode = 0;
        clean = false;
    } else {
        for i in 0..fsck.fs.sb.s_ninode as usize {
            let inum = fsck.fs.sb.s_inode[i];
            if !fsck.valid_inum(inum) || fsck.nlinks[inum as usize] != 0 {
                println!("invalid inode {inum} in free list");
                fsck.fs.sb.s_ninode = 0;
                clean = false;
                break;
            }
        }
    }

    if write {
        fsck.apply()?;
        // Force re-scanning for free inodes.
        fsck.fs.sb.s_ninode = 0;
        fsck.fs.sb.s_fmod = 1;
        fsck.fs.sb.s_dirty = 0;
        fsck.fs.unclean = false;
    } else {
        fsck.fs.sb.s_fmod = 0;
        fsck.fs.invalidate()?;
    }

    if !clean {
        println!("File system was corrupt");
    }
    Ok(clean)
}
