//! Path resolution and directory-tree operations.
//!
//! Every mutating operation opens a transaction on the filesystem's
//! journal (a no-op on legacy images), performs its cache mutations
//! with matching log patches, and commits when the guard resolves.

use super::bitmap::Bitmap;
use super::cache::InodeRef;
use super::cursor::Cursor;
use super::inode::{self, DirSlot, DoLog};
use super::layout::{
    DiskInode, IALLOC, IFDIR, IFMT, NAME_MAX, ROOT_INUMBER, SECTOR_SIZE,
};
use super::{FsError, V6Fs};

/// `.` and `..` are acceptable as the final path component.
pub const ND_DOT_OK: u32 = 0x1;
/// Create a directory entry (with inumber 0) when the name is absent.
pub const ND_CREATE: u32 = 0x2;
/// With [ND_CREATE], the name must not already exist.
pub const ND_EXCLUSIVE: u32 = 0x4;
/// Require write permission on the parent directory.
pub const ND_DIRWRITE: u32 = 0x8;

/// Permission callback: returns a 3-bit rwx mask for an inode.
pub type InodePermissions<'a> = &'a dyn Fn(&DiskInode) -> u8;

/// Grants full permissions unconditionally.
pub fn all_permissions(_: &DiskInode) -> u8 {
    7
}

/// Split a path into components, resolving `.` in place and `..` by
/// popping. An empty path yields no components (the start directory).
pub fn path_components(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            name => out.push(name.to_string()),
        }
    }
    out
}

#[derive(Debug)]
/// The result of path resolution: the parent directory and the located
/// (or claimed) entry within it.
pub struct NamedEntry {
    /// The parent directory.
    pub dir: InodeRef,
    /// The entry slot inside `dir`.
    pub slot: DirSlot,
}

impl NamedEntry {
    /// Inumber currently stored in the entry (0 for a claimed slot).
    pub fn inum(&self) -> u16 {
        self.slot.entry.d_inumber
    }
}

/// Resolve `path` starting from `start` (default: the root), applying
/// the `ND_*` flags and the permission callback at each step.
pub fn named(
    fs: &mut V6Fs,
    start: Option<InodeRef>,
    path: &str,
    flags: u32,
    perm: InodePermissions<'_>,
) -> Result<NamedEntry, FsError> {
    if flags & ND_CREATE != 0 {
        if let Some(log) = &fs.log {
            assert!(log.in_tx, "creating lookup outside a transaction");
        }
    }

    let mut components = path_components(path);
    if components.is_empty() {
        components.push(".".to_string());
    }

    let name = components.pop().unwrap();
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    if flags & (ND_DOT_OK | ND_CREATE) != ND_DOT_OK && (name == "." || name == "..") {
        return Err(FsError::InvalidArgument(". and .. not permitted here"));
    }

    let mut ip = match start {
        Some(ip) => ip,
        None => fs.iget(ROOT_INUMBER)?,
    };
    for component in &components {
        if ip.lock().data.i_mode & IFMT != IFDIR {
            return Err(FsError::NotDir);
        }
        if perm(&ip.lock().data) & 1 == 0 {
            return Err(FsError::AccessDenied);
        }
        let Some(found) = inode::dir_lookup(fs, &ip, component.as_bytes())? else {
            return Err(FsError::NoEntry);
        };
        ip = fs.iget(found.entry.d_inumber)?;
    }

    if ip.lock().data.i_mode & IFMT != IFDIR {
        return Err(FsError::NotDir);
    }
    let access = perm(&ip.lock().data);
    if access & 1 == 0 {
        return Err(FsError::AccessDenied);
    }
    if flags & ND_DIRWRITE != 0 && access & 2 == 0 {
        return Err(FsError::AccessDenied);
    }

    let slot = if access & 2 != 0 && flags & ND_CREATE != 0 {
        Some(inode::dir_create(fs, &ip, name.as_bytes())?)
    } else {
        inode::dir_lookup(fs, &ip, name.as_bytes())?
    };
    let Some(slot) = slot else {
        return Err(FsError::NoEntry);
    };
    if flags & ND_EXCLUSIVE != 0 && slot.entry.d_inumber != 0 {
        return Err(FsError::Exists);
    }

    Ok(NamedEntry { dir: ip, slot })
}

/// Create a non-directory node at `path`. `init` adjusts the fresh
/// inode (mode bits, device numbers) inside the transaction.
pub fn mknod(
    fs: &mut V6Fs,
    path: &str,
    init: Option<&dyn Fn(&mut DiskInode)>,
) -> Result<u16, FsError> {
    let mut txn = fs.begin()?;
    let entry = named(&mut txn, None, path, ND_CREATE, &all_permissions)?;
    if entry.inum() != 0 {
        return Err(FsError::Exists);
    }

    let ip = txn.ialloc()?;
    let inum = ip.lock().id;
    {
        let mut state = ip.lock();
        state.data.i_mode = IALLOC;
        state.data.i_nlink = 1;
        let now = unix_now();
        state.data.set_atime(now);
        state.data.set_mtime(now);
        match init {
            Some(init) => {
                init(&mut state.data);
                state.data.i_mode |= IALLOC;
            }
            None => state.data.i_mode |= 0o666,
        }
    }
    txn.log_patch_inode(&ip)?;
    inode::set_dirent_inum(&mut txn, &entry.dir, &entry.slot, inum)?;
    txn.commit()?;
    Ok(inum)
}

/// Create a directory at `path`, seeding `.` and `..`.
pub fn mkdir(
    fs: &mut V6Fs,
    path: &str,
    init: Option<&dyn Fn(&mut DiskInode)>,
) -> Result<u16, FsError> {
    let mut txn = fs.begin()?;
    let entry = named(&mut txn, None, path, ND_CREATE, &all_permissions)?;
    if entry.inum() != 0 {
        return Err(FsError::Exists);
    }
    if entry.dir.lock().data.i_nlink == u8::MAX {
        return Err(FsError::FileTooBig);
    }

    let ip = txn.ialloc()?;
    let inum = ip.lock().id;
    {
        let mut state = ip.lock();
        state.data.i_mode = IFDIR | IALLOC;
        state.data.i_nlink = 2;
        let now = unix_now();
        state.data.set_atime(now);
        state.data.set_mtime(now);
        match init {
            Some(init) => {
                init(&mut state.data);
                state.data.i_mode = (state.data.i_mode & !IFMT) | IFDIR | IALLOC;
            }
            None => state.data.i_mode |= 0o777,
        }
    }

    inode::set_dirent_inum(&mut txn, &entry.dir, &entry.slot, inum)?;

    let dot = inode::dir_create(&mut txn, &ip, b".")?;
    inode::set_dirent_inum(&mut txn, &ip, &dot, inum)?;
    let parent_inum = entry.dir.lock().id;
    let dotdot = inode::dir_create(&mut txn, &ip, b"..")?;
    inode::set_dirent_inum(&mut txn, &ip, &dotdot, parent_inum)?;

    txn.log_patch_inode(&ip)?;
    entry.dir.lock().data.i_nlink += 1;
    txn.log_patch_inode(&entry.dir)?;
    txn.commit()?;
    Ok(inum)
}

/// Remove the directory at `path`. It must be empty apart from `.`
/// and `..`.
pub fn rmdir(fs: &mut V6Fs, path: &str) -> Result<(), FsError> {
    let entry = named(fs, None, path, 0, &all_permissions)?;
    if entry.inum() == 0 {
        return Err(FsError::NoEntry);
    }
    let ip = fs.iget(entry.inum())?;
    if ip.lock().data.i_mode & IFMT != IFDIR {
        return Err(FsError::NotDir);
    }

    let mut cursor = Cursor::new(ip.clone());
    while let Some((_, de)) = cursor.next_dirent(fs)? {
        if de.d_inumber != 0 && de.name() != b"." && de.name() != b".." {
            return Err(FsError::NotEmpty);
        }
    }

    // Truncation may need an indirect and a data buffer at once.
    if !fs.bcache.can_alloc(fs.committed(), 2) {
        return Err(FsError::Exhausted("buffer cache full"));
    }

    let mut txn = fs.begin()?;
    inode::set_dirent_inum(&mut txn, &entry.dir, &entry.slot, 0)?;
    entry.dir.lock().data.i_nlink -= 1;
    txn.log_patch_inode(&entry.dir)?;
    inode::mtouch(&mut txn, &entry.dir, DoLog::Log)?;
    inode::clear(&mut txn, &ip)?;
    let inum = ip.lock().id;
    txn.ifree(inum)?;
    txn.commit()
}

/// Create a hard link at `newpath` referring to `oldpath`. Directories
/// cannot be hard-linked.
pub fn link(fs: &mut V6Fs, oldpath: &str, newpath: &str) -> Result<(), FsError> {
    let old = named(fs, None, oldpath, 0, &all_permissions)?;
    if old.inum() == 0 {
        return Err(FsError::NoEntry);
    }
    let ip = fs.iget(old.inum())?;
    if ip.lock().data.i_mode & IFMT == IFDIR {
        return Err(FsError::InvalidArgument("hard link to directory"));
    }
    if ip.lock().data.i_nlink == u8::MAX {
        return Err(FsError::FileTooBig);
    }

    let mut txn = fs.begin()?;
    let new = named(
        &mut txn,
        None,
        newpath,
        ND_CREATE | ND_EXCLUSIVE,
        &all_permissions,
    )?;
    inode::mtouch(&mut txn, &ip, DoLog::Log)?;
    ip.lock().data.i_nlink += 1;
    txn.log_patch_inode(&ip)?;
    let inum = ip.lock().id;
    inode::set_dirent_inum(&mut txn, &new.dir, &new.slot, inum)?;
    txn.commit()
}

/// Remove the entry at `path`, freeing the inode when its last link
/// goes away.
pub fn unlink(fs: &mut V6Fs, path: &str) -> Result<(), FsError> {
    let entry = named(fs, None, path, ND_DIRWRITE, &all_permissions)?;
    if entry.inum() == 0 {
        return Err(FsError::NoEntry);
    }
    let ip = fs.iget(entry.inum())?;

    let mut txn = fs.begin()?;
    inode::set_dirent_inum(&mut txn, &entry.dir, &entry.slot, 0)?;
    if ip.lock().data.i_nlink > 1 {
        ip.lock().data.i_nlink -= 1;
        txn.log_patch_inode(&ip)?;
    } else {
        inode::clear(&mut txn, &ip)?;
    }
    txn.commit()
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Number of unallocated inodes, honoring cached in-core copies over
/// the on-disk table.
pub fn num_free_inodes(fs: &mut V6Fs) -> Result<usize, FsError> {
    let mut free = 0;
    let end = fs.max_inum();
    for inum in 1..=end {
        if let Some(ip) = fs.icache.try_lookup(inum) {
            let state = ip.lock();
            if state.initialized && !state.data.is_allocated() {
                free += 1;
            }
            continue;
        }
        let ip = fs.iget(inum)?;
        let allocated = ip.lock().data.is_allocated();
        if !allocated {
            free += 1;
        }
    }
    Ok(free)
}

/// Number of free data blocks under whichever allocation regime the
/// image uses.
pub fn num_free_blocks(fs: &mut V6Fs) -> Result<usize, FsError> {
    if let Some(log) = &fs.log {
        return Ok(log.freemap.count_set());
    }
    Ok(freemap_snapshot(fs)?.count_set())
}

/// Derive the free-block map from whichever source is authoritative:
/// the in-memory freemap when journaling, the persisted map when the
/// image has a log that is not open, or a walk of the legacy free
/// list.
pub fn freemap_snapshot(fs: &mut V6Fs) -> Result<Bitmap, FsError> {
    let mut map = Bitmap::new(fs.sb.s_fsize as usize, fs.sb.datastart() as usize);

    if let Some(log) = &fs.log {
        map.data_mut().copy_from_slice(log.freemap.data());
        map.tidy();
        return Ok(map);
    }

    if fs.sb.s_uselog != 0 {
        let mapstart = fs.sb.s_fsize as u64 + 1;
        fs.image
            .read_at(map.data_mut(), mapstart * SECTOR_SIZE as u64)?;
        map.tidy();
        return Ok(map);
    }

    if fs.sb.s_nfree == 0 {
        return Ok(map);
    }
    for i in 1..fs.sb.s_nfree as usize {
        map.set(fs.sb.s_free[i] as usize, true);
    }
    let mut chain = fs.sb.s_free[0];
    while chain != 0 {
        map.set(chain as usize, true);
        let bp = fs.bread(chain)?;
        let b = bp.lock();
        for i in (1..100).rev() {
            let bn = u16::from_le_bytes(b.data.mem[i * 2..i * 2 + 2].try_into().unwrap());
            if bn != 0 {
                map.set(bn as usize, true);
            }
        }
        chain = u16::from_le_bytes(b.data.mem[0..2].try_into().unwrap());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::{mkfs, OpenFlags};

    fn fresh_fs(dir: &tempfile::TempDir) -> V6Fs {
        let path = dir.path().join("img");
        mkfs::create_image(&path, 512, 64, None).unwrap();
        V6Fs::open(&path, OpenFlags::default()).unwrap()
    }

    #[test]
    fn test_path_components() {
        assert_eq!(path_components(""), Vec::<String>::new());
        assert_eq!(path_components("/"), Vec::<String>::new());
        assert_eq!(path_components("/a/b"), vec!["a", "b"]);
        assert_eq!(path_components("a//b/"), vec!["a", "b"]);
        assert_eq!(path_components("a/./b"), vec!["a", "b"]);
        assert_eq!(path_components("a/../b"), vec!["b"]);
        assert_eq!(path_components("../a"), vec!["a"]);
    }

    #[test]
    fn test_mknod_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        let inum = mknod(&mut fs, "/file", None).unwrap();
        let ip = fs.namei("/file", None).unwrap().expect("file resolves");
        {
            let state = ip.lock();
            assert_eq!(state.id, inum);
            assert!(state.data.is_allocated());
            assert!(!state.data.is_dir());
            assert_eq!(state.data.i_nlink, 1);
            assert_eq!(state.data.i_mode & 0o777, 0o666);
        }

        assert!(matches!(mknod(&mut fs, "/file", None), Err(FsError::Exists)));
        assert!(fs.namei("/absent", None).unwrap().is_none());
    }

    #[test]
    fn test_mknod_with_init_callback() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        let inum = mknod(
            &mut fs,
            "/locked",
            Some(&|ino: &mut DiskInode| ino.i_mode |= 0o600),
        )
        .unwrap();
        let ip = fs.iget(inum).unwrap();
        assert_eq!(ip.lock().data.i_mode & 0o777, 0o600);
    }

    #[test]
    fn test_mkdir_updates_link_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        let inum = mkdir(&mut fs, "/sub", None).unwrap();
        let root = fs.iget(ROOT_INUMBER).unwrap();
        assert_eq!(root.lock().data.i_nlink, 3, "child contributes \"..\"");
        drop(root);

        let sub = fs.iget(inum).unwrap();
        {
            let state = sub.lock();
            assert!(state.data.is_dir());
            assert_eq!(state.data.i_nlink, 2);
        }
        drop(sub);

        // "." and ".." resolve through the new directory.
        let dot = fs.namei("/sub/.", None).unwrap().expect("dot resolves");
        assert_eq!(dot.lock().id, inum);
        drop(dot);
        let up = fs.namei("/sub/..", None).unwrap().expect("dotdot resolves");
        assert_eq!(up.lock().id, ROOT_INUMBER);
    }

    #[test]
    fn test_rmdir_refuses_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        mkdir(&mut fs, "/sub", None).unwrap();
        mknod(&mut fs, "/sub/file", None).unwrap();
        assert!(matches!(rmdir(&mut fs, "/sub"), Err(FsError::NotEmpty)));

        unlink(&mut fs, "/sub/file").unwrap();
        rmdir(&mut fs, "/sub").unwrap();
        assert!(fs.namei("/sub", None).unwrap().is_none());

        let root = fs.iget(ROOT_INUMBER).unwrap();
        assert_eq!(root.lock().data.i_nlink, 2);
    }

    #[test]
    fn test_link_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        let inum = mknod(&mut fs, "/a", None).unwrap();
        link(&mut fs, "/a", "/b").unwrap();

        let ip = fs.iget(inum).unwrap();
        assert_eq!(ip.lock().data.i_nlink, 2);
        drop(ip);

        // Both names reach the same inode.
        let via_b = fs.namei("/b", None).unwrap().expect("b resolves");
        assert_eq!(via_b.lock().id, inum);
        drop(via_b);

        unlink(&mut fs, "/a").unwrap();
        let ip = fs.iget(inum).unwrap();
        assert_eq!(ip.lock().data.i_nlink, 1);
        assert!(ip.lock().data.is_allocated());
        drop(ip);

        unlink(&mut fs, "/b").unwrap();
        let ip = fs.iget(inum).unwrap();
        assert!(!ip.lock().data.is_allocated(), "last unlink clears the inode");
    }

    #[test]
    fn test_link_to_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        mkdir(&mut fs, "/sub", None).unwrap();
        assert!(matches!(
            link(&mut fs, "/sub", "/alias"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_name_length_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        // Fourteen bytes is the V6 maximum; fifteen is rejected.
        mknod(&mut fs, "/abcdefghijklmn", None).unwrap();
        assert!(matches!(
            mknod(&mut fs, "/abcdefghijklmno", None),
            Err(FsError::NameTooLong)
        ));
    }

    #[test]
    fn test_free_counts_track_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = fresh_fs(&dir);

        let inodes_before = num_free_inodes(&mut fs).unwrap();
        let blocks_before = num_free_blocks(&mut fs).unwrap();

        mkdir(&mut fs, "/sub", None).unwrap();
        assert_eq!(num_free_inodes(&mut fs).unwrap(), inodes_before - 1);
        assert_eq!(
            num_free_blocks(&mut fs).unwrap(),
            blocks_before - 1,
            "a new directory consumes one data block"
        );

        rmdir(&mut fs, "/sub").unwrap();
        assert_eq!(num_free_inodes(&mut fs).unwrap(), inodes_before);
        assert_eq!(num_free_blocks(&mut fs).unwrap(), blocks_before);
    }
}
