//! Image creation: a zero-filled volume with a superblock, a boot
//! magic, a populated free list, and a root directory.

use std::path::Path;

use super::inode;
use super::layout::{
    Superblock, BOOTBLOCK_MAGIC_NUM, IALLOC, IFDIR, INODES_PER_BLOCK, ROOT_INUMBER,
    SECTOR_SIZE, SUPERBLOCK_SECTOR,
};
use super::log::Log;
use super::{FsError, OpenFlags, V6Fs};
use crate::utils::create_file;

/// Create a fresh image at `path` with `nblocks` sectors and space for
/// `ninodes` inodes. `log_blocks` adds a journal (`Some(0)` picks a
/// size proportional to the image).
pub fn create_image(
    path: impl AsRef<Path>,
    nblocks: u32,
    ninodes: u32,
    log_blocks: Option<u16>,
) -> Result<(), FsError> {
    let path = path.as_ref();
    let nblocks = nblocks.min(0xffff);
    let ninodes = ninodes.min(nblocks);

    {
        let file = create_file(path, false)?;
        file.set_len(nblocks as u64 * SECTOR_SIZE as u64)?;

        let mut sb = Superblock::decode(&[0u8; SECTOR_SIZE]);
        sb.s_isize = ninodes.div_ceil(INODES_PER_BLOCK as u32) as u16;
        sb.s_fsize = nblocks as u16;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        sb.set_time(now);

        use std::os::unix::fs::FileExt;
        file.write_all_at(&sb.encode(), SUPERBLOCK_SECTOR as u64 * SECTOR_SIZE as u64)?;
        file.write_all_at(&BOOTBLOCK_MAGIC_NUM.to_le_bytes(), 0)?;
        file.sync_all()?;
    }

    let mut fs = V6Fs::open(path, OpenFlags::default())?;

    // Build the legacy free list backward so allocations come out in
    // ascending block runs.
    let start = fs.sb.datastart();
    for blockno in (start..nblocks).rev() {
        fs.bfree(blockno as u16)?;
    }

    let root = fs.iget(ROOT_INUMBER)?;
    let first_block = fs.balloc(true)?;
    {
        let mut state = root.lock();
        state.data.i_mode = IALLOC | IFDIR | 0o755;
        state.data.i_nlink = 2;
        state.data.i_addr[0] = first_block.lock().id;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        state.data.set_atime(now);
        state.data.set_mtime(now);
        state.mark_dirty();
    }
    drop(first_block);

    let dot = inode::dir_create(&mut fs, &root, b".")?;
    inode::set_dirent_inum(&mut fs, &root, &dot, ROOT_INUMBER)?;
    let dotdot = inode::dir_create(&mut fs, &root, b"..")?;
    inode::set_dirent_inum(&mut fs, &root, &dotdot, ROOT_INUMBER)?;
    drop(root);

    if let Some(log_blocks) = log_blocks {
        Log::create(&mut fs, log_blocks)?;
    }
    fs.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::fsck;

    #[test]
    fn test_fresh_image_has_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        create_image(&path, 256, 32, None).unwrap();

        let mut fs = V6Fs::open(&path, OpenFlags::default()).unwrap();
        let root = fs.namei("/", None).unwrap().expect("root resolves");
        {
            let state = root.lock();
            assert!(state.data.is_dir());
            assert_eq!(state.data.i_nlink, 2);
            assert_eq!(state.data.size(), 32);
        }
        drop(root);

        let dot = fs.namei(".", None).unwrap().expect("dot resolves");
        assert_eq!(dot.lock().id, ROOT_INUMBER);
    }

    #[test]
    fn test_fresh_image_passes_fsck() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        create_image(&path, 256, 32, None).unwrap();

        let mut fs = V6Fs::open(
            &path,
            OpenFlags {
                nolog: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(fsck::fsck(&mut fs, false).unwrap());
    }

    #[test]
    fn test_journaled_image_opens_with_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        create_image(&path, 512, 64, Some(0)).unwrap();

        let fs = V6Fs::open(&path, OpenFlags::default()).unwrap();
        assert!(fs.log.is_some());
        assert_eq!(fs.sb.s_uselog, 1);
        assert_eq!(fs.sb.s_nfree, 0, "freemap replaces the legacy free list");
        let free = fs.log.as_ref().unwrap().freemap.count_set();
        assert!(free > 0);
    }
}
