//! End-to-end behavior of encrypted file mappings: demand load,
//! write-back, flushing, and LRU eviction under a constrained pool.
//!
//! The physical page pool is a process-wide singleton, so these tests
//! serialize on a mutex and fully tear down their mappings (destroying
//! the pool) before releasing it.

use parking_lot::{Mutex, MutexGuard};
use vaultfs::{page_size, CryptFile, Key, MappedCryptFile};

static POOL_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    POOL_LOCK.lock()
}

fn page_label(name: &str, page: usize) -> Vec<u8> {
    format!("__test__, {name} page {page}").into_bytes()
}

/// Create an encrypted file of `npages` pages, each beginning with its
/// label and otherwise zero-filled.
fn make_labeled_file(
    dir: &tempfile::TempDir,
    name: &str,
    key: &str,
    npages: usize,
) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = CryptFile::open(Key::from_passphrase(key), &path).unwrap();
    let ps = page_size();
    for page in 0..npages {
        let mut buf = vec![0u8; ps];
        let label = page_label(name, page);
        buf[..label.len()].copy_from_slice(&label);
        file.aligned_pwrite(&buf, (page * ps) as u64).unwrap();
    }
    path
}

unsafe fn page_slice<'a>(base: *mut u8, page: usize) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(base.add(page * page_size()), page_size()) }
}

#[test]
fn test_mapped_read() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let ps = page_size();

    let path = make_labeled_file(&dir, "readme", "12345", 3);

    let mut mapped =
        MappedCryptFile::open(Key::from_passphrase("12345"), &path).unwrap();
    let base = mapped.map(0).unwrap();
    assert_eq!(mapped.map_size(), 3 * ps);

    for page in [1usize, 0, 2] {
        let label = page_label("readme", page);
        let bytes = unsafe { page_slice(base, page) };
        assert_eq!(&bytes[..label.len()], &label[..]);
    }

    let (pread, pwrite) = mapped.io_counters();
    assert_eq!(pread, (3 * ps) as u64);
    assert_eq!(pwrite, 0);
}

#[test]
fn test_mapped_write_and_drop() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let ps = page_size();
    let path = dir.path().join("fresh");

    {
        let mut mapped =
            MappedCryptFile::open(Key::from_passphrase("grow"), &path).unwrap();
        let base = mapped.map(3 * ps).unwrap();

        for page in [2usize, 0, 1] {
            let label = page_label("fresh", page);
            let bytes = unsafe { page_slice(base, page) };
            bytes[..label.len()].copy_from_slice(&label);
        }
    }

    let mut file = CryptFile::open(Key::from_passphrase("grow"), &path).unwrap();
    assert_eq!(file.file_size().unwrap(), (3 * ps) as u64);
    for page in 0..3 {
        let mut buf = vec![0u8; ps];
        let n = file.aligned_pread(&mut buf, (page * ps) as u64).unwrap();
        assert_eq!(n, ps);
        let label = page_label("fresh", page);
        assert_eq!(&buf[..label.len()], &label[..]);
    }
}

#[test]
fn test_in_place_modification_and_flush() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let ps = page_size();

    // Pages begin with "__zzzz__" so the patch below yields "__1234__".
    let path = dir.path().join("patchme");
    {
        let mut file =
            CryptFile::open(Key::from_passphrase("patch"), &path).unwrap();
        for page in 0..2usize {
            let mut buf = vec![0u8; ps];
            buf[..8].copy_from_slice(b"__zzzz__");
            file.aligned_pwrite(&buf, (page * ps) as u64).unwrap();
        }
    }

    let mut mapped =
        MappedCryptFile::open(Key::from_passphrase("patch"), &path).unwrap();
    let base = mapped.map(0).unwrap();

    let bytes = unsafe { page_slice(base, 1) };
    bytes[2..6].copy_from_slice(b"1234");
    mapped.flush().unwrap();

    let (pread, pwrite) = mapped.io_counters();
    assert_eq!(pread, ps as u64);
    assert_eq!(pwrite, ps as u64);

    let mut file = CryptFile::open(Key::from_passphrase("patch"), &path).unwrap();
    let mut buf = vec![0u8; ps];
    file.aligned_pread(&mut buf, ps as u64).unwrap();
    assert_eq!(&buf[..8], b"__1234__");
}

#[test]
fn test_lru_eviction_under_small_pool() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let ps = page_size();

    let path = make_labeled_file(&dir, "large", "evict", 15);

    MappedCryptFile::set_pool_pages(5);
    let mut mapped =
        MappedCryptFile::open(Key::from_passphrase("evict"), &path).unwrap();
    let base = mapped.map(0).unwrap();

    for page in 0..15usize {
        let label = page_label("large", page);
        let bytes = unsafe { page_slice(base, page) };
        assert_eq!(&bytes[..label.len()], &label[..]);
    }

    let (pread, pwrite) = mapped.io_counters();
    assert_eq!(pread, (15 * ps) as u64);
    assert_eq!(pwrite, 0, "clean evictions must not write");
}

#[test]
fn test_eviction_writes_back_dirty_pages() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let ps = page_size();

    let names = ["wb-one", "wb-two", "wb-three"];
    let paths: Vec<_> = names
        .iter()
        .map(|name| make_labeled_file(&dir, name, "writeback", 10))
        .collect();

    MappedCryptFile::set_pool_pages(5);
    let mut mapped: Vec<_> = paths
        .iter()
        .map(|path| {
            MappedCryptFile::open(Key::from_passphrase("writeback"), path).unwrap()
        })
        .collect();
    let bases: Vec<_> = mapped.iter_mut().map(|m| m.map(0).unwrap()).collect();

    // Dirty page 3 of every file.
    for (i, base) in bases.iter().enumerate() {
        let bytes = unsafe { page_slice(*base, 3) };
        bytes[..16].copy_from_slice(format!("modified file {i} ").as_bytes());
    }

    // Stream 9 pages of the first file; with only 5 physical pages this
    // evicts the dirty pages of the other two files (and our own).
    for page in 0..9usize {
        let label = page_label("wb-one", page);
        let bytes = unsafe { page_slice(bases[0], page) };
        if page == 3 {
            assert_eq!(&bytes[..16], b"modified file 0 ");
        } else {
            assert_eq!(&bytes[..label.len()], &label[..]);
        }
    }

    for (i, path) in paths.iter().enumerate() {
        let mut reader =
            CryptFile::open(Key::from_passphrase("writeback"), path).unwrap();
        let mut buf = vec![0u8; ps];
        reader.aligned_pread(&mut buf, (3 * ps) as u64).unwrap();
        if i == 0 {
            // The first file's dirty page was evicted during the scan
            // of its own pages, so the write-back is on disk too.
            assert_eq!(&buf[..16], b"modified file 0 ");
        } else {
            assert_eq!(&buf[..16], format!("modified file {i} ").as_bytes());
        }
    }
}

#[test]
fn test_grow_via_remap() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let ps = page_size();
    let path = dir.path().join("growing");

    let mut mapped =
        MappedCryptFile::open(Key::from_passphrase("remap"), &path).unwrap();
    let base = mapped.map(ps).unwrap();
    (unsafe { page_slice(base, 0) })[..5].copy_from_slice(b"first");
    mapped.unmap().unwrap();

    let base = mapped.map(4 * ps).unwrap();
    assert_eq!(mapped.map_size(), 4 * ps);
    assert_eq!(&unsafe { page_slice(base, 0) }[..5], b"first");
    (unsafe { page_slice(base, 3) })[..4].copy_from_slice(b"last");
    drop(mapped);

    let mut file = CryptFile::open(Key::from_passphrase("remap"), &path).unwrap();
    let mut buf = vec![0u8; ps];
    file.aligned_pread(&mut buf, (3 * ps) as u64).unwrap();
    assert_eq!(&buf[..4], b"last");
}
