//! Demand-paged, transparently encrypted file mappings.
//!
//! A [MappedCryptFile] exposes the decrypted contents of a
//! [CryptFile] as a range of virtual memory. Pages are loaded on
//! first access, upgraded to writable (and marked dirty) on the first
//! store, and recycled through a fixed pool of pseudo-physical pages
//! shared by every open mapping in the process. When the pool runs
//! dry the globally least-recently-touched page is evicted, written
//! back through its owner's file if dirty.
//!
//! The pool and the LRU list are process-wide singletons, created
//! lazily by the first `map` call and torn down when the last mapping
//! is dropped.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::Key;
use crate::cryptfile::{CryptFile, CryptFileError};
use crate::mem::pool::PagePool;
use crate::mem::region::{self, FaultHandler, VirtRegion, PROT_READ, PROT_READ_WRITE};
use crate::utils::{align_up, page_size};

/// Default number of pages in the shared pool.
const DEFAULT_POOL_PAGES: usize = 1000;

const NO_NODE: usize = usize::MAX;

static RUNTIME: Mutex<Runtime> = Mutex::new(Runtime {
    pool_pages: DEFAULT_POOL_PAGES,
    next_id: 0,
    instances: 0,
    pool: None,
    lru: LruList::empty(),
    mappings: BTreeMap::new(),
});

struct Runtime {
    pool_pages: usize,
    next_id: u64,
    /// Number of live mapped regions; the pool dies with the last one.
    instances: usize,
    pool: Option<PagePool>,
    lru: LruList,
    mappings: BTreeMap<u64, MappingState>,
}

struct MappingState {
    file: Arc<Mutex<CryptFile>>,
    base: usize,
    pages: BTreeMap<usize, PageSlot>,
}

struct PageSlot {
    page_idx: usize,
    dirty: bool,
}

/// A [CryptFile] that can additionally be memory-mapped, with pages
/// decrypted on the way in and re-encrypted on write-back.
pub struct MappedCryptFile {
    file: Arc<Mutex<CryptFile>>,
    id: u64,
    region: Option<VirtRegion>,
    size: usize,
}

impl MappedCryptFile {
    /// Open `path` (created if absent) with the given encryption key.
    pub fn open(key: Key, path: impl AsRef<Path>) -> io::Result<Self> {
        let file = CryptFile::open(key, path)?;
        let id = {
            let mut rt = RUNTIME.lock();
            rt.next_id += 1;
            rt.next_id
        };
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            id,
            region: None,
            size: 0,
        })
    }

    /// Set the number of pages in the physical pool shared by all
    /// mappings. Only effective before the pool exists, i.e. before
    /// the first `map` call (or after every mapping has been dropped).
    pub fn set_pool_pages(npages: usize) {
        let mut rt = RUNTIME.lock();
        if rt.pool.is_some() {
            tracing::warn!(npages, "pool already instantiated, size unchanged");
            return;
        }
        rt.pool_pages = npages;
    }

    /// Map the decrypted file contents and return the base address of
    /// the region. The region covers `max(min_size, file_size())`
    /// bytes rounded up to the page size.
    ///
    /// To grow a file that is already mapped, `unmap` and re-`map`;
    /// the new base address will usually differ.
    pub fn map(&mut self, min_size: usize) -> io::Result<*mut u8> {
        let file_size = self.file.lock().file_size()? as usize;
        let wanted = align_up(min_size.max(file_size).max(1), page_size());

        if let Some(region) = &self.region {
            self.size = wanted.min(region.len());
            return Ok(region.base() as *mut u8);
        }

        let id = self.id;
        let handler: FaultHandler = Arc::new(move |addr| service_fault(id, addr));
        let region = VirtRegion::new(wanted, handler)?;

        let mut rt = RUNTIME.lock();
        if rt.pool.is_none() {
            let pool = PagePool::new(rt.pool_pages)?;
            tracing::info!(npages = pool.npages(), "created physical page pool");
            rt.lru.reset(pool.npages());
            rt.pool = Some(pool);
        }
        rt.instances += 1;
        rt.mappings.insert(
            id,
            MappingState {
                file: Arc::clone(&self.file),
                base: region.base(),
                pages: BTreeMap::new(),
            },
        );
        drop(rt);

        self.size = wanted;
        let base = region.base() as *mut u8;
        self.region = Some(region);
        Ok(base)
    }

    /// Address of the first byte of the mapped region.
    ///
    /// Panics when called before `map` or after `unmap`.
    pub fn map_base(&self) -> *mut u8 {
        self.region
            .as_ref()
            .expect("map_base called on an unmapped file")
            .base() as *mut u8
    }

    /// Size in bytes of the mapped region.
    pub fn map_size(&self) -> usize {
        self.size
    }

    /// Write every dirty page back to the encrypted file. Pages stay
    /// resident and writable; the mapping is unchanged.
    pub fn flush(&self) -> Result<(), CryptFileError> {
        let rt = RUNTIME.lock();
        let Some(mapping) = rt.mappings.get(&self.id) else {
            return Ok(());
        };
        let pool = rt.pool.as_ref().expect("pool missing with live mapping");

        let mut file = mapping.file.lock();
        for (vpi, slot) in &mapping.pages {
            if !slot.dirty {
                continue;
            }
            // SAFETY: the slot owns this pool page; we read it through
            // its pseudo-physical address, which cannot fault.
            let bytes = unsafe { pool.page_bytes_mut(slot.page_idx) };
            file.aligned_pwrite(bytes, (vpi * page_size()) as u64)?;
        }
        Ok(())
    }

    /// Flush, release every resident page, and tear down the region.
    /// All pointers into the mapping are invalidated.
    pub fn unmap(&mut self) -> Result<(), CryptFileError> {
        if self.region.is_none() {
            return Ok(());
        }
        self.flush()?;

        let mut rt = RUNTIME.lock();
        let rt = &mut *rt;
        if let Some(mapping) = rt.mappings.remove(&self.id) {
            let pool = rt.pool.as_mut().expect("pool missing with live mapping");
            for (vpi, slot) in mapping.pages {
                let va = mapping.base + vpi * page_size();
                region::unmap_page(pool, va)?;
                rt.lru.unlink(slot.page_idx);
                pool.free(slot.page_idx);
            }
            rt.instances -= 1;
            if rt.instances == 0 {
                tracing::info!("last mapping dropped, destroying page pool");
                rt.pool = None;
                rt.lru.reset(0);
            }
        }
        drop(rt);

        self.region = None;
        self.size = 0;
        Ok(())
    }

    /// Bytes decrypted and encrypted so far, `(pread, pwrite)`.
    pub fn io_counters(&self) -> (u64, u64) {
        let file = self.file.lock();
        (file.pread_bytes, file.pwrite_bytes)
    }

    /// Current length of the underlying ciphertext file.
    pub fn file_size(&self) -> io::Result<u64> {
        self.file.lock().file_size()
    }
}

impl Drop for MappedCryptFile {
    fn drop(&mut self) {
        if let Err(error) = self.unmap() {
            tracing::error!(?error, "flush during unmap failed, changes lost");
        }
    }
}

/// Service a fault at `addr` inside the mapping `id`.
///
/// Runs in signal context; every failure is fatal to the process, so
/// the lookups assert rather than propagate.
fn service_fault(id: u64, addr: usize) {
    let ps = page_size();
    let mut rt = RUNTIME.lock();
    let rt = &mut *rt;

    let mapping = rt.mappings.get(&id).expect("fault for a dead mapping");
    let base = mapping.base;
    let file = Arc::clone(&mapping.file);
    let vpi = (addr - base) / ps;
    let va = base + vpi * ps;

    let resident = mapping.pages.get(&vpi).map(|slot| slot.page_idx);
    if let Some(page_idx) = resident {
        // Second fault on a resident page: a store hit a read-only
        // mapping. Upgrade and mark dirty.
        let pool = rt.pool.as_mut().expect("pool missing with live mapping");
        region::map_page(pool, va, page_idx, PROT_READ_WRITE)
            .expect("upgrade page protection");
        rt.mappings
            .get_mut(&id)
            .unwrap()
            .pages
            .get_mut(&vpi)
            .unwrap()
            .dirty = true;
        rt.lru.move_front(page_idx);
        return;
    }

    // First touch: bring the page in read-only.
    let page_idx = loop {
        if let Some(idx) = rt.pool.as_mut().unwrap().alloc() {
            break idx;
        }
        evict_lru_tail(rt);
    };

    let pool = rt.pool.as_mut().unwrap();
    // SAFETY: freshly allocated page; nothing else references it yet.
    let bytes = unsafe { pool.page_bytes_mut(page_idx) };
    bytes.fill(0);
    let offset = (vpi * ps) as u64;
    file.lock()
        .aligned_pread(bytes, offset)
        .expect("decrypt page on fault");

    region::map_page(pool, va, page_idx, PROT_READ).expect("map faulted page");
    rt.mappings
        .get_mut(&id)
        .unwrap()
        .pages
        .insert(vpi, PageSlot { page_idx, dirty: false });
    rt.lru.push_front(page_idx, id, vpi);
}

/// Evict the least-recently-touched page in the process, writing it
/// back through its owner if dirty, and return it to the pool.
fn evict_lru_tail(rt: &mut Runtime) {
    let (page_idx, owner, vpi) = rt.lru.pop_back().expect("pool empty with empty LRU");

    let mapping = rt
        .mappings
        .get_mut(&owner)
        .expect("LRU entry owned by a dead mapping");
    let slot = mapping
        .pages
        .remove(&vpi)
        .expect("LRU entry without a page slot");
    assert_eq!(slot.page_idx, page_idx, "LRU entry out of sync with mapping");

    let ps = page_size();
    if slot.dirty {
        let pool = rt.pool.as_ref().unwrap();
        // SAFETY: the page is still owned by the evicted slot; access
        // goes through the pseudo-physical address.
        let bytes = unsafe { pool.page_bytes_mut(page_idx) };
        mapping
            .file
            .lock()
            .aligned_pwrite(bytes, (vpi * ps) as u64)
            .expect("write back evicted page");
    }

    let va = mapping.base + vpi * ps;
    let pool = rt.pool.as_mut().unwrap();
    region::unmap_page(pool, va).expect("unmap evicted page");
    pool.free(page_idx);
    tracing::trace!(page_idx, owner, vpi, "evicted page");
}

/// Intrusive doubly-linked LRU over pool page indices, most recently
/// touched at the head. Each linked node records which mapping and
/// virtual page currently own the pool page.
struct LruList {
    head: usize,
    tail: usize,
    nodes: Vec<LruNode>,
}

struct LruNode {
    prev: usize,
    next: usize,
    owner: u64,
    vpage: usize,
    linked: bool,
}

impl LruList {
    const fn empty() -> Self {
        Self {
            head: NO_NODE,
            tail: NO_NODE,
            nodes: Vec::new(),
        }
    }

    fn reset(&mut self, npages: usize) {
        self.head = NO_NODE;
        self.tail = NO_NODE;
        self.nodes = (0..npages)
            .map(|_| LruNode {
                prev: NO_NODE,
                next: NO_NODE,
                owner: 0,
                vpage: 0,
                linked: false,
            })
            .collect();
    }

    fn push_front(&mut self, idx: usize, owner: u64, vpage: usize) {
        let node = &mut self.nodes[idx];
        assert!(!node.linked, "page {idx} already on the LRU list");
        node.owner = owner;
        node.vpage = vpage;
        node.linked = true;
        node.prev = NO_NODE;
        node.next = self.head;

        if self.head != NO_NODE {
            self.nodes[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        if !node.linked {
            return;
        }
        let (prev, next) = (node.prev, node.next);
        node.linked = false;
        node.prev = NO_NODE;
        node.next = NO_NODE;

        if prev != NO_NODE {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NO_NODE {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn move_front(&mut self, idx: usize) {
        let (owner, vpage) = {
            let node = &self.nodes[idx];
            assert!(node.linked, "page {idx} is not on the LRU list");
            (node.owner, node.vpage)
        };
        self.unlink(idx);
        self.push_front(idx, owner, vpage);
    }

    fn pop_back(&mut self) -> Option<(usize, u64, usize)> {
        if self.tail == NO_NODE {
            return None;
        }
        let idx = self.tail;
        let (owner, vpage) = {
            let node = &self.nodes[idx];
            (node.owner, node.vpage)
        };
        self.unlink(idx);
        Some((idx, owner, vpage))
    }
}
