use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use crate::utils::page_size;

const FREE_MAGIC1: u64 = 0xb587_a9ce_7792_88b5;
const FREE_MAGIC2: u64 = 0xaa75_b1b8_ac4c_d7d0;
const FREE_GARBAGE: u64 = 0x702e_0f91_a2a6_bec7;

/// Sentinel meaning "no page" in the free list.
const NO_PAGE: u64 = u64::MAX;

/// The largest backing size we are willing to pin in RAM.
const MLOCK_LIMIT: usize = 1 << 20;

/// A fixed pool of pseudo-physical pages.
///
/// Pages are backed by a shared mapping of an unlinked temporary file,
/// which is what allows a page's contents to be re-mapped at other
/// virtual addresses through the backing file descriptor. Each page
/// has a refcount: `-1` while on the free list, `>= 0` once allocated
/// (0 meaning allocated but not mapped anywhere).
///
/// Free pages form a singly linked list threaded through the page
/// contents themselves. Each free-list node is sandwiched between two
/// magic constants so that writes through stale page pointers are
/// caught the next time the page is allocated or freed.
pub struct PagePool {
    npages: usize,
    file: File,
    map: memmap2::MmapMut,
    refcounts: Vec<i32>,
    free_head: u64,
    nfree: usize,
}

impl PagePool {
    /// Create a pool of `npages` pages, each one OS page in size.
    pub fn new(npages: usize) -> io::Result<Self> {
        let ps = page_size();
        let size = npages
            .checked_mul(ps)
            .ok_or_else(|| io::Error::other("page pool size overflow"))?;

        let file = tempfile::tempfile()?;
        file.set_len(size as u64)?;

        // SAFETY: the mapping is private to this pool; nothing else
        // holds a view of the unlinked temporary file.
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file)? };

        // The pool holds decrypted plaintext, which must not leak to a
        // swap partition. mlock can fail for unprivileged processes,
        // so the result is ignored; munmap undoes a successful lock.
        if size <= MLOCK_LIMIT {
            // SAFETY: the range is owned by `map` for the pool's lifetime.
            unsafe { libc::mlock(map.as_ptr().cast(), size) };
        }

        let mut pool = Self {
            npages,
            file,
            map,
            refcounts: vec![-1; npages],
            free_head: NO_PAGE,
            nfree: npages,
        };
        for idx in (0..npages).rev() {
            pool.write_free_node(idx, pool.free_head);
            pool.free_head = idx as u64;
        }
        Ok(pool)
    }

    /// Total number of pages in the pool.
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Number of pages not currently allocated.
    pub fn nfree(&self) -> usize {
        self.nfree
    }

    /// Address of the first byte of pool memory.
    pub fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }

    pub(crate) fn backing_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Address of the page with index `idx`.
    pub fn page_addr(&self, idx: usize) -> usize {
        assert!(idx < self.npages, "page index {idx} out of pool range");
        self.base() + idx * page_size()
    }

    /// Index of the page containing pool address `addr`.
    pub fn page_index(&self, addr: usize) -> usize {
        assert_eq!(addr % page_size(), 0, "address {addr:#x} is not page aligned");
        let base = self.base();
        assert!(
            addr >= base && addr < base + self.npages * page_size(),
            "address {addr:#x} is not in the pool"
        );
        (addr - base) / page_size()
    }

    /// Byte offset of page `idx` within the backing file.
    pub(crate) fn backing_offset(&self, idx: usize) -> i64 {
        (idx * page_size()) as i64
    }

    /// Allocate a page, or return `None` if the pool is exhausted.
    /// The returned page index has refcount 0.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.free_head == NO_PAGE {
            return None;
        }
        let idx = self.free_head as usize;
        let next = self.take_free_node(idx);
        self.free_head = next;
        self.nfree -= 1;

        assert_eq!(
            self.refcounts[idx], -1,
            "allocated page {idx} was not marked free"
        );
        self.refcounts[idx] = 0;
        Some(idx)
    }

    /// Return page `idx` to the free list. The page must be allocated
    /// and unmapped (refcount exactly 0).
    pub fn free(&mut self, idx: usize) {
        assert!(idx < self.npages, "page index {idx} out of pool range");
        assert_eq!(
            self.refcounts[idx], 0,
            "freed page {idx} is still mapped or already free"
        );
        self.refcounts[idx] = -1;
        self.write_free_node(idx, self.free_head);
        self.free_head = idx as u64;
        self.nfree += 1;
    }

    pub(crate) fn refcount(&self, idx: usize) -> i32 {
        self.refcounts[idx]
    }

    pub(crate) fn refcount_inc(&mut self, idx: usize) {
        assert!(
            self.refcounts[idx] >= 0,
            "page {idx} was freed while still referenced"
        );
        self.refcounts[idx] += 1;
    }

    pub(crate) fn refcount_dec(&mut self, idx: usize) {
        assert!(
            self.refcounts[idx] > 0,
            "refcount underflow on page {idx}"
        );
        self.refcounts[idx] -= 1;
    }

    /// Mutable view of the page contents at `idx`.
    ///
    /// # Safety
    ///
    /// The caller must ensure the page is allocated and that no other
    /// live reference aliases the same page through the pool mapping.
    pub unsafe fn page_bytes_mut(&self, idx: usize) -> &mut [u8] {
        let addr = self.page_addr(idx) as *mut u8;
        unsafe { std::slice::from_raw_parts_mut(addr, page_size()) }
    }

    fn node_ptr(&self, idx: usize) -> *mut u64 {
        (self.base() + idx * page_size()) as *mut u64
    }

    fn write_free_node(&mut self, idx: usize, next: u64) {
        let p = self.node_ptr(idx);
        // SAFETY: idx is in range and the page is free, so the pool is
        // the only writer.
        unsafe {
            p.write_volatile(FREE_MAGIC1);
            p.add(1).write(next);
            p.add(2).write_volatile(FREE_MAGIC2);
        }
    }

    fn take_free_node(&mut self, idx: usize) -> u64 {
        let p = self.node_ptr(idx);
        // SAFETY: idx came off the free list, so the node layout is
        // expected to be intact.
        unsafe {
            let magic1 = p.read_volatile();
            let next = p.add(1).read();
            let magic2 = p.add(2).read_volatile();
            assert!(
                magic1 == FREE_MAGIC1 && magic2 == FREE_MAGIC2,
                "free page {idx} was overwritten (use after free)"
            );
            p.write_volatile(FREE_GARBAGE);
            p.add(1).write(FREE_GARBAGE);
            p.add(2).write_volatile(FREE_GARBAGE);
            next
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if self.nfree != self.npages {
            tracing::error!(
                nfree = self.nfree,
                npages = self.npages,
                "page pool dropped with allocated pages"
            );
            debug_assert!(false, "page pool dropped with allocated pages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_cycle() {
        let mut pool = PagePool::new(4).unwrap();
        assert_eq!(pool.nfree(), 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.nfree(), 2);
        assert_eq!(pool.refcount(a), 0);

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.nfree(), 4);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut pool = PagePool::new(2).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.free(a);
        let c = pool.alloc().unwrap();
        assert_eq!(c, a);
        pool.free(b);
        pool.free(c);
    }

    #[test]
    fn test_page_contents_survive() {
        let mut pool = PagePool::new(2).unwrap();
        let a = pool.alloc().unwrap();

        // SAFETY: `a` is allocated and no other view exists.
        let bytes = unsafe { pool.page_bytes_mut(a) };
        bytes.fill(0x3c);
        assert_eq!(bytes[page_size() - 1], 0x3c);

        bytes.fill(0);
        pool.free(a);
    }

    #[test]
    #[should_panic(expected = "use after free")]
    fn test_use_after_free_detected() {
        let mut pool = PagePool::new(2).unwrap();
        let a = pool.alloc().unwrap();
        pool.free(a);

        // Scribble over the freed page, clobbering the free-list node.
        // SAFETY: test-only violation of the pool contract.
        unsafe { pool.page_bytes_mut(a)[0..8].fill(0xff) };
        let _ = pool.alloc();
    }
}
