//! Fault-driven virtual address regions.
//!
//! A [VirtRegion] reserves a range of address space with no backing
//! memory; any access faults. The first region constructed installs a
//! process-wide `SIGSEGV` handler which routes faults inside any live
//! region to that region's handler closure. Individual pages are then
//! bound to pseudo-physical pool pages with [map_page] and released
//! with [unmap_page].
//!
//! The fault handler runs in signal context. By contract it only
//! touches state it already owns (the global registries, the pool, and
//! the one faulting page through its pool address), so it never
//! re-faults into a managed region.

use std::collections::BTreeMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use super::pool::PagePool;
use crate::utils::{align_up, page_size};

/// Page protection bits, as passed to `mmap(2)`/`mprotect(2)`.
pub type Prot = i32;

/// Loads permitted, stores not.
pub const PROT_READ: Prot = libc::PROT_READ;
/// Loads and stores permitted.
pub const PROT_READ_WRITE: Prot = libc::PROT_READ | libc::PROT_WRITE;

/// A fault handler bound to a region, invoked with the faulting address.
pub type FaultHandler = Arc<dyn Fn(usize) + Send + Sync>;

struct RegionInfo {
    len: usize,
    handler: FaultHandler,
    pages_mapped: usize,
}

struct PageMapping {
    page_idx: usize,
    prot: Prot,
}

struct VmState {
    /// All live regions, indexed by base address.
    regions: BTreeMap<usize, RegionInfo>,
    /// Every virtual page currently bound to a pool page.
    pagemap: BTreeMap<usize, PageMapping>,
}

static VM_STATE: Mutex<VmState> = Mutex::new(VmState {
    regions: BTreeMap::new(),
    pagemap: BTreeMap::new(),
});

/// A contiguous range of virtual addresses whose pages fault until
/// explicitly bound to pool pages.
pub struct VirtRegion {
    base: usize,
    len: usize,
}

impl VirtRegion {
    /// Reserve a region of at least `nbytes` (rounded up to the page
    /// size, minimum one page) and associate `handler` with faults
    /// inside it.
    pub fn new(nbytes: usize, handler: FaultHandler) -> io::Result<Self> {
        let ps = page_size();
        let len = if nbytes == 0 { ps } else { align_up(nbytes, ps) };

        // SAFETY: requesting a fresh anonymous PROT_NONE reservation.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as usize;

        install_fault_handler();

        let mut state = VM_STATE.lock();
        state.regions.insert(
            base,
            RegionInfo {
                len,
                handler,
                pages_mapped: 0,
            },
        );
        tracing::debug!(base = format_args!("{base:#x}"), len, "reserved region");

        Ok(Self { base, len })
    }

    /// Address of the first page in the region.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total number of bytes in the region.
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for VirtRegion {
    fn drop(&mut self) {
        let info = VM_STATE.lock().regions.remove(&self.base);
        if let Some(info) = info {
            // A region reclaimed with live mappings means pool pages
            // leaked; refuse to limp on.
            if info.pages_mapped != 0 && !std::thread::panicking() {
                panic!(
                    "region at {:#x} dropped with {} mapped pages",
                    self.base, info.pages_mapped
                );
            }
        }
        // SAFETY: the region owns [base, base+len).
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

/// Bind virtual page `va` to pool page `page_idx` with protection
/// `prot`, replacing any previous binding. When only the protection
/// differs the mapping is updated in place.
pub fn map_page(
    pool: &mut PagePool,
    va: usize,
    page_idx: usize,
    prot: Prot,
) -> io::Result<()> {
    let ps = page_size();
    assert_eq!(va % ps, 0, "mapped address {va:#x} is not page aligned");

    let mut state = VM_STATE.lock();
    let state = &mut *state;

    let previous = state.pagemap.get(&va).map(|m| (m.page_idx, m.prot));
    match previous {
        Some((old_idx, old_prot)) if old_idx == page_idx => {
            if old_prot != prot {
                // SAFETY: va is a live page-aligned mapping we own.
                let rc = unsafe { libc::mprotect(va as *mut libc::c_void, ps, prot) };
                if rc == -1 {
                    return Err(io::Error::last_os_error());
                }
                state.pagemap.get_mut(&va).unwrap().prot = prot;
            }
            Ok(())
        }
        previous => {
            // SAFETY: MAP_FIXED inside a range this module reserved;
            // the pool file covers the requested offset.
            let rc = unsafe {
                libc::mmap(
                    va as *mut libc::c_void,
                    ps,
                    prot,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    pool.backing_fd(),
                    pool.backing_offset(page_idx),
                )
            };
            if rc == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            pool.refcount_inc(page_idx);
            if let Some((old_idx, _)) = previous {
                pool.refcount_dec(old_idx);
            } else {
                region_for_mut(&mut state.regions, va)
                    .expect("mapped address outside any region")
                    .pages_mapped += 1;
            }
            state.pagemap.insert(va, PageMapping { page_idx, prot });
            Ok(())
        }
    }
}

/// Remove the binding at `va`, if any. The virtual page reverts to
/// faulting on access.
pub fn unmap_page(pool: &mut PagePool, va: usize) -> io::Result<()> {
    let ps = page_size();
    assert_eq!(va % ps, 0, "unmapped address {va:#x} is not page aligned");

    let mut state = VM_STATE.lock();
    let state = &mut *state;

    let Some(mapping) = state.pagemap.remove(&va) else {
        return Ok(());
    };

    // SAFETY: replace the binding with a fresh PROT_NONE reservation so
    // later accesses fault again.
    let rc = unsafe {
        libc::mmap(
            va as *mut libc::c_void,
            ps,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if rc == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    pool.refcount_dec(mapping.page_idx);
    region_for_mut(&mut state.regions, va)
        .expect("unmapped address outside any region")
        .pages_mapped -= 1;
    Ok(())
}

fn region_for_mut(
    regions: &mut BTreeMap<usize, RegionInfo>,
    addr: usize,
) -> Option<&mut RegionInfo> {
    let (base, info) = regions.range_mut(..=addr).next_back()?;
    (addr < base + info.len).then_some(info)
}

fn install_fault_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: installing a process-wide handler once; the struct is
        // zero-initialised and every field we rely on is set below.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_flags = libc::SA_SIGINFO;
            let entry: extern "C" fn(
                libc::c_int,
                *mut libc::siginfo_t,
                *mut libc::c_void,
            ) = fault_entry;
            sa.sa_sigaction = entry as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut()) == -1 {
                panic!("sigaction(SIGSEGV): {}", io::Error::last_os_error());
            }
        }
    });
}

extern "C" fn fault_entry(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // SAFETY: the kernel hands us a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;

    let handler = {
        let state = VM_STATE.lock();
        state
            .regions
            .range(..=addr)
            .next_back()
            .filter(|(base, info)| addr < *base + info.len)
            .map(|(_, info)| Arc::clone(&info.handler))
    };

    let Some(handler) = handler else {
        fatal_fault("page fault at address outside any managed region");
    };

    // Handler failures cannot unwind through the signal frame; any
    // error here means the process state is unrecoverable.
    if catch_unwind(AssertUnwindSafe(|| handler(addr))).is_err() {
        fatal_fault("page fault handler panicked");
    }
}

fn fatal_fault(msg: &str) -> ! {
    // Only async-signal-safe calls from here on.
    // SAFETY: writing a static string to stderr.
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
    }
    std::process::abort();
}
