//! Bounded caches for sectors and inodes.
//!
//! Both caches share one mechanism: a fixed pool of slots, an id
//! index, and an LRU list for victim selection. A slot is handed out
//! as a reference-counted handle; while any handle other than the
//! cache's own is live the slot cannot be evicted. A dirty slot that
//! carries a logged-but-uncommitted patch is pinned until the log
//! commits past its LSN, which is what makes write-back safe under
//! write-ahead logging.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::layout::{DiskInode, SECTOR_SIZE};
use super::record::{lsn_le, Lsn};
use super::FsError;

/// Default number of buffer slots.
pub const DEFAULT_NBUF: usize = 16;
/// Default number of in-core inodes.
pub const DEFAULT_NINODE: usize = 100;

/// Payload stored in a cache slot.
pub trait CacheData {
    /// A fresh, empty payload.
    fn fresh() -> Self;
    /// Reset a recycled payload to its empty state.
    fn reset(&mut self);
}

/// One sector of data.
pub struct BlockData {
    /// The sector contents.
    pub mem: [u8; SECTOR_SIZE],
}

impl CacheData for BlockData {
    fn fresh() -> Self {
        Self {
            mem: [0; SECTOR_SIZE],
        }
    }

    fn reset(&mut self) {
        self.mem.fill(0);
    }
}

impl CacheData for DiskInode {
    fn fresh() -> Self {
        DiskInode::zeroed()
    }

    fn reset(&mut self) {
        *self = DiskInode::zeroed();
    }
}

/// A cache slot: identity, state flags, and the payload.
#[derive(Debug)]
pub struct CacheEntry<T> {
    /// Block number or inumber, valid while `in_use`.
    pub id: u16,
    pub(super) in_use: bool,
    /// Payload has been loaded from disk.
    pub initialized: bool,
    /// Payload is newer than the disk.
    pub dirty: bool,
    /// LSN of the newest log record describing this payload, if any.
    /// Write-back is forbidden until the log commits past it.
    pub logged: Option<Lsn>,
    /// The cached payload.
    pub data: T,
}

impl<T> CacheEntry<T> {
    /// Mark the payload loaded and newer than disk (delayed write).
    pub fn mark_dirty(&mut self) {
        self.initialized = true;
        self.dirty = true;
    }
}

/// A shared handle to a cache slot. Slot eviction is forbidden while
/// any handle beyond the cache's own is alive.
pub type EntryRef<T> = Arc<Mutex<CacheEntry<T>>>;

/// Handle to a cached sector.
pub type BufRef = EntryRef<BlockData>;
/// Handle to a cached inode.
pub type InodeRef = EntryRef<DiskInode>;

/// Raised by a lookup when no slot could be recycled.
pub enum LookupError {
    /// Every slot is referenced or pinned by the log.
    Full,
    /// A victim write-back failed.
    Failed(FsError),
}

/// A fixed-capacity cache with LRU victim selection.
pub struct Cache<T> {
    name: &'static str,
    slots: Vec<EntryRef<T>>,
    index: BTreeMap<u16, usize>,
    /// Slot indices, least recently used first.
    lru: Vec<usize>,
}

impl<T: CacheData> Cache<T> {
    /// Create a cache with `capacity` slots.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let slots: Vec<EntryRef<T>> = (0..capacity)
            .map(|_| {
                Arc::new(Mutex::new(CacheEntry {
                    id: 0,
                    in_use: false,
                    initialized: false,
                    dirty: false,
                    logged: None,
                    data: T::fresh(),
                }))
            })
            .collect();
        let lru = (0..capacity).collect();
        Self {
            name,
            slots,
            index: BTreeMap::new(),
            lru,
        }
    }

    /// Return the cached entry for `id` without allocating.
    pub fn try_lookup(&mut self, id: u16) -> Option<EntryRef<T>> {
        let slot = *self.index.get(&id)?;
        self.touch(slot);
        Some(Arc::clone(&self.slots[slot]))
    }

    /// Return the entry for `id`, recycling a victim slot when absent.
    ///
    /// `writeback` persists a dirty victim before it is recycled.
    /// `committed` is the newest durable LSN, gating eviction of
    /// logged entries.
    pub fn lookup(
        &mut self,
        id: u16,
        committed: Option<Lsn>,
        writeback: &mut dyn FnMut(&mut CacheEntry<T>) -> Result<(), FsError>,
    ) -> Result<EntryRef<T>, LookupError> {
        if let Some(entry) = self.try_lookup(id) {
            return Ok(entry);
        }

        let Some((pos, slot)) = self.find_victim(committed) else {
            return Err(LookupError::Full);
        };

        let entry = Arc::clone(&self.slots[slot]);
        {
            let mut state = entry.lock();
            if state.in_use {
                if state.dirty {
                    writeback(&mut state).map_err(LookupError::Failed)?;
                }
                self.index.remove(&state.id);
            }
            state.id = id;
            state.in_use = true;
            state.initialized = false;
            state.dirty = false;
            state.logged = None;
            state.data.reset();
        }
        self.index.insert(id, slot);

        self.lru.remove(pos);
        self.lru.push(slot);
        Ok(entry)
    }

    /// True when the next `want` lookups can recycle slots without a
    /// log flush.
    pub fn can_alloc(&self, committed: Option<Lsn>, want: usize) -> bool {
        let mut n = want;
        for &slot in &self.lru {
            if n == 0 {
                break;
            }
            let entry = &self.slots[slot];
            if Arc::strong_count(entry) > 1 {
                continue;
            }
            let state = entry.lock();
            if !state.in_use || Self::evictable(&state, committed) {
                n -= 1;
            }
        }
        n == 0
    }

    /// Discard the entry for `id` (if cached) without writing it back,
    /// and queue its slot for preferential reuse.
    pub fn free(&mut self, id: u16) {
        let Some(slot) = self.index.remove(&id) else {
            return;
        };
        {
            let mut state = self.slots[slot].lock();
            state.in_use = false;
            state.initialized = false;
            state.dirty = false;
            state.logged = None;
        }
        let pos = self.lru.iter().position(|s| *s == slot).unwrap();
        self.lru.remove(pos);
        self.lru.insert(0, slot);
    }

    /// Write back every dirty entry whose LSN (if any) has committed.
    /// Returns false when any write-back failed.
    pub fn flush(
        &mut self,
        committed: Option<Lsn>,
        writeback: &mut dyn FnMut(&mut CacheEntry<T>) -> Result<(), FsError>,
    ) -> bool {
        let mut ok = true;
        for slot in self.index.values() {
            let mut state = self.slots[*slot].lock();
            if !state.dirty {
                continue;
            }
            let durable = match state.logged {
                None => true,
                Some(lsn) => committed.is_some_and(|c| lsn_le(lsn, c)),
            };
            if !durable {
                continue;
            }
            match writeback(&mut state) {
                Ok(()) => {
                    state.dirty = false;
                    state.logged = None;
                }
                Err(error) => {
                    tracing::error!(cache = self.name, id = state.id, ?error, "cache flush failed");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Discard every entry without write-back.
    pub fn invalidate(&mut self) {
        let ids: Vec<u16> = self.index.keys().copied().collect();
        for id in ids {
            self.free(id);
        }
    }

    fn find_victim(&self, committed: Option<Lsn>) -> Option<(usize, usize)> {
        for (pos, &slot) in self.lru.iter().enumerate() {
            let entry = &self.slots[slot];
            if Arc::strong_count(entry) > 1 {
                continue;
            }
            let state = entry.lock();
            if !state.in_use || Self::evictable(&state, committed) {
                return Some((pos, slot));
            }
        }
        None
    }

    fn evictable(state: &CacheEntry<T>, committed: Option<Lsn>) -> bool {
        match state.logged {
            None => true,
            Some(lsn) => committed.is_some_and(|c| lsn_le(lsn, c)),
        }
    }

    fn touch(&mut self, slot: usize) {
        let pos = self.lru.iter().position(|s| *s == slot).unwrap();
        self.lru.remove(pos);
        self.lru.push(slot);
    }
}
