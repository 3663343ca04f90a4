//! Pseudo-physical page management.
//!
//! [`pool::PagePool`] hands out fixed-size pages backed by a shared
//! mapping of an unlinked temporary file, so the same page contents
//! can be aliased at arbitrary virtual addresses. [`region::VirtRegion`]
//! reserves fault-generating virtual address ranges and binds pool
//! pages into them on demand.

pub mod pool;
pub mod region;

pub use self::pool::PagePool;
pub use self::region::VirtRegion;
