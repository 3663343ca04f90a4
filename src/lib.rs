//! Two storage subsystems sharing one design idiom: a bounded cache in
//! front of an on-disk layout with strict invariants, and a mediator
//! that keeps the disk consistent across failures.
//!
//! - [`MappedCryptFile`] demand-pages a transparently encrypted file
//!   into virtual memory, backed by a fixed pool of pseudo-physical
//!   pages shared by every open mapping and recycled with a global LRU.
//! - [`v6`] implements the classic Version-6 UNIX on-disk format with
//!   read/write operations, inode and buffer caches, a write-ahead
//!   physical redo log with CRC-protected records, crash replay, and an
//!   offline consistency checker.

pub mod crypto;
pub mod cryptfile;
pub mod mapped;
pub mod mem;
mod utils;
pub mod v6;

pub use self::crypto::{Key, XexCipher};
pub use self::cryptfile::CryptFile;
pub use self::mapped::MappedCryptFile;
pub use self::utils::page_size;
