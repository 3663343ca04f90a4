//! A byte-granular cursor over a file's contents.
//!
//! Reads return zeros inside sparse holes; writes allocate the
//! missing blocks and extend the file size. The cursor keeps a
//! reference to the buffer of the sector it last touched so streaming
//! access does not re-run the block mapping for every call.

use super::cache::{BufRef, InodeRef};
use super::inode::{self, DoLog};
use super::layout::{Dirent, DIRENT_SIZE, MAX_FILE_SIZE, SECTOR_SIZE};
use super::{FsError, V6Fs};

/// A read/write position within one file.
pub struct Cursor {
    ip: InodeRef,
    pos: u32,
    bp: Option<BufRef>,
}

impl Cursor {
    /// Start a cursor at the beginning of `ip`.
    pub fn new(ip: InodeRef) -> Self {
        Self { ip, pos: 0, bp: None }
    }

    /// Current byte position.
    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Move the position, dropping the cached buffer when it no longer
    /// covers the new position.
    pub fn seek(&mut self, pos: u32) -> Result<(), FsError> {
        if pos > MAX_FILE_SIZE {
            return Err(FsError::FileTooBig);
        }
        if pos / SECTOR_SIZE as u32 != self.pos / SECTOR_SIZE as u32 {
            self.bp = None;
        }
        self.pos = pos;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the current position. Holes
    /// read as zeros; the count is short only at end of file.
    pub fn read(&mut self, fs: &mut V6Fs, buf: &mut [u8]) -> Result<usize, FsError> {
        let filesize = self.ip.lock().data.size();
        let mut done = 0;

        while done < buf.len() && self.pos < filesize {
            let start = self.pos as usize % SECTOR_SIZE;
            if start == 0 {
                self.bp = None;
            }
            let mut take = SECTOR_SIZE - start;
            take = take.min(buf.len() - done);
            take = take.min((filesize - self.pos) as usize);

            if self.bp.is_none() {
                self.bp = inode::getblock(fs, &self.ip, self.pos / SECTOR_SIZE as u32, false)?;
            }
            match &self.bp {
                Some(bp) => {
                    let b = bp.lock();
                    buf[done..done + take].copy_from_slice(&b.data.mem[start..start + take]);
                }
                None => buf[done..done + take].fill(0),
            }
            done += take;
            self.pos += take as u32;
        }

        if done > 0 {
            inode::atouch(fs, &self.ip);
        }
        if self.pos % SECTOR_SIZE as u32 == 0 {
            self.bp = None;
        }
        Ok(done)
    }

    /// Write `buf` at the current position, allocating blocks and
    /// growing the file as needed. File data bytes are not journaled;
    /// only the size and mtime updates are.
    pub fn write(&mut self, fs: &mut V6Fs, buf: &[u8]) -> Result<usize, FsError> {
        if buf.len() as u32 > MAX_FILE_SIZE - self.pos {
            return Err(FsError::FileTooBig);
        }

        let mut done = 0;
        while done < buf.len() {
            let start = self.pos as usize % SECTOR_SIZE;
            if start == 0 {
                self.bp = None;
            }
            let take = (SECTOR_SIZE - start).min(buf.len() - done);

            if self.bp.is_none() {
                self.bp =
                    inode::getblock(fs, &self.ip, self.pos / SECTOR_SIZE as u32, true)?;
            }
            let Some(bp) = &self.bp else { break };
            {
                let mut b = bp.lock();
                b.data.mem[start..start + take].copy_from_slice(&buf[done..done + take]);
                b.mark_dirty();
            }
            done += take;
            self.pos += take as u32;
        }

        if done > 0 {
            if self.pos > self.ip.lock().data.size() {
                inode::set_size(fs, &self.ip, self.pos)?;
                inode::mtouch(fs, &self.ip, DoLog::Log)?;
            } else {
                inode::mtouch(fs, &self.ip, DoLog::NoLog)?;
            }
        }
        if self.pos % SECTOR_SIZE as u32 == 0 {
            self.bp = None;
        }
        if done == buf.len() {
            Ok(done)
        } else {
            Err(FsError::Exhausted("short write"))
        }
    }

    /// Return the next directory entry and its byte position, skipping
    /// sparse blocks, or `None` at end of directory.
    pub fn next_dirent(
        &mut self,
        fs: &mut V6Fs,
    ) -> Result<Option<(u32, Dirent)>, FsError> {
        let filesize = self.ip.lock().data.size();
        loop {
            if self.pos >= filesize || filesize - self.pos < DIRENT_SIZE as u32 {
                return Ok(None);
            }
            let start = self.pos as usize % SECTOR_SIZE;
            if start == 0 || self.bp.is_none() {
                self.bp =
                    inode::getblock(fs, &self.ip, self.pos / SECTOR_SIZE as u32, false)?;
            }
            match &self.bp {
                None => {
                    // Hole: skip to the next sector.
                    self.pos = self.pos - start as u32 + SECTOR_SIZE as u32;
                }
                Some(bp) => {
                    let entry = {
                        let b = bp.lock();
                        Dirent::decode(&b.data.mem[start..start + DIRENT_SIZE])
                    };
                    let pos = self.pos;
                    self.pos += DIRENT_SIZE as u32;
                    return Ok(Some((pos, entry)));
                }
            }
        }
    }
}
