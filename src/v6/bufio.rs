//! Buffered positioned I/O over the image file, used by the journal
//! writer, replay, and the log dumper.
//!
//! Both halves keep their internal buffer aligned so that a buffer
//! boundary always coincides with a `BUF_SIZE`-aligned file offset.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

const BUF_SIZE: usize = 8192;

fn offset(pos: u32) -> u32 {
    pos % BUF_SIZE as u32
}

fn lower_bound(pos: u32) -> u32 {
    pos - offset(pos)
}

fn upper_bound(pos: u32) -> u32 {
    lower_bound(pos) + BUF_SIZE as u32
}

/// A buffered reader with an explicit seek position.
pub struct ImageReader {
    file: File,
    buf: Box<[u8; BUF_SIZE]>,
    buf_end: u32,
    pos: u32,
}

impl ImageReader {
    /// Wrap a (duplicated) handle to the image file.
    pub fn new(file: File) -> Self {
        Self {
            file,
            buf: Box::new([0; BUF_SIZE]),
            buf_end: 0,
            pos: 0,
        }
    }

    /// Read exactly `dst.len()` bytes at the current position.
    ///
    /// Returns `Ok(false)` when end of file arrives first, leaving the
    /// position wherever the partial read stopped.
    pub fn try_read(&mut self, dst: &mut [u8]) -> io::Result<bool> {
        let mut dst = dst;
        while !dst.is_empty() {
            if self.pos >= self.buf_end {
                let start = lower_bound(self.pos);
                let n = self.file.read_at(&mut self.buf[..], start as u64)?;
                if n as u32 <= offset(self.pos) {
                    return Ok(false);
                }
                self.buf_end = start + n as u32;
            }
            let take = ((self.buf_end - self.pos) as usize).min(dst.len());
            let at = offset(self.pos) as usize;
            dst[..take].copy_from_slice(&self.buf[at..at + take]);
            self.pos += take as u32;
            dst = &mut dst[take..];
        }
        Ok(true)
    }

    /// Move the read position, discarding the buffer when it no longer
    /// covers the new position.
    pub fn seek(&mut self, pos: u32) {
        if pos < lower_bound(self.pos) || self.buf_end <= pos {
            self.buf_end = 0;
        }
        self.pos = pos;
    }

    /// Current read position.
    pub fn tell(&self) -> u32 {
        self.pos
    }
}

/// A buffered writer with an explicit seek position.
///
/// Data is held back until the buffer reaches an aligned boundary or
/// [ImageWriter::flush] is called, so a crash loses at most the
/// unflushed tail.
pub struct ImageWriter {
    file: File,
    buf: Box<[u8; BUF_SIZE]>,
    buf_start: u32,
    pos: u32,
}

impl ImageWriter {
    /// Wrap a (duplicated) handle to the image file.
    pub fn new(file: File) -> Self {
        Self {
            file,
            buf: Box::new([0; BUF_SIZE]),
            buf_start: 0,
            pos: 0,
        }
    }

    /// Append `data` at the current position.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut data = data;
        while !data.is_empty() {
            let take = ((upper_bound(self.buf_start) - self.pos) as usize)
                .min(data.len());
            let at = (self.pos - self.buf_start) as usize;
            self.buf[at..at + take].copy_from_slice(&data[..take]);
            self.pos += take as u32;
            data = &data[take..];
            if offset(self.pos) == 0 {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Write any buffered bytes through to the file.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pos <= self.buf_start {
            return Ok(());
        }
        let len = (self.pos - self.buf_start) as usize;
        self.file.write_all_at(&self.buf[..len], self.buf_start as u64)?;
        self.buf_start = self.pos;
        Ok(())
    }

    /// Flush, then move the write position.
    pub fn seek(&mut self, pos: u32) -> io::Result<()> {
        self.flush()?;
        self.pos = pos;
        self.buf_start = pos;
        Ok(())
    }

    /// Current write position.
    pub fn tell(&self) -> u32 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_file() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("img"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn test_write_flush_read_round_trip() {
        let (_dir, file) = tmp_file();

        let mut w = ImageWriter::new(file.try_clone().unwrap());
        w.seek(100).unwrap();
        w.write(b"hello").unwrap();
        w.write(b" world").unwrap();
        w.flush().unwrap();
        assert_eq!(w.tell(), 111);

        let mut r = ImageReader::new(file);
        r.seek(100);
        let mut buf = [0u8; 11];
        assert!(r.try_read(&mut buf).unwrap());
        assert_eq!(&buf, b"hello world");
        assert_eq!(r.tell(), 111);
    }

    #[test]
    fn test_large_write_crosses_buffer_boundary() {
        let (_dir, file) = tmp_file();

        let data: Vec<u8> = (0..3 * BUF_SIZE).map(|i| (i % 251) as u8).collect();
        let mut w = ImageWriter::new(file.try_clone().unwrap());
        w.seek(BUF_SIZE as u32 - 7).unwrap();
        w.write(&data).unwrap();
        w.flush().unwrap();

        let mut r = ImageReader::new(file);
        r.seek(BUF_SIZE as u32 - 7);
        let mut buf = vec![0u8; data.len()];
        assert!(r.try_read(&mut buf).unwrap());
        assert_eq!(buf, data);
    }

    #[test]
    fn test_read_past_eof_returns_false() {
        let (_dir, file) = tmp_file();
        file.set_len(10).unwrap();

        let mut r = ImageReader::new(file);
        let mut buf = [0u8; 16];
        assert!(!r.try_read(&mut buf).unwrap());
    }

    #[test]
    fn test_seek_within_buffer_keeps_window() {
        let (_dir, file) = tmp_file();

        let mut w = ImageWriter::new(file.try_clone().unwrap());
        w.write(b"0123456789").unwrap();
        w.flush().unwrap();

        let mut r = ImageReader::new(file);
        let mut buf = [0u8; 4];
        assert!(r.try_read(&mut buf).unwrap());
        assert_eq!(&buf, b"0123");

        r.seek(6);
        assert!(r.try_read(&mut buf).unwrap());
        assert_eq!(&buf, b"6789");
    }
}
