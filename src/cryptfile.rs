//! A read/write view over an on-disk ciphertext file that encrypts on
//! write and decrypts on read.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::crypto::{CryptoError, Key, XexCipher, CIPHER_BLOCK_SIZE};

#[derive(Debug, thiserror::Error)]
/// An error raised by a [CryptFile] operation.
pub enum CryptFileError {
    #[error(transparent)]
    /// The underlying read or write failed.
    Io(#[from] io::Error),
    #[error(transparent)]
    /// The cipher rejected the request.
    Crypto(#[from] CryptoError),
}

/// An encrypted file opened for positioned reads and writes.
///
/// All I/O must be aligned to [CIPHER_BLOCK_SIZE]. The underlying file
/// length is kept a multiple of the block size by construction, since
/// every write is block-aligned.
pub struct CryptFile {
    file: File,
    cipher: XexCipher,
    /// Total bytes decrypted by reads, maintained for tests and stats.
    pub pread_bytes: u64,
    /// Total bytes encrypted by writes.
    pub pwrite_bytes: u64,
}

impl CryptFile {
    /// Open `path` (creating it if absent) with the given encryption key.
    pub fn open(key: Key, path: impl AsRef<Path>) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let cipher = XexCipher::new(&key);

        Ok(Self {
            file,
            cipher,
            pread_bytes: 0,
            pwrite_bytes: 0,
        })
    }

    /// Current length of the underlying ciphertext file in bytes.
    pub fn file_size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read and decrypt up to `dst.len()` bytes at position `offset`.
    ///
    /// Both the buffer length and the offset must be multiples of
    /// [CIPHER_BLOCK_SIZE]. Returns the number of bytes decrypted,
    /// which is zero at or past end of file and may be short near it.
    pub fn aligned_pread(
        &mut self,
        dst: &mut [u8],
        offset: u64,
    ) -> Result<usize, CryptFileError> {
        let mut total = 0;
        while total < dst.len() {
            let n = self.file.read_at(&mut dst[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }

        // A file that honors the block alignment invariant can only
        // yield a short read at EOF, so the truncation below is a
        // no-op in practice.
        let aligned = total - total % CIPHER_BLOCK_SIZE;
        self.cipher.decrypt(&mut dst[..aligned], offset)?;
        self.pread_bytes += aligned as u64;
        Ok(aligned)
    }

    /// Encrypt and write `src` at position `offset`.
    ///
    /// Both the buffer length and the offset must be multiples of
    /// [CIPHER_BLOCK_SIZE]. Returns the number of bytes written.
    pub fn aligned_pwrite(
        &mut self,
        src: &[u8],
        offset: u64,
    ) -> Result<usize, CryptFileError> {
        let mut buf = src.to_vec();
        self.cipher.encrypt(&mut buf, offset)?;
        self.file.write_all_at(&buf, offset)?;
        self.pwrite_bytes += buf.len() as u64;
        Ok(buf.len())
    }
}

impl std::fmt::Debug for CryptFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CryptFile(pread={}, pwrite={})",
            self.pread_bytes, self.pwrite_bytes
        )
    }
}
