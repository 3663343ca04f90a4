//! XEX-mode encryption over the AES-128 block cipher.
//!
//! The 16-byte block at absolute byte offset `o` is encrypted as:
//!
//! ```text
//!   X   := AES_Enc(K2, bigendian16(o / 16))
//!   out := AES_Enc(K1, in XOR X) XOR X
//! ```
//!
//! where K1 is the first 16 bytes of the key and K2 the second 16.
//! Tweaking by block number ensures repeated plaintext blocks at
//! different offsets do not produce repeated ciphertext blocks.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Block = aes::cipher::Block<Aes128>;

/// Size of a block in the underlying AES block cipher.
pub const CIPHER_BLOCK_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
/// An error raised by the cipher layer.
///
/// Both variants indicate API misuse by the caller rather than a
/// recoverable runtime condition.
pub enum CryptoError {
    #[error("length {0} is not a multiple of the cipher block size")]
    /// The length of the data was not a multiple of [CIPHER_BLOCK_SIZE].
    UnalignedLength(usize),
    #[error("offset {0} is not a multiple of the cipher block size")]
    /// The file offset was not a multiple of [CIPHER_BLOCK_SIZE].
    UnalignedOffset(u64),
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
/// A 32-byte encryption key holding the two AES-128 subkeys used by
/// XEX mode.
///
/// Keys are derived from an arbitrary byte string by hashing it, so
/// all 32 bytes depend equally on every input byte regardless of the
/// input length. The key material is wiped from memory on drop.
pub struct Key([u8; 32]);

impl Key {
    /// Derive a key from an arbitrary byte string via SHA-256.
    pub fn from_passphrase(passphrase: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(passphrase.as_ref());
        Self(digest.into())
    }

    /// Use 32 raw bytes directly as the key.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn k1(&self) -> &[u8] {
        &self.0[..16]
    }

    fn k2(&self) -> &[u8] {
        &self.0[16..]
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key")
    }
}

/// Encrypts and decrypts runs of 16-byte blocks in XEX mode, tweaked
/// by the block's absolute offset within the file.
pub struct XexCipher {
    data: Aes128,
    tweak: Aes128,
}

impl XexCipher {
    /// Build a cipher from a [Key].
    pub fn new(key: &Key) -> Self {
        let data = Aes128::new(GenericArray::from_slice(key.k1()));
        let tweak = Aes128::new(GenericArray::from_slice(key.k2()));
        Self { data, tweak }
    }

    /// Encrypt `data` in place. Both `data.len()` and `offset` must be
    /// multiples of [CIPHER_BLOCK_SIZE]; `offset` is used only to tweak
    /// the encryption.
    pub fn encrypt(&self, data: &mut [u8], offset: u64) -> Result<(), CryptoError> {
        self.check_alignment(data, offset)?;
        let first_block = offset / CIPHER_BLOCK_SIZE as u64;
        for (i, chunk) in data.chunks_exact_mut(CIPHER_BLOCK_SIZE).enumerate() {
            let x = self.tweak_block(first_block + i as u64);
            xor_into(chunk, &x);
            self.data.encrypt_block(Block::from_mut_slice(chunk));
            xor_into(chunk, &x);
        }
        Ok(())
    }

    /// Decrypt `data` in place. Alignment requirements match
    /// [XexCipher::encrypt].
    pub fn decrypt(&self, data: &mut [u8], offset: u64) -> Result<(), CryptoError> {
        self.check_alignment(data, offset)?;
        let first_block = offset / CIPHER_BLOCK_SIZE as u64;
        for (i, chunk) in data.chunks_exact_mut(CIPHER_BLOCK_SIZE).enumerate() {
            let x = self.tweak_block(first_block + i as u64);
            xor_into(chunk, &x);
            self.data.decrypt_block(Block::from_mut_slice(chunk));
            xor_into(chunk, &x);
        }
        Ok(())
    }

    fn tweak_block(&self, blockno: u64) -> Block {
        let mut block = Block::from((blockno as u128).to_be_bytes());
        self.tweak.encrypt_block(&mut block);
        block
    }

    fn check_alignment(&self, data: &[u8], offset: u64) -> Result<(), CryptoError> {
        if data.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedLength(data.len()));
        }
        if offset % CIPHER_BLOCK_SIZE as u64 != 0 {
            return Err(CryptoError::UnalignedOffset(offset));
        }
        Ok(())
    }
}

#[inline]
fn xor_into(dst: &mut [u8], mask: &Block) {
    for (d, m) in dst.iter_mut().zip(mask.iter()) {
        *d ^= m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_passphrase_is_deterministic() {
        let a = Key::from_passphrase("12345");
        let b = Key::from_passphrase("12345");
        assert_eq!(a.0, b.0);

        let c = Key::from_passphrase("12346");
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = XexCipher::new(&Key::from_passphrase("round trip"));

        let plaintext: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();
        for offset in [0u64, 16, 4096, 1 << 20] {
            let mut buf = plaintext.clone();
            cipher.encrypt(&mut buf, offset).unwrap();
            assert_ne!(buf, plaintext);
            cipher.decrypt(&mut buf, offset).unwrap();
            assert_eq!(buf, plaintext);
        }
    }

    #[test]
    fn test_repeated_plaintext_blocks_differ() {
        let cipher = XexCipher::new(&Key::from_passphrase("tweaks"));

        let mut buf = [0xabu8; 32];
        cipher.encrypt(&mut buf, 0).unwrap();
        assert_ne!(buf[..16], buf[16..], "identical blocks must not repeat");
    }

    #[test]
    fn test_offset_changes_ciphertext() {
        let cipher = XexCipher::new(&Key::from_passphrase("offsets"));

        let mut a = [0x5au8; 16];
        let mut b = [0x5au8; 16];
        cipher.encrypt(&mut a, 0).unwrap();
        cipher.encrypt(&mut b, 16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unaligned_arguments_are_rejected() {
        let cipher = XexCipher::new(&Key::from_passphrase("align"));

        let mut short = [0u8; 15];
        assert!(matches!(
            cipher.encrypt(&mut short, 0),
            Err(CryptoError::UnalignedLength(15))
        ));

        let mut ok = [0u8; 16];
        assert!(matches!(
            cipher.decrypt(&mut ok, 7),
            Err(CryptoError::UnalignedOffset(7))
        ));
    }
}
