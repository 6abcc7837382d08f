//! Per-part AES-256-CBC with an inline IV
//!
//! Each part is encrypted independently: a fresh random IV is written as the
//! first block of the output, followed by the PKCS#7 padded ciphertext. A part
//! of `n` plaintext bytes therefore always encrypts to
//! `BLOCK_SIZE * (n / BLOCK_SIZE + 2)` bytes, which is what lets every part be
//! located in the remote object without reading its predecessors.

use crate::keys::ContentKey;
use crate::{CryptoError, Result};
use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

type CbcEncryptor = cbc::Encryptor<Aes256>;
type CbcDecryptor = cbc::Decryptor<Aes256>;

/// Encrypted length of a part with `plaintext_len` bytes, IV included
pub fn ciphertext_len(plaintext_len: u64) -> u64 {
    let bs = BLOCK_SIZE as u64;
    bs * (plaintext_len / bs + 2)
}

/// Streaming encryptor for one part
pub struct PartEncryptor {
    cipher: CbcEncryptor,
    iv: Option<[u8; BLOCK_SIZE]>,
    pending: Vec<u8>,
}

impl PartEncryptor {
    /// Start a part with a fresh random IV
    pub fn new(key: &ContentKey) -> Result<Self> {
        let mut iv = [0u8; BLOCK_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut iv);
        Self::with_iv(key, iv)
    }

    fn with_iv(key: &ContentKey, iv: [u8; BLOCK_SIZE]) -> Result<Self> {
        let cipher = CbcEncryptor::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        Ok(Self {
            cipher,
            iv: Some(iv),
            pending: Vec::with_capacity(BLOCK_SIZE),
        })
    }

    /// Feed plaintext, returning whatever ciphertext is ready
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() + 2 * BLOCK_SIZE);
        if let Some(iv) = self.iv.take() {
            out.extend_from_slice(&iv);
        }
        self.pending.extend_from_slice(input);
        let ready = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        let mut blocks: Vec<u8> = self.pending.drain(..ready).collect();
        self.encrypt_blocks(&mut blocks);
        out.extend_from_slice(&blocks);
        out
    }

    /// Pad and flush the final block
    pub fn finalize(mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * BLOCK_SIZE);
        if let Some(iv) = self.iv.take() {
            out.extend_from_slice(&iv);
        }
        let pad = BLOCK_SIZE - self.pending.len() % BLOCK_SIZE;
        let mut last = std::mem::take(&mut self.pending);
        last.resize(last.len() + pad, pad as u8);
        self.encrypt_blocks(&mut last);
        out.extend_from_slice(&last);
        out
    }

    fn encrypt_blocks(&mut self, buf: &mut [u8]) {
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Streaming decryptor for one part.
///
/// The first block of input is taken as the IV. The last full block is held
/// back until `finalize` so the padding can be checked and stripped.
pub struct PartDecryptor {
    key: ContentKey,
    cipher: Option<CbcDecryptor>,
    iv: Vec<u8>,
    pending: Vec<u8>,
}

impl PartDecryptor {
    /// Prepare to decrypt a part encrypted with `key`
    pub fn new(key: &ContentKey) -> Self {
        Self {
            key: key.clone(),
            cipher: None,
            iv: Vec::with_capacity(BLOCK_SIZE),
            pending: Vec::new(),
        }
    }

    /// Feed ciphertext, returning whatever plaintext is ready
    pub fn update(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        if self.cipher.is_none() {
            let need = BLOCK_SIZE - self.iv.len();
            let take = need.min(input.len());
            self.iv.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.iv.len() < BLOCK_SIZE {
                return Ok(Vec::new());
            }
            let cipher = CbcDecryptor::new_from_slices(self.key.as_bytes(), &self.iv)
                .map_err(|e| CryptoError::Decryption(e.to_string()))?;
            self.cipher = Some(cipher);
        }

        self.pending.extend_from_slice(input);
        let tail = match self.pending.len() % BLOCK_SIZE {
            0 => BLOCK_SIZE,
            rem => rem,
        };
        let ready = self.pending.len().saturating_sub(tail);
        let mut blocks: Vec<u8> = self.pending.drain(..ready).collect();
        self.decrypt_blocks(&mut blocks);
        Ok(blocks)
    }

    /// Decrypt the held-back block and strip padding
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        if self.cipher.is_none() {
            return Err(CryptoError::CorruptStream(format!(
                "truncated IV: got {} of {} bytes",
                self.iv.len(),
                BLOCK_SIZE
            )));
        }
        if self.pending.len() != BLOCK_SIZE {
            return Err(CryptoError::CorruptStream(format!(
                "ciphertext ends with {} bytes, expected one full block",
                self.pending.len()
            )));
        }
        let mut last = std::mem::take(&mut self.pending);
        self.decrypt_blocks(&mut last);

        let pad = last[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE || last[BLOCK_SIZE - pad..].iter().any(|&b| b as usize != pad)
        {
            return Err(CryptoError::CorruptStream("invalid padding".to_string()));
        }
        last.truncate(BLOCK_SIZE - pad);
        Ok(last)
    }

    fn decrypt_blocks(&mut self, buf: &mut [u8]) {
        if let Some(cipher) = self.cipher.as_mut() {
            for block in buf.chunks_exact_mut(BLOCK_SIZE) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
    }
}

/// Encrypt a whole part in one call
pub fn encrypt_part(key: &ContentKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut encryptor = PartEncryptor::new(key)?;
    let mut out = encryptor.update(plaintext);
    out.extend_from_slice(&encryptor.finalize());
    Ok(out)
}

/// Decrypt a whole part in one call
pub fn decrypt_part(key: &ContentKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut decryptor = PartDecryptor::new(key);
    let mut out = decryptor.update(ciphertext)?;
    out.extend_from_slice(&decryptor.finalize()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ciphertext_len_formula() {
        assert_eq!(ciphertext_len(0), 32);
        assert_eq!(ciphertext_len(15), 32);
        assert_eq!(ciphertext_len(16), 48);
        assert_eq!(ciphertext_len(5 * 1024 * 1024), 5 * 1024 * 1024 + 32);
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        let key = ContentKey::generate();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000, 4096] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ciphertext = encrypt_part(&key, &plaintext).unwrap();
            assert_eq!(ciphertext.len() as u64, ciphertext_len(len as u64));
            assert_eq!(decrypt_part(&key, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_part() {
        let key = ContentKey::generate();
        let a = encrypt_part(&key, b"same plaintext").unwrap();
        let b = encrypt_part(&key, b"same plaintext").unwrap();
        assert_ne!(a[..BLOCK_SIZE], b[..BLOCK_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let key = ContentKey::generate();
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();

        let mut encryptor = PartEncryptor::with_iv(&key, [9u8; BLOCK_SIZE]).unwrap();
        let mut streamed = Vec::new();
        for piece in plaintext.chunks(37) {
            streamed.extend(encryptor.update(piece));
        }
        streamed.extend(encryptor.finalize());

        let mut decryptor = PartDecryptor::new(&key);
        let mut recovered = Vec::new();
        for piece in streamed.chunks(5) {
            recovered.extend(decryptor.update(piece).unwrap());
        }
        recovered.extend(decryptor.finalize().unwrap());
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_truncated_iv_is_corrupt_stream() {
        let key = ContentKey::generate();
        let mut decryptor = PartDecryptor::new(&key);
        decryptor.update(&[1, 2, 3]).unwrap();
        assert!(matches!(
            decryptor.finalize(),
            Err(CryptoError::CorruptStream(msg)) if msg.contains("IV")
        ));
    }

    #[test]
    fn test_truncated_body_is_corrupt_stream() {
        let key = ContentKey::generate();
        let ciphertext = encrypt_part(&key, &[0u8; 100]).unwrap();
        let result = decrypt_part(&key, &ciphertext[..ciphertext.len() - 5]);
        assert!(matches!(result, Err(CryptoError::CorruptStream(_))));
    }

    #[test]
    fn test_wrong_key_does_not_roundtrip() {
        let ciphertext = encrypt_part(&ContentKey::generate(), b"secret payload").unwrap();
        match decrypt_part(&ContentKey::generate(), &ciphertext) {
            Ok(plain) => assert_ne!(plain, b"secret payload"),
            Err(e) => assert!(matches!(e, CryptoError::CorruptStream(_))),
        }
    }

    proptest! {
        #[test]
        fn prop_any_split_decrypts(
            plaintext in proptest::collection::vec(any::<u8>(), 0..600),
            enc_step in 1usize..64,
            dec_step in 1usize..64,
        ) {
            let key = ContentKey::generate();
            let mut encryptor = PartEncryptor::new(&key).unwrap();
            let mut ciphertext = Vec::new();
            for piece in plaintext.chunks(enc_step) {
                ciphertext.extend(encryptor.update(piece));
            }
            ciphertext.extend(encryptor.finalize());
            prop_assert_eq!(ciphertext.len() as u64, ciphertext_len(plaintext.len() as u64));

            let mut decryptor = PartDecryptor::new(&key);
            let mut recovered = Vec::new();
            for piece in ciphertext.chunks(dec_step) {
                recovered.extend(decryptor.update(piece).unwrap());
            }
            recovered.extend(decryptor.finalize().unwrap());
            prop_assert_eq!(recovered, plaintext);
        }
    }
}
