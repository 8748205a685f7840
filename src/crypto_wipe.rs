//! Cryptographic erasure: encrypt a file in place under a throwaway key, then destroy the key.
//!
//! Each chunk is sealed with AES-256-GCM using a detached tag, so the
//! ciphertext written back is exactly as long as the plaintext it replaces.
//! Tags, key and nonce live only in process memory and are zeroized before
//! the executor returns, on success and on every error path.

use std::collections::BTreeSet;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WipeError;
use crate::overwrite::{chunks, ensure_extent, no_follow, open_for_pass, sample_offsets, VerifyMode};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Key and base nonce for a single wipe. Never persisted, never logged.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
}

impl EphemeralKey {
    pub fn generate() -> std::io::Result<Self> {
        let mut key = Self {
            key: [0u8; KEY_LEN],
            nonce: [0u8; NONCE_LEN],
        };
        OsRng
            .try_fill_bytes(&mut key.key)
            .and_then(|_| OsRng.try_fill_bytes(&mut key.nonce))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(key)
    }

    /// Overwrite the key material in memory.
    pub fn destroy(&mut self) {
        self.zeroize();
    }

    pub fn is_destroyed(&self) -> bool {
        self.key.iter().chain(self.nonce.iter()).all(|b| *b == 0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Per-chunk nonce: the base nonce with the chunk index folded into its tail.
    fn chunk_nonce(&self, index: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.nonce;
        for (byte, counter) in nonce[NONCE_LEN - 8..].iter_mut().zip(index.to_be_bytes()) {
            *byte ^= counter;
        }
        nonce
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Evidence that the ciphertext was written and authenticated before the key was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoWipeReceipt {
    pub bytes_encrypted: u64,
    pub chunks: u64,
    pub chunks_authenticated: u64,
}

#[derive(Debug, Clone)]
pub struct CryptoWipeExecutor {
    chunk_size: usize,
    verify_mode: VerifyMode,
}

impl CryptoWipeExecutor {
    pub fn new(chunk_size: usize, verify_mode: VerifyMode) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            verify_mode,
        }
    }

    /// Encrypt `[0, extent)` in place under a fresh key and discard the key.
    pub async fn run(&self, path: &Path, extent: u64) -> Result<CryptoWipeReceipt, WipeError> {
        let mut key = EphemeralKey::generate().map_err(|e| WipeError::io("generate key", path, e))?;
        self.run_with_key(path, extent, &mut key).await
    }

    pub(crate) async fn run_with_key(
        &self,
        path: &Path,
        extent: u64,
        key: &mut EphemeralKey,
    ) -> Result<CryptoWipeReceipt, WipeError> {
        let mut tags: Vec<[u8; TAG_LEN]> = Vec::new();
        let result = self.encrypt_and_authenticate(path, extent, key, &mut tags).await;
        tags.zeroize();
        key.destroy();
        result
    }

    async fn encrypt_and_authenticate(
        &self,
        path: &Path,
        extent: u64,
        key: &EphemeralKey,
        tags: &mut Vec<[u8; TAG_LEN]>,
    ) -> Result<CryptoWipeReceipt, WipeError> {
        let cipher = key.cipher();
        let mut file = open_for_pass(path, extent, true).await?;
        let mut receipt = CryptoWipeReceipt {
            bytes_encrypted: 0,
            chunks: 0,
            chunks_authenticated: 0,
        };

        for (index, (offset, len)) in chunks(extent, self.chunk_size).enumerate() {
            let mut buffer = vec![0u8; len];
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| WipeError::io("seek", path, e))?;
            file.read_exact(&mut buffer)
                .await
                .map_err(|e| WipeError::io("read", path, e))?;

            let nonce = key.chunk_nonce(index as u64);
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), &offset.to_be_bytes(), &mut buffer)
                .map_err(|_| {
                    WipeError::io(
                        "encrypt",
                        path,
                        std::io::Error::new(std::io::ErrorKind::Other, "chunk encryption failed"),
                    )
                })?;
            let mut tag_bytes = [0u8; TAG_LEN];
            tag_bytes.copy_from_slice(tag.as_slice());
            tags.push(tag_bytes);

            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| WipeError::io("seek", path, e))?;
            file.write_all(&buffer)
                .await
                .map_err(|e| WipeError::io("write", path, e))?;

            receipt.bytes_encrypted += len as u64;
            receipt.chunks += 1;
        }

        file.flush()
            .await
            .map_err(|e| WipeError::io("flush", path, e))?;
        file.sync_all()
            .await
            .map_err(|e| WipeError::io("sync", path, e))?;
        drop(file);

        receipt.chunks_authenticated = self.authenticate(path, extent, key, &cipher, tags).await?;
        debug!(
            path = %path.display(),
            chunks = receipt.chunks,
            authenticated = receipt.chunks_authenticated,
            "crypto wipe synced"
        );
        Ok(receipt)
    }

    /// Read sampled chunks back and check their tags: proof the ciphertext,
    /// not the old plaintext, is what the file now holds.
    async fn authenticate(
        &self,
        path: &Path,
        extent: u64,
        key: &EphemeralKey,
        cipher: &Aes256Gcm,
        tags: &[[u8; TAG_LEN]],
    ) -> Result<u64, WipeError> {
        let mut file = no_follow()
            .read(true)
            .open(path)
            .await
            .map_err(|e| WipeError::io("open for verification", path, e))?;
        ensure_extent(&file, path, extent).await?;

        let step = self.chunk_size as u64;
        let sampled: BTreeSet<u64> = sample_offsets(extent, self.chunk_size, self.verify_mode);
        let mut authenticated = 0;

        for offset in sampled {
            let index = offset / step;
            let len = (extent - offset).min(step) as usize;
            let mut buffer = vec![0u8; len];
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| WipeError::io("seek", path, e))?;
            file.read_exact(&mut buffer)
                .await
                .map_err(|e| WipeError::io("read back", path, e))?;

            let nonce = key.chunk_nonce(index);
            let tag = tags
                .get(index as usize)
                .ok_or(WipeError::VerificationFailed { offset })?;
            let verified = cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    &offset.to_be_bytes(),
                    &mut buffer,
                    GenericArray::from_slice(tag),
                )
                .is_ok();
            buffer.zeroize();

            if !verified {
                error!(path = %path.display(), offset, "ciphertext failed authentication");
                return Err(WipeError::VerificationFailed { offset });
            }
            authenticated += 1;
        }
        Ok(authenticated)
    }
}
