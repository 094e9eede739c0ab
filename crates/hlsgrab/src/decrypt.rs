// Segment decryption: the injected cipher capability and an offloader that moves the
// CPU-bound work onto the blocking pool.

use std::sync::Arc;

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::{HlsError, Result};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

/// Decrypts one whole segment. Implementations keep no cross-segment state.
pub trait SegmentDecryptor: Send + Sync {
    fn decrypt(&self, data: Vec<u8>, key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>>;
}

/// AES-128-CBC with PKCS#7 unpadding.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes128CbcDecryptor;

impl SegmentDecryptor for Aes128CbcDecryptor {
    fn decrypt(&self, mut data: Vec<u8>, key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(HlsError::decryption(format!(
                "ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
                data.len()
            )));
        }

        let cipher = Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| HlsError::decryption(format!("failed to initialize AES decryptor: {e}")))?;

        let plain_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut data)
            .map_err(|e| HlsError::decryption(format!("bad padding: {e}")))?
            .len();

        data.truncate(plain_len);
        Ok(data)
    }
}

/// Runs a [`SegmentDecryptor`] either inline or on tokio's blocking thread pool.
#[derive(Clone)]
pub struct DecryptionOffloader {
    decryptor: Arc<dyn SegmentDecryptor>,
    enabled: bool,
}

impl DecryptionOffloader {
    pub fn new(decryptor: Arc<dyn SegmentDecryptor>, enabled: bool) -> Self {
        Self { decryptor, enabled }
    }

    pub async fn decrypt(&self, data: Vec<u8>, key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>> {
        if !self.enabled {
            return self.decryptor.decrypt(data, key, iv);
        }

        let decryptor = Arc::clone(&self.decryptor);
        let key = *key;
        let iv = *iv;
        tokio::task::spawn_blocking(move || decryptor.decrypt(data, &key, &iv))
            .await
            .map_err(|e| HlsError::decryption(format!("decryption task failed: {e}")))?
    }
}
