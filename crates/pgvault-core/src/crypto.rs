use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::config::Settings;
use crate::error::{PgVaultError, Result};

/// Optional symmetric encryption stage applied after compression on upload
/// and before decompression on download.
pub trait Crypter: Send + Sync {
    /// Whether encryption is configured at all. When false, `encrypt` and
    /// `decrypt` pass data through unchanged.
    fn is_used(&self) -> bool;

    fn encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>>;

    fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// No-op crypter used when no key is configured.
pub struct NoCrypter;

impl Crypter for NoCrypter {
    fn is_used(&self) -> bool {
        false
    }

    fn encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        Ok(plaintext)
    }

    fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}

/// AES-256-GCM authenticated encryption.
///
/// Wire format: `[12-byte nonce][ciphertext with appended 16-byte tag]`.
pub struct Aes256GcmCrypter {
    cipher: Aes256Gcm,
}

impl Aes256GcmCrypter {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("valid 32-byte key for AES-256-GCM");
        Self { cipher }
    }
}

impl Crypter for Aes256GcmCrypter {
    fn is_used(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| PgVaultError::Other(format!("AES-GCM encrypt: {e}")))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(PgVaultError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| PgVaultError::DecryptionFailed)
    }
}

/// Build the configured crypter.
pub fn crypter_from_settings(settings: &Settings) -> Arc<dyn Crypter> {
    match &settings.encryption_key {
        Some(key) => Arc::new(Aes256GcmCrypter::new(key)),
        None => Arc::new(NoCrypter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_round_trip() {
        let crypter = Aes256GcmCrypter::new(&[0x42; 32]);
        let plaintext = b"sixteen megabytes of WAL, honest".to_vec();
        let sealed = crypter.encrypt(plaintext.clone()).unwrap();
        assert_ne!(sealed, plaintext);
        assert_eq!(crypter.decrypt(sealed).unwrap(), plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let crypter = Aes256GcmCrypter::new(&[0x42; 32]);
        let mut sealed = crypter.encrypt(b"payload".to_vec()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            crypter.decrypt(sealed),
            Err(PgVaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let a = Aes256GcmCrypter::new(&[0x01; 32]);
        let b = Aes256GcmCrypter::new(&[0x02; 32]);
        let sealed = a.encrypt(b"payload".to_vec()).unwrap();
        assert!(b.decrypt(sealed).is_err());
    }

    #[test]
    fn no_crypter_passes_through() {
        let crypter = NoCrypter;
        assert!(!crypter.is_used());
        assert_eq!(crypter.encrypt(b"x".to_vec()).unwrap(), b"x");
        assert_eq!(crypter.decrypt(b"x".to_vec()).unwrap(), b"x");
    }
}
