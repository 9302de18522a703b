use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};

use crate::error::KeystoreError;

pub const MASTER_KEY_LEN: usize = 32;

/// Symmetric envelope wrapping key material at rest, keyed by the 32-byte master key
/// from `ACRA_MASTER_KEY`. On-disk layout is `nonce || ciphertext` where `ciphertext`
/// already carries its Poly1305 tag, matching the `{nonce, ciphertext, tag}` shape in
/// the data model.
pub struct MasterKey {
    cipher: ChaCha20Poly1305,
}

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeystoreError> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(KeystoreError::Corrupt);
        }
        let key = Key::from_slice(bytes);
        Ok(MasterKey {
            cipher: ChaCha20Poly1305::new(key),
        })
    }

    /// Decodes `ACRA_MASTER_KEY` from its base64 environment representation. Any failure
    /// here (missing env var, bad base64, wrong length) is fatal at startup per §4.1/§7.
    pub fn from_env(var_name: &str) -> Result<Self, KeystoreError> {
        let encoded = std::env::var(var_name).map_err(|_| KeystoreError::NotFound)?;
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|_| KeystoreError::Corrupt)?;
        Self::from_bytes(&decoded)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("chacha20poly1305 encryption is infallible for in-memory buffers");
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        const NONCE_LEN: usize = 12;
        if envelope.len() < NONCE_LEN {
            return Err(KeystoreError::Corrupt);
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| KeystoreError::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::from_bytes(&[7u8; MASTER_KEY_LEN]).unwrap()
    }

    #[test]
    fn seal_then_open_round_trips() {
        let key = test_key();
        let plaintext = b"client-storage-private-key-bytes";
        let sealed = key.seal(plaintext);
        let opened = key.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_length_master_key_is_rejected() {
        assert!(MasterKey::from_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn tampered_envelope_fails_closed() {
        let key = test_key();
        let mut sealed = key.seal(b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(key.open(&sealed), Err(KeystoreError::Corrupt)));
    }
}
