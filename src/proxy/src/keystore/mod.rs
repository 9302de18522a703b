pub mod cache;
pub mod envelope;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

use crate::error::KeystoreError;
use cache::{CacheMode, KeyCache};
use envelope::MasterKey;

/// One of the key kinds the data model names for `KeyRecord`. The core does not attach
/// semantics to the kind beyond the filename it produces — callers (transport wrappers,
/// the decryptor) interpret the bytes they get back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    ClientStoragePrivate,
    ClientStoragePublic,
    ZonePrivate,
    ZonePublic,
    ConnectorTransport,
    ServerTransport,
    PoisonPrivate,
    AuthEntry,
}

impl KeyKind {
    fn file_suffix(self) -> &'static str {
        match self {
            KeyKind::ClientStoragePrivate => "",
            KeyKind::ClientStoragePublic => "_storage.pub",
            KeyKind::ZonePrivate => "_zone",
            KeyKind::ZonePublic => "_zone.pub",
            KeyKind::ConnectorTransport => "_connector",
            KeyKind::ServerTransport => "_server",
            KeyKind::PoisonPrivate => "_poison",
            KeyKind::AuthEntry => "_auth",
        }
    }
}

fn key_path(dir: &Path, kind: KeyKind, id: &str) -> PathBuf {
    dir.join(format!("{id}{}", kind.file_suffix()))
}

fn cache_key(kind: KeyKind, id: &str) -> String {
    format!("{kind:?}:{id}")
}

/// Filesystem-backed keystore: reads/writes envelope-wrapped key files under `dir`,
/// caching decrypted bytes in a bounded LRU guarded by a single mutex (§5: "serializes
/// cache mutations with a single mutex").
pub struct Keystore {
    dir: PathBuf,
    master_key: MasterKey,
    cache: Mutex<KeyCache>,
}

impl Keystore {
    pub fn open(dir: impl Into<PathBuf>, master_key: MasterKey, cache_size: i64) -> Self {
        Keystore {
            dir: dir.into(),
            master_key,
            cache: Mutex::new(KeyCache::new(CacheMode::from_config(cache_size))),
        }
    }

    pub fn get_private_key(&self, kind: KeyKind, id: &str) -> Result<Vec<u8>, KeystoreError> {
        self.get_key(kind, id)
    }

    pub fn get_public_key(&self, kind: KeyKind, id: &str) -> Result<Vec<u8>, KeystoreError> {
        self.get_key(kind, id)
    }

    fn get_key(&self, kind: KeyKind, id: &str) -> Result<Vec<u8>, KeystoreError> {
        let ck = cache_key(kind, id);
        if let Some(bytes) = self.cache.lock().unwrap().get(&ck) {
            return Ok(bytes);
        }

        let path = key_path(&self.dir, kind, id);
        let raw = std::fs::read(&path).map_err(KeystoreError::from)?;
        let plaintext = self.master_key.open(&raw)?;

        self.cache.lock().unwrap().insert(ck, plaintext.clone());
        Ok(plaintext)
    }

    /// Generates a fresh keypair's private half and stores it, encrypted, under `id`.
    /// Writes to a temporary name in the same directory then renames into place, so a
    /// crash mid-write never leaves a partially-written key file visible under its real
    /// name. Refuses to clobber an existing key unless `overwrite` is set.
    pub fn generate_key_pair(
        &self,
        kind: KeyKind,
        id: &str,
        overwrite: bool,
    ) -> Result<(), KeystoreError> {
        let path = key_path(&self.dir, kind, id);
        if path.exists() && !overwrite {
            return Err(KeystoreError::Io(format!(
                "{} already exists and overwrite was not requested",
                path.display()
            )));
        }

        let mut key_bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let sealed = self.master_key.seal(&key_bytes);

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &sealed).map_err(KeystoreError::from)?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            warn!("keystore rename {tmp_path:?} -> {path:?} failed: {e}");
            KeystoreError::from(e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_key() -> MasterKey {
        MasterKey::from_bytes(&[3u8; envelope::MASTER_KEY_LEN]).unwrap()
    }

    #[test]
    fn generate_then_read_round_trips_through_disk() {
        let dir = tempdir();
        let ks = Keystore::open(dir.path(), master_key(), 0);
        ks.generate_key_pair(KeyKind::ClientStoragePrivate, "client-1", false)
            .unwrap();
        let key = ks
            .get_private_key(KeyKind::ClientStoragePrivate, "client-1")
            .unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempdir();
        let ks = Keystore::open(dir.path(), master_key(), 0);
        let err = ks
            .get_private_key(KeyKind::ClientStoragePrivate, "nope")
            .unwrap_err();
        assert_eq!(err, KeystoreError::NotFound);
    }

    #[test]
    fn refuses_to_overwrite_without_flag() {
        let dir = tempdir();
        let ks = Keystore::open(dir.path(), master_key(), 0);
        ks.generate_key_pair(KeyKind::ClientStoragePrivate, "client-1", false)
            .unwrap();
        assert!(ks
            .generate_key_pair(KeyKind::ClientStoragePrivate, "client-1", false)
            .is_err());
        assert!(ks
            .generate_key_pair(KeyKind::ClientStoragePrivate, "client-1", true)
            .is_ok());
    }

    #[test]
    fn disabled_cache_still_serves_from_disk_every_time() {
        let dir = tempdir();
        let ks = Keystore::open(dir.path(), master_key(), -1);
        ks.generate_key_pair(KeyKind::ZonePrivate, "zone-1", false)
            .unwrap();
        for _ in 0..3 {
            assert!(ks.get_private_key(KeyKind::ZonePrivate, "zone-1").is_ok());
        }
    }

    // Minimal temp-dir helper so tests don't depend on a dev-dependency for this crate.
    struct TempDir(PathBuf);
    impl TempDir {
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn tempdir() -> TempDir {
        let mut p = std::env::temp_dir();
        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        p.push(format!("proxy-keystore-test-{}", hex::encode(suffix)));
        std::fs::create_dir_all(&p).unwrap();
        TempDir(p)
    }
}
