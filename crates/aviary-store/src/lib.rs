use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io")]
    Io,
    #[error("codec")]
    Codec,
    #[error("crypto")]
    Crypto,
    #[error("invalid key")]
    Invalid,
}

pub trait KeyProvider: Send + Sync {
    fn master_key(&self) -> Result<[u8; 32], StoreError>;
}

#[derive(Serialize, Deserialize, Default)]
struct Sealed {
    entries: HashMap<String, String>,
}

/// Namespaced key/value file store. Every value is sealed with
/// XChaCha20-Poly1305 under the provider's master key, fresh nonce per
/// write; the whole map is rewritten on each mutation.
pub struct EncryptedStore {
    path: PathBuf,
    namespace: String,
    cipher: XChaCha20Poly1305,
    data: HashMap<String, Vec<u8>>,
}

impl EncryptedStore {
    pub fn open_or_create(
        path: impl AsRef<Path>,
        namespace: &str,
        key_provider: &dyn KeyProvider,
    ) -> Result<Self, StoreError> {
        let mut base = path.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|_| StoreError::Io)?;
        base.push(format!("{}-store.json", namespace));
        let key = key_provider.master_key()?;
        let cipher =
            XChaCha20Poly1305::new_from_slice(&key).map_err(|_| StoreError::Invalid)?;
        let mut data = HashMap::new();
        if base.exists() {
            let content = fs::read_to_string(&base).map_err(|_| StoreError::Io)?;
            let sealed: Sealed = serde_json::from_str(&content).map_err(|_| StoreError::Codec)?;
            for (entry_key, blob) in sealed.entries {
                data.insert(entry_key, open_value(&cipher, &blob)?);
            }
        }
        Ok(Self {
            path: base,
            namespace: namespace.to_string(),
            cipher,
            data,
        })
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.insert(key.to_string(), value);
        self.persist()
    }

    /// Deleting a missing key is not an error.
    pub fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        if self.data.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn wipe(&mut self) -> Result<(), StoreError> {
        self.data.clear();
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|_| StoreError::Io)?;
        }
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut sealed = Sealed::default();
        for (key, value) in self.data.iter() {
            sealed
                .entries
                .insert(key.clone(), seal_value(&self.cipher, value)?);
        }
        let serialized = serde_json::to_string(&sealed).map_err(|_| StoreError::Codec)?;
        fs::write(&self.path, serialized).map_err(|_| StoreError::Io)
    }
}

fn seal_value(cipher: &XChaCha20Poly1305, plaintext: &[u8]) -> Result<String, StoreError> {
    let mut nonce = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::Crypto)?;
    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
}

fn open_value(cipher: &XChaCha20Poly1305, blob: &str) -> Result<Vec<u8>, StoreError> {
    let bytes = STANDARD.decode(blob).map_err(|_| StoreError::Codec)?;
    if bytes.len() < 24 {
        return Err(StoreError::Codec);
    }
    cipher
        .decrypt(XNonce::from_slice(&bytes[..24]), &bytes[24..])
        .map_err(|_| StoreError::Crypto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct TestKey;

    impl KeyProvider for TestKey {
        fn master_key(&self) -> Result<[u8; 32], StoreError> {
            Ok([7u8; 32])
        }
    }

    struct OtherKey;

    impl KeyProvider for OtherKey {
        fn master_key(&self) -> Result<[u8; 32], StoreError> {
            Ok([8u8; 32])
        }
    }

    #[test]
    fn roundtrip_across_reopen() {
        let dir = tempdir().unwrap();
        let mut store = EncryptedStore::open_or_create(dir.path(), "test", &TestKey).unwrap();
        store.put("a", b"alpha".to_vec()).unwrap();
        store.put("prefix:x", b"x".to_vec()).unwrap();
        store.put("prefix:y", b"y".to_vec()).unwrap();
        drop(store);
        let store = EncryptedStore::open_or_create(dir.path(), "test", &TestKey).unwrap();
        assert_eq!(store.get("a"), Some(b"alpha".to_vec()));
        assert_eq!(
            store.keys_with_prefix("prefix:"),
            vec!["prefix:x".to_string(), "prefix:y".to_string()]
        );
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let dir = tempdir().unwrap();
        let mut store = EncryptedStore::open_or_create(dir.path(), "test", &TestKey).unwrap();
        store.put("a", b"alpha".to_vec()).unwrap();
        drop(store);
        assert!(EncryptedStore::open_or_create(dir.path(), "test", &OtherKey).is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = EncryptedStore::open_or_create(dir.path(), "test", &TestKey).unwrap();
        store.put("a", b"alpha".to_vec()).unwrap();
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert!(store.get("a").is_none());
    }
}
