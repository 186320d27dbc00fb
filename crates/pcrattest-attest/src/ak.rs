// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attestation key lifecycle
//!
//! The AK is minted once per trust domain, persisted as an opaque key blob
//! and reloaded on every start. Only its public area ever leaves this module.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use pcrattest_verify::model::base64_bytes;
use pcrattest_verify::AkPublic;

use crate::error::Error;
use crate::root::{KeyHandle, RootOfTrust};

/// Current key blob format
pub const KEY_BLOB_VERSION: u32 = 1;

/// Persisted form of an attestation key
///
/// The private area is wrapped by the root that minted it and is useless
/// anywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlob {
    pub version: u32,
    pub tpm_version: u8,
    /// TPMT_PUBLIC
    #[serde(with = "base64_bytes")]
    pub public: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub private: Vec<u8>,
}

impl KeyBlob {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        Ok(json)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let blob: KeyBlob = serde_json::from_slice(data).context("key blob is not valid JSON")?;
        if blob.version != KEY_BLOB_VERSION {
            bail!(
                "unsupported key blob version {} (expected {})",
                blob.version,
                KEY_BLOB_VERSION
            );
        }
        if blob.public.is_empty() || blob.private.is_empty() {
            bail!("key blob has an empty key area");
        }
        Ok(blob)
    }
}

// =============================================================================
// Blob storage
// =============================================================================

/// Where the key blob lives between runs
pub trait BlobStore {
    /// The stored blob, or `None` if nothing has been stored
    fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the stored blob
    fn write(&self, blob: &[u8]) -> Result<()>;
}

/// A blob in one file, replaced whole on every write
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    fn write(&self, blob: &[u8]) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, blob).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }
}

/// A blob held in memory, for simulated roots and tests
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        let blob = self
            .blob
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        Ok(blob.clone())
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut blob = self
            .blob
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        *blob = Some(data.to_vec());
        Ok(())
    }
}

// =============================================================================
// Keys
// =============================================================================

/// An attestation key loaded into an open root
#[derive(Debug, Clone)]
pub struct AttestationKey {
    blob: KeyBlob,
    handle: KeyHandle,
    public: AkPublic,
}

impl AttestationKey {
    /// Public parameters, for distribution to verifiers
    pub fn public(&self) -> &AkPublic {
        &self.public
    }

    /// Valid only while the root that loaded it stays open
    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    pub fn blob(&self) -> &KeyBlob {
        &self.blob
    }
}

/// Mints, persists and reloads the attestation key
pub struct AttestationKeyManager<S> {
    store: S,
}

impl<S: BlobStore> AttestationKeyManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mint a new AK and persist it, replacing any stored key
    pub fn mint<R: RootOfTrust + ?Sized>(&self, root: &mut R) -> Result<AttestationKey, Error> {
        let material = root.mint_key().map_err(Error::KeyMint)?;
        let blob = KeyBlob {
            version: KEY_BLOB_VERSION,
            tpm_version: root.version(),
            public: material.public,
            private: material.private,
        };

        let key = bind(root, blob).map_err(Error::KeyMint)?;
        let json = key.blob.to_json().map_err(Error::Store)?;
        self.store.write(&json).map_err(Error::Store)?;

        info!(
            "minted attestation key {}",
            hex::encode(key.public.name())
        );
        Ok(key)
    }

    /// Load the stored AK, minting one only if none is stored
    pub fn ensure<R: RootOfTrust + ?Sized>(&self, root: &mut R) -> Result<AttestationKey, Error> {
        match self.store.read().map_err(Error::Store)? {
            Some(data) => self.load(root, &data),
            None => {
                info!("no stored attestation key, minting one");
                self.mint(root)
            }
        }
    }

    /// Load the stored AK
    pub fn load_stored<R: RootOfTrust + ?Sized>(
        &self,
        root: &mut R,
    ) -> Result<AttestationKey, Error> {
        let data = self
            .store
            .read()
            .map_err(Error::Store)?
            .ok_or_else(|| Error::KeyLoad(anyhow!("no attestation key has been minted")))?;
        self.load(root, &data)
    }

    /// Decode a key blob and load it into `root`
    pub fn load<R: RootOfTrust + ?Sized>(
        &self,
        root: &mut R,
        data: &[u8],
    ) -> Result<AttestationKey, Error> {
        let blob = KeyBlob::from_json(data).map_err(Error::KeyLoad)?;
        let key = bind(root, blob).map_err(Error::KeyLoad)?;
        info!(
            "loaded attestation key {}",
            hex::encode(key.public.name())
        );
        Ok(key)
    }
}

/// Load `blob` into `root` and check the root reports the same public area
fn bind<R: RootOfTrust + ?Sized>(root: &mut R, blob: KeyBlob) -> Result<AttestationKey> {
    if blob.tpm_version != root.version() {
        bail!(
            "key blob is for TPM version {}, root is version {}",
            blob.tpm_version,
            root.version()
        );
    }
    let public = AkPublic::parse(&blob.public).context("key blob public area is not an AK")?;

    let handle = root
        .load_key(&blob.public, &blob.private)
        .context("root refused the key blob")?;
    let reported = root.read_public(handle)?;
    if reported != blob.public {
        bail!(
            "public area reported for handle 0x{:08X} differs from the key blob",
            handle.raw()
        );
    }

    Ok(AttestationKey {
        blob,
        handle,
        public,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> KeyBlob {
        KeyBlob {
            version: KEY_BLOB_VERSION,
            tpm_version: 2,
            public: vec![0x00, 0x23, 0x00, 0x0B],
            private: vec![0xAA; 40],
        }
    }

    #[test]
    fn test_blob_round_trip_is_byte_exact() {
        let blob = sample_blob();
        let json = blob.to_json().unwrap();
        let decoded = KeyBlob::from_json(&json).unwrap();
        assert_eq!(decoded, blob);
        assert_eq!(decoded.to_json().unwrap(), json);
    }

    #[test]
    fn test_blob_field_names() {
        let value: serde_json::Value =
            serde_json::from_slice(&sample_blob().to_json().unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["tpm_version"], 2);
        assert_eq!(value["public"], "ACMACw==");
    }

    #[test]
    fn test_blob_unknown_version_rejected() {
        let mut blob = sample_blob();
        blob.version = 2;
        let json = serde_json::to_vec(&blob).unwrap();
        let err = KeyBlob::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("version 2"));
    }

    #[test]
    fn test_blob_garbage_rejected() {
        assert!(KeyBlob::from_json(b"not json").is_err());
        assert!(KeyBlob::from_json(br#"{"version":1,"tpm_version":2,"public":"!!","private":""}"#).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.read().unwrap(), None);
        store.write(b"one").unwrap();
        store.write(b"two").unwrap();
        assert_eq!(store.read().unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = std::env::temp_dir().join(format!("pcrattest-ak-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let store = FileBlobStore::new(dir.join("missing.json"));
        assert!(!store.exists());
        assert_eq!(store.read().unwrap(), None);

        let store = FileBlobStore::new(dir.join("ak.json"));
        store.write(b"blob").unwrap();
        assert!(store.exists());
        assert_eq!(store.read().unwrap(), Some(b"blob".to_vec()));
        fs::remove_dir_all(&dir).unwrap();
    }
}
