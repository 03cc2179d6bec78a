//! Content-addressed storage for snapshots too large to keep inline.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::StoreError;

const BLOB_TREE: &str = "blobs";

// Fixed namespace; keys are stable across processes and machines.
const BLOB_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1f, 0x3c, 0x52, 0x94, 0x0e, 0x4d, 0x7a, 0xa1, 0x5c, 0x28, 0xe3, 0x90, 0x77, 0x4b, 0xd2,
]);

/// Key under which `bytes` are stored.
pub fn content_key(bytes: &[u8]) -> String {
    Uuid::new_v5(&BLOB_NAMESPACE, bytes).simple().to_string()
}

#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    /// Stores `bytes` under `key` and returns the key. Storing the same key
    /// twice is harmless.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SledBlobStore {
    tree: sled::Tree,
}

impl SledBlobStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(SledBlobStore {
            tree: db.open_tree(BLOB_TREE)?,
        })
    }

    /// Opens a dedicated database at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open(&sled::open(path)?)
    }
}

#[async_trait]
impl BlobStore for SledBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        self.tree.insert(key.as_bytes(), bytes)?;
        self.tree.flush_async().await?;
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}
