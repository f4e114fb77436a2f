//! Object storage for geometry packages and processing artifacts.
//! Backed by the `object_store` crate.

use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ObjectStore, path::Path as StoragePath};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{StorageConfig, StorageProvider};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend misconfigured: {0}")]
    Configuration(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub key: String,
    pub etag: Option<String>,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Pass back as `offset` to fetch the next page
    pub next_offset: Option<String>,
}

#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl StorageClient {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            bucket: "geobatch-local".to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.provider {
            StorageProvider::Memory => Arc::new(InMemory::new()),
            StorageProvider::Local => {
                std::fs::create_dir_all(&config.local_root)?;
                Arc::new(LocalFileSystem::new_with_prefix(&config.local_root)?)
            }
            StorageProvider::S3 => {
                let (Some(access_key), Some(secret_key)) =
                    (config.access_key.as_ref(), config.secret_key.as_ref())
                else {
                    return Err(StorageError::Configuration(
                        "S3 provider requires access and secret keys".into(),
                    ));
                };
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&config.bucket)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
        };
        info!(provider = ?config.provider, bucket = %config.bucket, "Object storage ready");
        Ok(Self::new(store, config.bucket.clone()))
    }

    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<UploadMetadata> {
        let path = StoragePath::from(key);
        let size = data.len();
        let put_result = self.store.put(&path, data.into()).await?;

        info!(key, size, "Uploaded to storage");
        Ok(UploadMetadata {
            key: key.to_string(),
            etag: put_result.e_tag,
            size,
        })
    }

    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = StoragePath::from(key);
        let bytes = self.store.get(&path).await?.bytes().await?;
        debug!(key, size = bytes.len(), "Downloaded from storage");
        Ok(bytes.to_vec())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one object. Missing objects are not an error.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);
        match self.store.delete(&path).await {
            Ok(()) => {
                debug!(key, "Deleted object");
                Ok(true)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `prefix` itself and everything stored beneath it. Returns the
    /// number of objects listed for deletion.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_all(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        let exact = if keys.iter().any(|k| k == prefix) {
            0
        } else {
            usize::from(self.exists(prefix).await? && self.delete(prefix).await?)
        };
        let removed = keys.len() + exact;
        info!(prefix, removed, "Deleted objects by prefix");
        Ok(removed)
    }

    /// Keys under `prefix` in lexicographic order, at most `limit` per page,
    /// starting strictly after `offset`. A `limit` of 0 returns every key.
    ///
    /// Backends list in no fixed order, so the page is the `limit + 1`
    /// smallest keys seen; memory stays bounded by the page size.
    pub async fn list_page(
        &self,
        prefix: &str,
        offset: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        if limit == 0 {
            let mut keys = self.list_all(prefix).await?;
            if let Some(offset) = offset {
                keys.retain(|k| k.as_str() > offset);
            }
            return Ok(ListPage {
                keys,
                next_offset: None,
            });
        }

        let path = StoragePath::from(prefix);
        let mut listing = match offset {
            Some(offset) => self
                .store
                .list_with_offset(Some(&path), &StoragePath::from(offset)),
            None => self.store.list(Some(&path)),
        };

        let mut smallest: BinaryHeap<String> = BinaryHeap::with_capacity(limit + 1);
        while let Some(meta) = listing.try_next().await? {
            let key = meta.location.to_string();
            if offset.is_some_and(|offset| key.as_str() <= offset) {
                continue;
            }
            if smallest.len() <= limit {
                smallest.push(key);
            } else if smallest.peek().is_some_and(|largest| key < *largest) {
                smallest.pop();
                smallest.push(key);
            }
        }

        let mut keys = smallest.into_sorted_vec();
        let next_offset = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().cloned()
        } else {
            None
        };
        debug!(prefix, returned = keys.len(), more = next_offset.is_some(), "Listed page");
        Ok(ListPage { keys, next_offset })
    }

    async fn list_all(&self, prefix: &str) -> Result<Vec<String>> {
        let path = StoragePath::from(prefix);
        let mut keys: Vec<String> = self
            .store
            .list(Some(&path))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }
}
