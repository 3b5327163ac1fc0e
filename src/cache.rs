use std::sync::Arc;

use async_trait::async_trait;
use blob_store::{BlobStorage, PutResult};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    archive::Archive,
    data_model::{cache_bucket_name, JobId, CACHE_BUCKET_PREFIX},
    error::ZipperError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadableEntry {
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

/// The cache buckets as seen by eviction.
#[async_trait]
pub trait CacheIndex: Send + Sync {
    async fn cache_buckets(&self) -> Result<Vec<String>, ZipperError>;

    async fn entries(&self, bucket: &str) -> Result<Vec<DownloadableEntry>, ZipperError>;

    async fn remove(&self, bucket: &str, name: &str) -> Result<(), ZipperError>;
}

/// Owns the per-user `downloadable-*` buckets finished archives are served
/// from.
pub struct CachePublisher {
    storage: Arc<BlobStorage>,
}

impl CachePublisher {
    pub fn new(storage: Arc<BlobStorage>) -> Self {
        Self { storage }
    }

    pub fn bucket_name(user_id: &str) -> String {
        cache_bucket_name(user_id)
    }

    pub async fn ensure_bucket(&self, user_id: &str) -> Result<(), ZipperError> {
        let bucket = Self::bucket_name(user_id);
        if !self.storage.bucket_exists(&bucket).await? {
            info!(bucket, "creating cache bucket");
            self.storage.make_bucket(&bucket).await?;
        }
        Ok(())
    }

    pub async fn publish(
        &self,
        user_id: &str,
        job_id: &JobId,
        archive: &Archive,
    ) -> Result<PutResult, ZipperError> {
        let bucket = Self::bucket_name(user_id);
        let name = job_id.archive_name();
        let result = self.storage.put(&bucket, &name, archive.stream()?).await?;
        if result.size_bytes != archive.size_bytes() {
            // Never leave a truncated archive behind for download.
            let _ = self.storage.delete(&bucket, &name).await;
            return Err(ZipperError::SizeMismatch {
                expected: archive.size_bytes(),
                actual: result.size_bytes,
            });
        }
        info!(
            bucket,
            job_id = %job_id,
            size_bytes = result.size_bytes,
            "published archive"
        );
        Ok(result)
    }

    /// Archive names in the user's bucket, empty when the bucket does not exist.
    pub async fn list(&self, user_id: &str) -> Result<Vec<String>, ZipperError> {
        Ok(self
            .entries(&Self::bucket_name(user_id))
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }
}

#[async_trait]
impl CacheIndex for CachePublisher {
    async fn cache_buckets(&self) -> Result<Vec<String>, ZipperError> {
        Ok(self
            .storage
            .list_buckets()
            .await?
            .into_iter()
            .filter(|bucket| bucket.starts_with(CACHE_BUCKET_PREFIX))
            .collect())
    }

    async fn entries(&self, bucket: &str) -> Result<Vec<DownloadableEntry>, ZipperError> {
        let objects = self.storage.list_objects(bucket, "", true).await?;
        Ok(objects
            .into_iter()
            .map(|object| DownloadableEntry {
                name: object.key,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn remove(&self, bucket: &str, name: &str) -> Result<(), ZipperError> {
        self.storage.delete(bucket, name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use blob_store::BlobStorageConfig;
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::{archive::ZipAssembler, data_model::ObjectKey};

    #[tokio::test]
    async fn test_ensure_bucket_is_idempotent() -> Result<()> {
        let storage = Arc::new(BlobStorage::new(BlobStorageConfig::in_memory())?);
        let cache = CachePublisher::new(storage.clone());

        cache.ensure_bucket("u1").await?;
        cache.ensure_bucket("u1").await?;

        assert!(storage.bucket_exists("downloadable-u1").await?);
        assert_eq!(cache.cache_buckets().await?, vec!["downloadable-u1".to_string()]);
        assert!(cache.list("u1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_then_list() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let storage = Arc::new(BlobStorage::new(BlobStorageConfig::in_memory())?);
        let data = stream::iter(vec![Ok(Bytes::from("alpha"))]);
        storage.put("phfs", "groups/g/a.txt", data).await?;

        let assembler = ZipAssembler::new(storage.clone(), "phfs", scratch.path().to_path_buf());
        let cache = CachePublisher::new(storage.clone());
        let job_id = JobId::new();
        let archive = assembler
            .assemble(&job_id, &[ObjectKey::new("groups/g/a.txt")])
            .await?;

        cache.ensure_bucket("u1").await?;
        let result = cache.publish("u1", &job_id, &archive).await?;
        assert_eq!(result.size_bytes, archive.size_bytes());
        assert_eq!(
            storage.stat("downloadable-u1", &job_id.archive_name()).await?.size,
            archive.size_bytes()
        );
        assert_eq!(cache.list("u1").await?, vec![job_id.archive_name()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_unknown_user_is_empty() -> Result<()> {
        let storage = Arc::new(BlobStorage::new(BlobStorageConfig::in_memory())?);
        let cache = CachePublisher::new(storage);
        assert!(cache.list("nobody").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_buckets_skip_other_buckets() -> Result<()> {
        let storage = Arc::new(BlobStorage::new(BlobStorageConfig::in_memory())?);
        let data = stream::iter(vec![Ok(Bytes::from("alpha"))]);
        storage.put("phfs", "groups/g/a.txt", data).await?;
        let cache = CachePublisher::new(storage);
        cache.ensure_bucket("u2").await?;

        assert_eq!(cache.cache_buckets().await?, vec!["downloadable-u2".to_string()]);
        Ok(())
    }
}
