use std::{env, sync::Arc};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use object_store::{
    aws::AmazonS3Builder,
    parse_url,
    path::{InvalidPart, Path, PathPart},
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use url::Url;

/// Object written under every bucket created through [`BlobStorage::make_bucket`]
/// so that empty buckets can still be discovered.
const BUCKET_MARKER: &str = ".bucket";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BlobStoreError {
    #[error("object not found. bucket: {}, key: {}", bucket, key)]
    NotFound { bucket: String, key: String },

    #[error("object store request failed. bucket: {}, error: {}", bucket, source)]
    Store {
        bucket: String,
        source: object_store::Error,
    },

    #[error("invalid object key. bucket: {}, key: {}, error: {}", bucket, key, source)]
    InvalidKey {
        bucket: String,
        key: String,
        source: InvalidPart,
    },

    #[error("failed to read upload stream: {}", source)]
    Stream {
        #[from]
        source: std::io::Error,
    },
}

impl BlobStoreError {
    fn from_store(bucket: &str, key: &str, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => BlobStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            source => BlobStoreError::Store {
                bucket: bucket.to_string(),
                source,
            },
        }
    }

    fn invalid_key(bucket: &str, key: &str, source: InvalidPart) -> Self {
        BlobStoreError::InvalidKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobStoreError::NotFound { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Root url of the store. Buckets are created as top level prefixes below
    /// it, not as native S3 buckets. Supports `file://`, `s3://` and
    /// `memory://`.
    pub path: String,
    /// Custom S3 endpoint, e.g. a MinIO deployment.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            endpoint: None,
            allow_http: false,
        }
    }

    pub fn in_memory() -> Self {
        BlobStorageConfig {
            path: "memory:///".to_string(),
            endpoint: None,
            allow_http: false,
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = env::current_dir()
            .unwrap_or_default()
            .join("zipper_storage/blobs");
        BlobStorageConfig::new(&blob_store_path.to_string_lossy())
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
}

/// Metadata of a stored object. `key` is relative to its bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let (object_store, path) = Self::build_object_store(&config)?;
        info!("using blob store path: {}", config.path);
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
        })
    }

    pub fn build_object_store(config: &BlobStorageConfig) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = config.path.parse::<Url>()?;
        let (scheme, path) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // AWS_* variables take precedence over instance metadata credentials.
                let mut s3_builder = AmazonS3Builder::from_env().with_url(config.path.as_str());
                // For supporting localstack/minio
                if let Some(endpoint) = &config.endpoint {
                    s3_builder = s3_builder
                        .with_endpoint(endpoint)
                        .with_allow_http(config.allow_http);
                }
                Ok((Box::new(s3_builder.build()?), path))
            }
            _ => Ok(parse_url(&url)?),
        }
    }

    // Segments are stored unescaped so that listed locations read back as the
    // keys they were written with.
    fn bucket_path(&self, bucket: &str) -> Result<Path, BlobStoreError> {
        let part =
            PathPart::parse(bucket).map_err(|e| BlobStoreError::invalid_key(bucket, "", e))?;
        Ok(self.path.child(part))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<Path, BlobStoreError> {
        let bucket_path = self.bucket_path(bucket)?;
        let parts = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|segment| {
                PathPart::parse(segment).map_err(|e| BlobStoreError::invalid_key(bucket, key, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bucket_path.parts().chain(parts).collect())
    }

    fn relative_key(bucket_path: &Path, location: &Path) -> Option<String> {
        let parts: Vec<String> = location
            .prefix_match(bucket_path)?
            .map(|part| part.as_ref().to_string())
            .collect();
        Some(parts.join("/"))
    }

    fn object_info(bucket_path: &Path, meta: ObjectMeta) -> Option<ObjectInfo> {
        let key = Self::relative_key(bucket_path, &meta.location)?;
        if key.is_empty() || key == BUCKET_MARKER {
            return None;
        }
        Some(ObjectInfo {
            key,
            size: meta.size,
            last_modified: meta.last_modified,
        })
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool, BlobStoreError> {
        let marker = self.object_path(bucket, BUCKET_MARKER)?;
        match self.object_store.head(&marker).await {
            Ok(_) => return Ok(true),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(BlobStoreError::from_store(bucket, BUCKET_MARKER, e)),
        }
        // Buckets populated out of band carry no marker.
        let bucket_path = self.bucket_path(bucket)?;
        let mut objects = self.object_store.list(Some(&bucket_path));
        match objects.next().await {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(BlobStoreError::from_store(bucket, "", e)),
            None => Ok(false),
        }
    }

    pub async fn make_bucket(&self, bucket: &str) -> Result<(), BlobStoreError> {
        let marker = self.object_path(bucket, BUCKET_MARKER)?;
        self.object_store
            .put(&marker, PutPayload::new())
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, BUCKET_MARKER, e))?;
        debug!(bucket, "created bucket");
        Ok(())
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>, BlobStoreError> {
        let listing = self
            .object_store
            .list_with_delimiter(Some(&self.path))
            .await
            .map_err(|e| BlobStoreError::from_store("", "", e))?;
        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| prefix.filename().map(|name| name.to_string()))
            .collect())
    }

    /// Lists objects under `prefix` in the order the store reports them.
    /// Without `recursive` only the objects directly below the prefix are
    /// returned.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>, BlobStoreError> {
        let bucket_path = self.bucket_path(bucket)?;
        let prefix_path = self.object_path(bucket, prefix)?;
        if recursive {
            return self
                .object_store
                .list(Some(&prefix_path))
                .map_err(|e| BlobStoreError::from_store(bucket, prefix, e))
                .try_filter_map(|meta| {
                    let info = Self::object_info(&bucket_path, meta);
                    async move { Ok(info) }
                })
                .try_collect()
                .await;
        }

        let listing = self
            .object_store
            .list_with_delimiter(Some(&prefix_path))
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, prefix, e))?;
        Ok(listing
            .objects
            .into_iter()
            .filter_map(|meta| Self::object_info(&bucket_path, meta))
            .collect())
    }

    pub async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectInfo, BlobStoreError> {
        let meta = self
            .object_store
            .head(&self.object_path(bucket, key)?)
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, key, e))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
        })
    }

    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut data: impl Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult, BlobStoreError> {
        let path = self.object_path(bucket, key)?;
        let upload = self
            .object_store
            .put_multipart(&path)
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, key, e))?;
        let mut w = WriteMultipart::new(upload);
        let mut size_bytes = 0;
        while let Some(chunk) = data.next().await {
            w.wait_for_capacity(1)
                .await
                .map_err(|e| BlobStoreError::from_store(bucket, key, e))?;
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = w.abort().await;
                    return Err(e.into());
                }
            };
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish()
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, key, e))?;

        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
        })
    }

    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, BlobStoreError>>, BlobStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let get_result = self
            .object_store
            .get(&self.object_path(bucket, key)?)
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, key, e))?;
        let bucket = bucket.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            let mut stream = get_result.into_stream();
            while let Some(chunk) = stream.next().await {
                let _ = tx.send(chunk.map_err(|e| BlobStoreError::from_store(&bucket, &key, e)));
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub async fn read_bytes(&self, bucket: &str, key: &str) -> Result<Bytes, BlobStoreError> {
        let mut reader = self.get(bucket, key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobStoreError> {
        self.object_store
            .delete(&self.object_path(bucket, key)?)
            .await
            .map_err(|e| BlobStoreError::from_store(bucket, key, e))?;
        Ok(())
    }
}
