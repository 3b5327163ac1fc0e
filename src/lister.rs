use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use blob_store::{BlobStorage, BlobStoreError, ObjectInfo};
use tracing::{debug, warn};

use crate::{
    config::ListingFailurePolicy,
    data_model::{ObjectKey, ZipRequest},
    error::ZipperError,
    paths::{resolve, Resolved},
};

/// Listing side of the source store.
#[async_trait]
pub trait SourceListing: Send + Sync {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>, BlobStoreError>;
}

#[async_trait]
impl SourceListing for BlobStorage {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>, BlobStoreError> {
        BlobStorage::list_objects(self, bucket, prefix, recursive).await
    }
}

/// Expands resolved specifiers into the concrete keys of the source bucket.
pub struct ObjectLister {
    storage: Arc<dyn SourceListing>,
    bucket: String,
    policy: ListingFailurePolicy,
}

impl ObjectLister {
    pub fn new(
        storage: Arc<dyn SourceListing>,
        bucket: &str,
        policy: ListingFailurePolicy,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.to_string(),
            policy,
        }
    }

    /// Exact keys are passed through without an existence check, missing
    /// objects surface when the archive is assembled.
    pub async fn list(
        &self,
        resolved: &Resolved,
        recursive: bool,
    ) -> Result<Vec<ObjectKey>, ZipperError> {
        match resolved {
            Resolved::Key(key) => Ok(vec![key.clone()]),
            Resolved::Prefix(prefix) => {
                let objects = self
                    .storage
                    .list_objects(&self.bucket, prefix, recursive)
                    .await
                    .map_err(|source| match source {
                        source @ BlobStoreError::InvalidKey { .. } => ZipperError::from(source),
                        source => ZipperError::StoreUnavailable { source },
                    })?;
                debug!(prefix, matched = objects.len(), "listed prefix");
                Ok(objects
                    .into_iter()
                    .map(|object| ObjectKey::new(object.key))
                    .collect())
            }
        }
    }

    /// Resolves and expands every file of the request, preserving the order
    /// of the request's files. A key selected more than once, e.g. by a
    /// directory and by one of its files, is kept at its first position.
    pub async fn expand(&self, request: &ZipRequest) -> Result<Vec<ObjectKey>, ZipperError> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for file in request.files.iter() {
            let resolved = resolve(file, &request.group_name, request.path_prefix.as_deref());
            let listed = self.list(&resolved, true).await;
            for key in self.apply_policy(&resolved, listed)? {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    fn apply_policy(
        &self,
        resolved: &Resolved,
        listed: Result<Vec<ObjectKey>, ZipperError>,
    ) -> Result<Vec<ObjectKey>, ZipperError> {
        match (listed, self.policy) {
            (Ok(keys), _) => Ok(keys),
            (Err(err @ ZipperError::StoreUnavailable { .. }), ListingFailurePolicy::FailOpen) => {
                warn!(
                    bucket = %self.bucket,
                    "listing {:?} failed, continuing without it: {}", resolved, err
                );
                Ok(vec![])
            }
            (Err(err), _) => Err(err),
        }
    }
}
