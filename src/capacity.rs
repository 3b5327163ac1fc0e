use std::{path::PathBuf, sync::Arc};

use blob_store::BlobStorage;
use futures::{stream, StreamExt, TryStreamExt};
use sysinfo::Disks;
use tracing::debug;

use crate::{data_model::ObjectKey, error::ZipperError};

const STAT_CONCURRENCY: usize = 16;

/// Source of the free space available for archive assembly.
pub trait DiskSpace: Send + Sync {
    fn available_bytes(&self) -> Result<u64, ZipperError>;
}

/// Reports the free space of the disk the scratch directory lives on.
pub struct ScratchDiskSpace {
    scratch_dir: PathBuf,
}

impl ScratchDiskSpace {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }
}

impl DiskSpace for ScratchDiskSpace {
    fn available_bytes(&self) -> Result<u64, ZipperError> {
        let scratch_dir = self.scratch_dir.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| scratch_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
            .ok_or_else(|| ZipperError::Scratch {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no disk found for {}", scratch_dir.display()),
                ),
            })
    }
}

/// Accepted when the archive contents fit exactly.
pub fn fits(required: u64, available: u64) -> bool {
    required <= available
}

/// Preflight check comparing the size of the requested objects with the free
/// scratch space. Nothing is reserved, a concurrent job can still use up the
/// space between the check and the assembly.
pub struct CapacityChecker {
    storage: Arc<BlobStorage>,
    bucket: String,
    disk: Arc<dyn DiskSpace>,
}

impl CapacityChecker {
    pub fn new(storage: Arc<BlobStorage>, bucket: &str, disk: Arc<dyn DiskSpace>) -> Self {
        Self {
            storage,
            bucket: bucket.to_string(),
            disk,
        }
    }

    pub async fn required_bytes(&self, keys: &[ObjectKey]) -> Result<u64, ZipperError> {
        let keys: Vec<String> = keys.iter().map(|key| key.as_str().to_string()).collect();
        let sizes: Vec<u64> = stream::iter(keys)
            .map(|key| {
                let storage = self.storage.clone();
                let bucket = self.bucket.clone();
                async move {
                    storage
                        .stat(&bucket, &key)
                        .await
                        .map(|info| info.size)
                        .map_err(ZipperError::from)
                }
            })
            .buffered(STAT_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(sizes.iter().sum())
    }

    pub async fn check_capacity(&self, keys: &[ObjectKey]) -> Result<bool, ZipperError> {
        let required = self.required_bytes(keys).await?;
        let available = self.disk.available_bytes()?;
        debug!(required, available, "capacity check");
        Ok(fits(required, available))
    }

    /// Like [`Self::check_capacity`] but reports the shortfall as an error.
    pub async fn ensure_capacity(&self, keys: &[ObjectKey]) -> Result<(), ZipperError> {
        let required = self.required_bytes(keys).await?;
        let available = self.disk.available_bytes()?;
        if !fits(required, available) {
            return Err(ZipperError::CapacityExceeded {
                required,
                available,
            });
        }
        Ok(())
    }
}
