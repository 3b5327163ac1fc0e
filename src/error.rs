use blob_store::BlobStoreError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ZipperError {
    #[error("invalid request: {}", reason)]
    InvalidRequest { reason: String },

    #[error("object store unavailable: {}", source)]
    StoreUnavailable { source: BlobStoreError },

    #[error("object not found. bucket: {}, key: {}", bucket, key)]
    ObjectNotFound { bucket: String, key: String },

    #[error("scratch storage failure: {}", source)]
    Scratch {
        #[from]
        source: std::io::Error,
    },

    #[error("failed to write archive: {}", source)]
    Archive {
        #[from]
        source: zip::result::ZipError,
    },

    #[error("uploaded {} bytes, archive has {} bytes", actual, expected)]
    SizeMismatch { expected: u64, actual: u64 },

    #[error(
        "not enough scratch space. required: {} bytes, available: {} bytes",
        required,
        available
    )]
    CapacityExceeded { required: u64, available: u64 },

    #[error("too many archive jobs in flight, try again later")]
    Saturated,
}

impl ZipperError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        ZipperError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Identifies failures after which resubmitting the same request is
    /// expected to succeed once the underlying condition clears.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Saturated | Self::Scratch { .. }
        )
    }
}

impl From<BlobStoreError> for ZipperError {
    fn from(e: BlobStoreError) -> Self {
        match e {
            BlobStoreError::NotFound { bucket, key } => ZipperError::ObjectNotFound { bucket, key },
            e @ BlobStoreError::InvalidKey { .. } => ZipperError::invalid_request(e.to_string()),
            source => ZipperError::StoreUnavailable { source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_mapped() {
        let err: ZipperError = BlobStoreError::NotFound {
            bucket: "phfs".to_string(),
            key: "groups/g/a.txt".to_string(),
        }
        .into();
        assert!(matches!(err, ZipperError::ObjectNotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_key_is_a_bad_request() -> anyhow::Result<()> {
        let storage = blob_store::BlobStorage::new(blob_store::BlobStorageConfig::in_memory())?;
        let err: ZipperError = storage
            .stat("phfs", "groups/../a.txt")
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, ZipperError::InvalidRequest { .. }));
        Ok(())
    }

    #[test]
    fn test_retryable() {
        assert!(ZipperError::Saturated.is_retryable());
        assert!(!ZipperError::invalid_request("no files").is_retryable());
    }
}
