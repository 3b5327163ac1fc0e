use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::{
    archive::ZipAssembler,
    cache::CachePublisher,
    capacity::CapacityChecker,
    data_model::{JobId, ZipRequest},
    error::ZipperError,
    job_tracker::{JobTracker, Poll},
    lister::ObjectLister,
    workers::{JobHandler, ZipJob, ZipWorkerPool},
};

/// Turns a queued job into a published archive and records the outcome in the
/// tracker.
pub struct JobRunner {
    assembler: ZipAssembler,
    cache: Arc<CachePublisher>,
    tracker: Arc<JobTracker>,
}

impl JobRunner {
    pub fn new(
        assembler: ZipAssembler,
        cache: Arc<CachePublisher>,
        tracker: Arc<JobTracker>,
    ) -> Self {
        Self {
            assembler,
            cache,
            tracker,
        }
    }

    async fn run(&self, job: &ZipJob) -> Result<(), ZipperError> {
        let archive = self.assembler.assemble(&job.job_id, &job.keys).await?;
        debug!(
            job_id = %job.job_id,
            path = %archive.path().display(),
            entries = archive.entries(),
            "uploading archive"
        );
        self.cache.publish(&job.user_id, &job.job_id, &archive).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: ZipJob) {
        match self.run(&job).await {
            Ok(()) => {
                self.tracker.mark_completed(&job.user_id, &job.job_id);
                info!(user_id = job.user_id, job_id = %job.job_id, "archive job completed");
            }
            Err(err) => {
                error!(
                    user_id = job.user_id,
                    job_id = %job.job_id,
                    retryable = err.is_retryable(),
                    "archive job failed: {}", err
                );
                self.tracker
                    .mark_failed(&job.user_id, &job.job_id, err.to_string());
            }
        }
    }
}

/// Entry point for the HTTP layer: validates and expands submissions, queues
/// them on the worker pool and answers status queries.
pub struct Zipper {
    lister: ObjectLister,
    capacity: CapacityChecker,
    cache: Arc<CachePublisher>,
    tracker: Arc<JobTracker>,
    pool: ZipWorkerPool,
    preflight_capacity_check: bool,
}

impl Zipper {
    pub fn new(
        lister: ObjectLister,
        capacity: CapacityChecker,
        cache: Arc<CachePublisher>,
        tracker: Arc<JobTracker>,
        pool: ZipWorkerPool,
        preflight_capacity_check: bool,
    ) -> Self {
        Self {
            lister,
            capacity,
            cache,
            tracker,
            pool,
            preflight_capacity_check,
        }
    }

    /// Accepts a request for background assembly. The job is tracked as
    /// pending before it reaches a worker, so it is visible to the very next
    /// poll.
    pub async fn submit(&self, request: ZipRequest) -> Result<JobId, ZipperError> {
        validate(&request)?;
        let keys = self.lister.expand(&request).await?;
        if self.preflight_capacity_check {
            self.capacity.ensure_capacity(&keys).await?;
        }
        self.cache.ensure_bucket(&request.user_id).await?;

        let job_id = JobId::new();
        self.tracker.submit(&request.user_id, job_id);
        let job = ZipJob {
            user_id: request.user_id.clone(),
            job_id,
            keys,
        };
        if let Err(err) = self.pool.enqueue(job) {
            self.tracker.withdraw(&request.user_id, &job_id);
            return Err(err);
        }
        info!(user_id = request.user_id, job_id = %job_id, "archive job queued");
        Ok(job_id)
    }

    pub async fn check_capacity(&self, request: &ZipRequest) -> Result<bool, ZipperError> {
        validate(request)?;
        let keys = self.lister.expand(request).await?;
        self.capacity.check_capacity(&keys).await
    }

    pub async fn downloadable(&self, user_id: &str) -> Result<Vec<String>, ZipperError> {
        validate_user_id(user_id)?;
        self.cache.list(user_id).await
    }

    pub fn poll(&self, user_id: &str) -> Poll {
        self.tracker.poll(user_id)
    }

    /// Stops accepting work once shutdown was signalled and waits for the
    /// workers to drain their current jobs.
    pub async fn shutdown(&self) {
        self.pool.join().await;
    }
}

fn validate_user_id(user_id: &str) -> Result<(), ZipperError> {
    if user_id.is_empty() {
        return Err(ZipperError::invalid_request("user_id must not be empty"));
    }
    if user_id.contains('/') {
        return Err(ZipperError::invalid_request(format!(
            "user_id {:?} must not contain '/'",
            user_id
        )));
    }
    Ok(())
}

fn validate(request: &ZipRequest) -> Result<(), ZipperError> {
    validate_user_id(&request.user_id)?;
    if request.files.is_empty() {
        return Err(ZipperError::invalid_request("files must not be empty"));
    }
    if request.group_name.is_empty() {
        return Err(ZipperError::invalid_request("groupName must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use blob_store::{BlobStorage, BlobStorageConfig};
    use bytes::Bytes;
    use futures::stream;
    use tempfile::TempDir;
    use tokio::sync::watch;

    use super::*;
    use crate::{
        capacity::tests::FixedDiskSpace,
        config::ListingFailurePolicy,
        data_model::{FileSpecifier, JobStatus},
        lister::tests::UnreachableListing,
    };

    /// A zipper whose source listings always fail. Exact keys are still
    /// served by an in-memory store holding `groups/g/a.txt`.
    struct UnreachableSource {
        zipper: Zipper,
        storage: Arc<BlobStorage>,
        _scratch: TempDir,
        _shutdown_tx: watch::Sender<()>,
    }

    async fn unreachable_source(policy: ListingFailurePolicy) -> Result<UnreachableSource> {
        let storage = Arc::new(BlobStorage::new(BlobStorageConfig::in_memory())?);
        let data = stream::iter(vec![Ok(Bytes::from("alpha"))]);
        storage.put("phfs", "groups/g/a.txt", data).await?;

        let scratch = tempfile::tempdir()?;
        let cache = Arc::new(CachePublisher::new(storage.clone()));
        let tracker = Arc::new(JobTracker::new());
        let runner = Arc::new(JobRunner::new(
            ZipAssembler::new(storage.clone(), "phfs", scratch.path().to_path_buf()),
            cache.clone(),
            tracker.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let pool = ZipWorkerPool::start(runner, 1, 4, shutdown_rx);
        let zipper = Zipper::new(
            ObjectLister::new(Arc::new(UnreachableListing), "phfs", policy),
            CapacityChecker::new(storage.clone(), "phfs", Arc::new(FixedDiskSpace(u64::MAX))),
            cache,
            tracker,
            pool,
            true,
        );
        Ok(UnreachableSource {
            zipper,
            storage,
            _scratch: scratch,
            _shutdown_tx: shutdown_tx,
        })
    }

    async fn wait_for_finished(zipper: &Zipper, user_id: &str) -> Result<Poll> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let polled = zipper.poll(user_id);
            match &polled {
                Poll::Entry { status, .. } if status.is_finished() => return Ok(polled),
                Poll::Empty => return Err(anyhow!("no job queued for {}", user_id)),
                Poll::Entry { .. } => {}
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("job of {} did not finish in time", user_id));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn request(user_id: &str, files: &[&str]) -> ZipRequest {
        ZipRequest {
            user_id: user_id.to_string(),
            files: files.iter().map(|f| FileSpecifier::parse(f)).collect(),
            group_name: "g".to_string(),
            path_prefix: None,
        }
    }

    #[tokio::test]
    async fn test_unreachable_listing_rejects_submission() -> Result<()> {
        let source = unreachable_source(ListingFailurePolicy::FailRequest).await?;

        let err = source
            .zipper
            .submit(request("u1", &["dir/", "a.txt"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ZipperError::StoreUnavailable { .. }));
        assert_eq!(source.zipper.poll("u1"), Poll::Empty);
        assert!(!source.storage.bucket_exists("downloadable-u1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_listing_can_fail_open() -> Result<()> {
        let source = unreachable_source(ListingFailurePolicy::FailOpen).await?;

        let job_id = source
            .zipper
            .submit(request("u1", &["dir/", "a.txt"]))
            .await?;
        assert_eq!(
            wait_for_finished(&source.zipper, "u1").await?,
            Poll::Entry {
                job_id,
                status: JobStatus::Completed
            }
        );
        assert_eq!(
            source.zipper.downloadable("u1").await?,
            vec![job_id.archive_name()]
        );
        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(validate(&request("u1", &["a.txt"])).is_ok());
        assert!(matches!(
            validate(&request("", &["a.txt"])),
            Err(ZipperError::InvalidRequest { .. })
        ));
        assert!(matches!(
            validate(&request("u/1", &["a.txt"])),
            Err(ZipperError::InvalidRequest { .. })
        ));
        assert!(matches!(
            validate(&request("u1", &[])),
            Err(ZipperError::InvalidRequest { .. })
        ));
    }
}
