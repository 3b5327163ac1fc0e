use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use axum::Router;
use blob_store::BlobStorageConfig;
use bytes::Bytes;
use futures::stream;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    capacity::tests::FixedDiskSpace,
    config::ServerConfig,
    job_tracker::Poll,
    routes::create_routes,
    service::Service,
};

pub struct TestService {
    pub service: Service,
    scratch: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_available_bytes(u64::MAX).await
    }

    pub async fn with_available_bytes(available: u64) -> Result<Self> {
        Self::with_config(available, |_| {}).await
    }

    /// Builds a service over an in-memory store. `configure` may adjust the
    /// config before the service is created.
    pub async fn with_config(
        available: u64,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let scratch = tempfile::tempdir()?;
        let mut cfg = ServerConfig {
            blob_storage: BlobStorageConfig::in_memory(),
            scratch_dir: scratch.path().to_path_buf(),
            ..Default::default()
        };
        configure(&mut cfg);
        let service =
            Service::with_disk_space(cfg, Arc::new(FixedDiskSpace(available))).await?;

        Ok(Self {
            service,
            scratch,
        })
    }

    pub fn router(&self) -> Router {
        create_routes(self.service.route_state())
    }

    pub async fn put_source(&self, key: &str, data: &str) -> Result<()> {
        let data = stream::iter(vec![Ok(Bytes::from(data.to_string()))]);
        self.service
            .blob_storage
            .put(&self.service.config.source_bucket, key, data)
            .await?;
        Ok(())
    }

    /// Polls until the user's oldest job is finished and returns the poll
    /// that observed it, which is also the one that reaped it.
    pub async fn wait_for_finished_job(&self, user_id: &str) -> Result<Poll> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let polled = self.service.zipper.poll(user_id);
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

    pub fn scratch_files(&self) -> Result<usize> {
        Ok(std::fs::read_dir(self.scratch.path())?.count())
    }
}
