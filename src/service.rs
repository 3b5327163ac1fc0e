use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::BlobStorage;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use crate::{
    archive::ZipAssembler,
    cache::CachePublisher,
    capacity::{CapacityChecker, DiskSpace, ScratchDiskSpace},
    config::ServerConfig,
    eviction::Evictor,
    job_tracker::JobTracker,
    lister::ObjectLister,
    routes::{create_routes, RouteState},
    workers::ZipWorkerPool,
    zipper::{JobRunner, Zipper},
};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub cache: Arc<CachePublisher>,
    pub job_tracker: Arc<JobTracker>,
    pub zipper: Arc<Zipper>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let disk = Arc::new(ScratchDiskSpace::new(config.scratch_dir.clone()));
        Self::with_disk_space(config, disk).await
    }

    pub async fn with_disk_space(config: ServerConfig, disk: Arc<dyn DiskSpace>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::fs::create_dir_all(&config.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "error creating scratch directory {}",
                    config.scratch_dir.display()
                )
            })?;
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );

        let cache = Arc::new(CachePublisher::new(blob_storage.clone()));
        let job_tracker = Arc::new(JobTracker::new());

        let runner = Arc::new(JobRunner::new(
            ZipAssembler::new(
                blob_storage.clone(),
                &config.source_bucket,
                config.scratch_dir.clone(),
            ),
            cache.clone(),
            job_tracker.clone(),
        ));
        let pool = ZipWorkerPool::start(
            runner,
            config.workers.count,
            config.workers.queue_capacity,
            shutdown_rx.clone(),
        );

        let zipper = Arc::new(Zipper::new(
            ObjectLister::new(
                blob_storage.clone(),
                &config.source_bucket,
                config.listing_failure_policy,
            ),
            CapacityChecker::new(blob_storage.clone(), &config.source_bucket, disk),
            cache.clone(),
            job_tracker.clone(),
            pool,
            config.preflight_capacity_check,
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            cache,
            job_tracker,
            zipper,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            zipper: self.zipper.clone(),
        }
    }

    pub fn evictor(&self) -> Result<Evictor> {
        Ok(Evictor::new(
            self.cache.clone(),
            self.config.eviction.retention(),
            self.config.eviction.run_at_time()?,
            self.shutdown_rx.clone(),
        ))
    }

    pub async fn start(&mut self) -> Result<()> {
        let mut evictor = self.evictor()?;
        let evictor_handle = tokio::spawn(async move {
            evictor.start().await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        let served = axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await;

        // The server also stops when binding fails, without a signal.
        let _ = self.shutdown_tx.send(());
        self.zipper.shutdown().await;
        if let Err(e) = evictor_handle.await {
            error!("evictor task failed: {:?}", e);
        }
        info!("all background tasks stopped");
        Ok(served?)
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(None);
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
