use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    data_model::{JobId, ObjectKey},
    error::ZipperError,
};

/// A submission whose keys are resolved and which is tracked as pending.
#[derive(Debug, Clone)]
pub struct ZipJob {
    pub user_id: String,
    pub job_id: JobId,
    pub keys: Vec<ObjectKey>,
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: ZipJob);
}

/// Fixed set of workers draining a bounded queue of archive jobs. A full
/// queue rejects new jobs instead of blocking the submitter.
pub struct ZipWorkerPool {
    tx: mpsc::Sender<ZipJob>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ZipWorkerPool {
    pub fn start(
        handler: Arc<dyn JobHandler>,
        workers: usize,
        queue_capacity: usize,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers)
            .map(|worker_id| {
                let handler = handler.clone();
                let rx = rx.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, handler, rx, shutdown_rx).await;
                })
            })
            .collect();
        Self {
            tx,
            workers: std::sync::Mutex::new(workers),
        }
    }

    pub fn enqueue(&self, job: ZipJob) -> Result<(), ZipperError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => {
                error!(job_id = %job.job_id, "worker queue is full, rejecting job");
                ZipperError::Saturated
            }
            mpsc::error::TrySendError::Closed(job) => {
                error!(job_id = %job.job_id, "worker pool is shut down, rejecting job");
                ZipperError::Saturated
            }
        })
    }

    /// Waits for every worker to finish its current job after shutdown was
    /// signalled.
    pub async fn join(&self) {
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for worker in workers {
            if let Err(e) = worker.await {
                error!("archive worker panicked: {:?}", e);
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    handler: Arc<dyn JobHandler>,
    rx: Arc<Mutex<mpsc::Receiver<ZipJob>>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    info!(worker_id, "starting archive worker");
    loop {
        let job = tokio::select! {
            job = async { rx.lock().await.recv().await } => job,
            _ = shutdown_rx.changed() => None,
        };
        let Some(job) = job else {
            break;
        };
        handler.handle(job).await;
    }
    info!(worker_id, "archive worker shutting down");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;

    struct BlockingHandler {
        started: mpsc::UnboundedSender<JobId>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobHandler for BlockingHandler {
        async fn handle(&self, job: ZipJob) {
            let _ = self.started.send(job.job_id);
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }

    fn job() -> ZipJob {
        ZipJob {
            user_id: "u1".to_string(),
            job_id: JobId::new(),
            keys: vec![],
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_jobs() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let handler = Arc::new(BlockingHandler {
            started: started_tx,
            release: release.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let pool = ZipWorkerPool::start(handler, 1, 1, shutdown_rx);

        // One job occupies the worker, one waits in the queue.
        let running = job();
        pool.enqueue(running.clone()).unwrap();
        assert_eq!(started_rx.recv().await, Some(running.job_id));
        pool.enqueue(job()).unwrap();

        let err = pool.enqueue(job()).unwrap_err();
        assert!(matches!(err, ZipperError::Saturated));

        release.add_permits(1);
        let queued = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap();
        assert!(queued.is_some());

        release.add_permits(1);
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_jobs_run_on_all_workers() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let handler = Arc::new(BlockingHandler {
            started: started_tx,
            release: release.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let pool = ZipWorkerPool::start(handler, 3, 3, shutdown_rx);

        for _ in 0..3 {
            pool.enqueue(job()).unwrap();
        }
        // All three start before any is released.
        for _ in 0..3 {
            let started = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
                .await
                .unwrap();
            assert!(started.is_some());
        }

        release.add_permits(3);
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .unwrap();
    }
}
