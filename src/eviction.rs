use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::cache::CacheIndex;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub buckets_scanned: usize,
    pub purged: usize,
    pub failed_buckets: Vec<String>,
}

/// Strictly older than the retention period. An archive exactly `retention`
/// old is kept, as is one with a timestamp in the future.
pub fn is_expired(last_modified: DateTime<Utc>, now: DateTime<Utc>, retention: Duration) -> bool {
    match (now - last_modified).to_std() {
        Ok(age) => age > retention,
        Err(_) => false,
    }
}

/// The first `run_at` wall clock time strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, run_at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(run_at).and_utc();
    if today > now {
        return today;
    }
    today
        .checked_add_days(Days::new(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Daily sweep purging archives older than the retention period from every
/// cache bucket.
pub struct Evictor {
    cache: Arc<dyn CacheIndex>,
    retention: Duration,
    run_at: NaiveTime,
    shutdown_rx: watch::Receiver<()>,
}

impl Evictor {
    pub fn new(
        cache: Arc<dyn CacheIndex>,
        retention: Duration,
        run_at: NaiveTime,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            cache,
            retention,
            run_at,
            shutdown_rx,
        }
    }

    /// Runs until shutdown is signalled. A sweep in progress finishes before
    /// the loop exits.
    pub async fn start(&mut self) {
        info!(run_at = %self.run_at, retention_secs = self.retention.as_secs(), "starting evictor");
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.run_at);
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(next_run = %next, "evictor sleeping");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.sweep(Utc::now()).await;
                }
                _ = self.shutdown_rx.changed() => {
                    info!("evictor shutting down");
                    return;
                }
            }
        }
    }

    /// Deletes every expired archive. A bucket that cannot be listed is
    /// reported and skipped, the sweep carries on with the other buckets.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EvictionReport {
        let mut report = EvictionReport::default();
        let buckets = match self.cache.cache_buckets().await {
            Ok(buckets) => buckets,
            Err(err) => {
                error!("eviction sweep could not list cache buckets: {}", err);
                return report;
            }
        };

        for bucket in buckets {
            report.buckets_scanned += 1;
            let entries = match self.cache.entries(&bucket).await {
                Ok(entries) => entries,
                Err(err) => {
                    error!(bucket, "eviction could not list bucket: {}", err);
                    report.failed_buckets.push(bucket);
                    continue;
                }
            };
            let mut bucket_failed = false;
            for entry in entries
                .iter()
                .filter(|entry| is_expired(entry.last_modified, now, self.retention))
            {
                match self.cache.remove(&bucket, &entry.name).await {
                    Ok(()) => {
                        debug!(bucket, name = entry.name, "evicted archive");
                        report.purged += 1;
                    }
                    Err(err) => {
                        error!(bucket, name = entry.name, "failed to evict archive: {}", err);
                        bucket_failed = true;
                    }
                }
            }
            if bucket_failed {
                report.failed_buckets.push(bucket);
            }
        }
        info!(
            buckets_scanned = report.buckets_scanned,
            purged = report.purged,
            failed_buckets = report.failed_buckets.len(),
            "eviction sweep finished"
        );
        report
    }
}
