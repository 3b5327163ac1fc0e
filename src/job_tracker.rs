use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::debug;

use crate::data_model::{JobId, JobStatus};

#[derive(Debug, Clone)]
struct TrackedJob {
    job_id: JobId,
    status: JobStatus,
}

/// Result of polling a user's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Empty,
    Entry { job_id: JobId, status: JobStatus },
}

impl Poll {
    pub fn file(&self) -> Option<String> {
        match self {
            Poll::Empty => None,
            Poll::Entry { job_id, .. } => Some(job_id.archive_name()),
        }
    }
}

/// In-memory, per-user FIFO of archive jobs.
///
/// Each user's queue lives in its own map entry, so mutations of one queue are
/// serialized by the map's shard lock while other users proceed. Entries keep
/// their position from submission until a poll observes them finished; that
/// poll removes them. Nothing else removes entries, in particular pending jobs
/// are never dropped.
#[derive(Default)]
pub struct JobTracker {
    queues: DashMap<String, VecDeque<TrackedJob>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, user_id: &str, job_id: JobId) {
        self.queues
            .entry(user_id.to_string())
            .or_default()
            .push_back(TrackedJob {
                job_id,
                status: JobStatus::Pending,
            });
        debug!(
            user_id,
            job_id = %job_id,
            queued = self.queue_len(user_id),
            "job submitted"
        );
    }

    pub fn mark_completed(&self, user_id: &str, job_id: &JobId) -> bool {
        self.finish(user_id, job_id, JobStatus::Completed)
    }

    pub fn mark_failed(&self, user_id: &str, job_id: &JobId, error: String) -> bool {
        self.finish(user_id, job_id, JobStatus::Failed { error })
    }

    /// Updates a pending job in place. Returns false when the job is unknown or
    /// already finished.
    fn finish(&self, user_id: &str, job_id: &JobId, status: JobStatus) -> bool {
        let Some(mut queue) = self.queues.get_mut(user_id) else {
            return false;
        };
        match queue
            .iter_mut()
            .find(|job| job.job_id == *job_id && job.status == JobStatus::Pending)
        {
            Some(job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// Drops a job that never made it onto the worker queue.
    pub fn withdraw(&self, user_id: &str, job_id: &JobId) -> bool {
        let removed = match self.queues.get_mut(user_id) {
            Some(mut queue) => {
                let before = queue.len();
                queue.retain(|job| job.job_id != *job_id);
                queue.len() != before
            }
            None => false,
        };
        self.queues.remove_if(user_id, |_, queue| queue.is_empty());
        removed
    }

    /// Reports the oldest job of the user. Finished jobs are removed by the
    /// poll that returns them; pending jobs stay at the head of the queue.
    pub fn poll(&self, user_id: &str) -> Poll {
        let polled = match self.queues.get_mut(user_id) {
            Some(mut queue) => match queue.front().cloned() {
                Some(job) => {
                    if job.status.is_finished() {
                        queue.pop_front();
                        debug!(user_id, job_id = %job.job_id, "reaped job");
                    }
                    Poll::Entry {
                        job_id: job.job_id,
                        status: job.status,
                    }
                }
                None => Poll::Empty,
            },
            None => Poll::Empty,
        };
        self.queues.remove_if(user_id, |_, queue| queue.is_empty());
        polled
    }

    pub fn queue_len(&self, user_id: &str) -> usize {
        self.queues.get(user_id).map(|queue| queue.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_poll_unknown_user_is_empty() {
        let tracker = JobTracker::new();
        assert_eq!(tracker.poll("never-submitted"), Poll::Empty);
    }

    #[test]
    fn test_pending_job_is_not_reaped() {
        let tracker = JobTracker::new();
        let job_id = JobId::new();
        tracker.submit("u1", job_id);

        for _ in 0..3 {
            assert_eq!(
                tracker.poll("u1"),
                Poll::Entry {
                    job_id,
                    status: JobStatus::Pending
                }
            );
        }
        assert_eq!(tracker.queue_len("u1"), 1);
    }

    #[test]
    fn test_completed_job_is_reaped_once() {
        let tracker = JobTracker::new();
        let job_id = JobId::new();
        tracker.submit("u1", job_id);
        assert!(tracker.mark_completed("u1", &job_id));

        let polled = tracker.poll("u1");
        assert_eq!(polled.file(), Some(job_id.archive_name()));
        assert_eq!(
            polled,
            Poll::Entry {
                job_id,
                status: JobStatus::Completed
            }
        );
        assert_eq!(tracker.poll("u1"), Poll::Empty);
    }

    #[test]
    fn test_oldest_job_is_reported_first() {
        let tracker = JobTracker::new();
        let first = JobId::new();
        let second = JobId::new();
        tracker.submit("u1", first);
        tracker.submit("u1", second);

        // Completing the newer job does not move it ahead of the older one.
        tracker.mark_completed("u1", &second);
        assert_eq!(
            tracker.poll("u1"),
            Poll::Entry {
                job_id: first,
                status: JobStatus::Pending
            }
        );

        tracker.mark_completed("u1", &first);
        assert_eq!(
            tracker.poll("u1"),
            Poll::Entry {
                job_id: first,
                status: JobStatus::Completed
            }
        );
        assert_eq!(
            tracker.poll("u1"),
            Poll::Entry {
                job_id: second,
                status: JobStatus::Completed
            }
        );
        assert_eq!(tracker.poll("u1"), Poll::Empty);
    }

    #[test]
    fn test_failed_job_is_observable() {
        let tracker = JobTracker::new();
        let job_id = JobId::new();
        tracker.submit("u1", job_id);
        assert!(tracker.mark_failed("u1", &job_id, "object not found".to_string()));
        // Finished jobs do not change status again.
        assert!(!tracker.mark_completed("u1", &job_id));

        assert_eq!(
            tracker.poll("u1"),
            Poll::Entry {
                job_id,
                status: JobStatus::Failed {
                    error: "object not found".to_string()
                }
            }
        );
        assert_eq!(tracker.poll("u1"), Poll::Empty);
    }

    #[test]
    fn test_users_are_independent() {
        let tracker = JobTracker::new();
        let job_id = JobId::new();
        tracker.submit("u1", job_id);
        assert!(!tracker.mark_completed("u2", &job_id));
        assert_eq!(tracker.poll("u2"), Poll::Empty);
        assert_eq!(tracker.queue_len("u1"), 1);
    }

    #[test]
    fn test_withdraw() {
        let tracker = JobTracker::new();
        let job_id = JobId::new();
        tracker.submit("u1", job_id);
        assert!(tracker.withdraw("u1", &job_id));
        assert!(!tracker.withdraw("u1", &job_id));
        assert_eq!(tracker.poll("u1"), Poll::Empty);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions() {
        let tracker = Arc::new(JobTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let user = if i % 2 == 0 { "u1" } else { "u2" };
                    for _ in 0..100 {
                        tracker.submit(user, JobId::new());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tracker.queue_len("u1"), 400);
        assert_eq!(tracker.queue_len("u2"), 400);
    }
}
