//! Deadline enforcement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::storage::Database;

use super::job::JobStatus;

/// Error message stored on jobs failed by the deadline check.
pub const MISSED_DEADLINE: &str = "Missed deadline";

/// Fails non-terminal jobs whose deadline has passed.
///
/// Enforcement is advisory: the job is marked failed in the store but the
/// worker running it is not told to stop.
pub struct DeadlineEnforcer {
    db: Arc<Database>,
    metrics: SchedulerMetrics,
}

impl DeadlineEnforcer {
    pub fn new(db: Arc<Database>, metrics: SchedulerMetrics) -> Self {
        Self { db, metrics }
    }

    /// Fails every overdue job. Returns how many were failed.
    pub async fn check_deadlines(&self) -> Result<usize, SchedulerError> {
        self.check_deadlines_at(Utc::now()).await
    }

    /// Same as [`check_deadlines`](Self::check_deadlines) against an explicit
    /// clock reading.
    pub async fn check_deadlines_at(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let mut failed = 0;

        for overdue in self.db.get_overdue_jobs(now).await? {
            let updated = self
                .db
                .update_job_status(overdue.job_id, JobStatus::Failed, Some(MISSED_DEADLINE))
                .await?;
            if updated.is_some() {
                failed += 1;
                warn!(
                    job_id = overdue.job_id,
                    name = %overdue.name,
                    deadline = %overdue.deadline,
                    "Job failed, missed deadline"
                );
            }
        }

        self.metrics.record_deadlines_missed(failed as u64);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NewJob;
    use chrono::Duration;

    #[tokio::test]
    async fn test_pending_job_past_deadline_fails() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let late = db
            .add_job(
                NewJob::new("late", serde_json::json!({}))
                    .with_deadline(Utc::now() - Duration::minutes(5)),
            )
            .await
            .unwrap();
        let on_time = db
            .add_job(
                NewJob::new("on-time", serde_json::json!({}))
                    .with_deadline(Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();

        let enforcer = DeadlineEnforcer::new(Arc::clone(&db), SchedulerMetrics::new().unwrap());
        assert_eq!(enforcer.check_deadlines().await.unwrap(), 1);

        let late = db.get_job(late).await.unwrap().unwrap();
        assert_eq!(late.status, JobStatus::Failed);
        assert_eq!(late.error_message.as_deref(), Some(MISSED_DEADLINE));
        assert!(!db.is_queued(late.id).await.unwrap());

        let on_time = db.get_job(on_time).await.unwrap().unwrap();
        assert_eq!(on_time.status, JobStatus::Pending);

        // Already failed jobs are not counted again.
        assert_eq!(enforcer.check_deadlines().await.unwrap(), 0);
    }
}
