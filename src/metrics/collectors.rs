//! Recording helpers for scheduler metrics.
//!
//! Components call these instead of touching the raw Prometheus handles, so
//! label values stay consistent.

use std::time::Duration;

use super::prometheus::{push_outcomes, reasons, SchedulerMetrics};
use crate::scheduler::allocation::AllocationOutcome;

impl SchedulerMetrics {
    /// Record the outcome of one allocation attempt.
    pub fn record_allocation(&self, outcome: &AllocationOutcome) {
        let reason = match outcome {
            AllocationOutcome::Assigned { .. } => {
                self.jobs_scheduled.inc();
                return;
            }
            AllocationOutcome::NoWorkersOnline => reasons::NO_WORKERS_ONLINE,
            AllocationOutcome::NoCapacity => reasons::NO_CAPACITY,
            AllocationOutcome::Lost { .. } => reasons::LOST,
        };
        self.allocation_rejections.with_label_values(&[reason]).inc();
    }

    /// Record a scheduling pass that found nothing queued.
    pub fn record_empty_queue(&self) {
        self.empty_queue_cycles.inc();
    }

    /// Record a health check.
    pub fn record_health(&self, offline_workers: u64, requeued: u64, exhausted: u64) {
        self.workers_marked_offline.inc_by(offline_workers);
        self.jobs_requeued.inc_by(requeued);
        self.retries_exhausted.inc_by(exhausted);
    }

    /// Record jobs failed by the deadline check.
    pub fn record_deadlines_missed(&self, count: u64) {
        self.deadlines_missed.inc_by(count);
    }

    /// Record a job push.
    pub fn record_push(&self, acknowledged: bool) {
        let outcome = if acknowledged {
            push_outcomes::ACK
        } else {
            push_outcomes::FAILED
        };
        self.job_pushes.with_label_values(&[outcome]).inc();
    }

    /// Record stored crash reports.
    pub fn record_crashes(&self, count: u64) {
        self.crashes_ingested.inc_by(count);
    }

    /// Record a full cycle's duration.
    pub fn record_cycle(&self, duration: Duration) {
        self.cycle_duration.observe(duration.as_secs_f64());
    }

    /// Refresh queue depth and online worker gauges.
    pub fn set_gauges(&self, queue_depth: u64, online_workers: u64) {
        self.queue_depth.set(queue_depth as i64);
        self.online_workers.set(online_workers as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_allocation_splits_by_reason() {
        let metrics = SchedulerMetrics::new().unwrap();

        metrics.record_allocation(&AllocationOutcome::Assigned { worker_id: 1 });
        metrics.record_allocation(&AllocationOutcome::NoCapacity);
        metrics.record_allocation(&AllocationOutcome::NoCapacity);
        metrics.record_allocation(&AllocationOutcome::NoWorkersOnline);

        assert_eq!(metrics.jobs_scheduled.get(), 1);
        assert_eq!(
            metrics
                .allocation_rejections
                .with_label_values(&[reasons::NO_CAPACITY])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .allocation_rejections
                .with_label_values(&[reasons::NO_WORKERS_ONLINE])
                .get(),
            1
        );
    }

    #[test]
    fn test_gauges_and_pushes() {
        let metrics = SchedulerMetrics::new().unwrap();

        metrics.set_gauges(7, 2);
        metrics.record_push(true);
        metrics.record_push(false);

        assert_eq!(metrics.queue_depth.get(), 7);
        assert_eq!(metrics.online_workers.get(), 2);
        assert_eq!(
            metrics
                .job_pushes
                .with_label_values(&[push_outcomes::FAILED])
                .get(),
            1
        );
    }
}
