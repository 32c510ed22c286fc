//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics used by the scheduler. They are
//! registered with a registry owned by [`SchedulerMetrics`] instead of a
//! process-wide one, so every orchestrator (and every test) gets its own.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metric name prefix.
pub const NAMESPACE: &str = "fuzz_scheduler";

/// Rejection reason label values.
pub mod reasons {
    pub const NO_WORKERS_ONLINE: &str = "no_workers_online";
    pub const NO_CAPACITY: &str = "no_capacity";
    pub const LOST: &str = "lost";
}

/// Push outcome label values.
pub mod push_outcomes {
    pub const ACK: &str = "ack";
    pub const FAILED: &str = "failed";
}

/// Scheduler metrics and the registry they are registered with.
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    /// Jobs assigned to a worker.
    pub(crate) jobs_scheduled: IntCounter,
    /// Allocation attempts that left the job queued, labeled by reason.
    pub(crate) allocation_rejections: IntCounterVec,
    /// Scheduling passes that found the queue empty.
    pub(crate) empty_queue_cycles: IntCounter,
    /// Workers marked offline for a stale heartbeat.
    pub(crate) workers_marked_offline: IntCounter,
    /// Orphaned jobs returned to the queue.
    pub(crate) jobs_requeued: IntCounter,
    /// Jobs failed because their retry budget ran out.
    pub(crate) retries_exhausted: IntCounter,
    /// Jobs failed for missing their deadline.
    pub(crate) deadlines_missed: IntCounter,
    /// Job pushes to workers, labeled by outcome.
    pub(crate) job_pushes: IntCounterVec,
    /// Crash records stored from worker reports.
    pub(crate) crashes_ingested: IntCounter,
    /// Current number of queued jobs.
    pub(crate) queue_depth: IntGauge,
    /// Current number of online workers.
    pub(crate) online_workers: IntGauge,
    /// Duration of a full scheduler cycle.
    pub(crate) cycle_duration: Histogram,
}

impl SchedulerMetrics {
    /// Creates all metrics and registers them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_scheduled = IntCounter::with_opts(
            Opts::new("jobs_scheduled_total", "Jobs assigned to a worker").namespace(NAMESPACE),
        )?;

        let allocation_rejections = IntCounterVec::new(
            Opts::new(
                "allocation_rejections_total",
                "Allocation attempts that left the job queued",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;

        let empty_queue_cycles = IntCounter::with_opts(
            Opts::new(
                "empty_queue_cycles_total",
                "Scheduling passes that found the queue empty",
            )
            .namespace(NAMESPACE),
        )?;

        let workers_marked_offline = IntCounter::with_opts(
            Opts::new(
                "workers_marked_offline_total",
                "Workers marked offline for a stale heartbeat",
            )
            .namespace(NAMESPACE),
        )?;

        let jobs_requeued = IntCounter::with_opts(
            Opts::new("jobs_requeued_total", "Orphaned jobs returned to the queue")
                .namespace(NAMESPACE),
        )?;

        let retries_exhausted = IntCounter::with_opts(
            Opts::new(
                "retries_exhausted_total",
                "Jobs failed because their retry budget ran out",
            )
            .namespace(NAMESPACE),
        )?;

        let deadlines_missed = IntCounter::with_opts(
            Opts::new("deadlines_missed_total", "Jobs failed for missing their deadline")
                .namespace(NAMESPACE),
        )?;

        let job_pushes = IntCounterVec::new(
            Opts::new("job_pushes_total", "Job pushes to workers").namespace(NAMESPACE),
            &["outcome"],
        )?;

        let crashes_ingested = IntCounter::with_opts(
            Opts::new("crashes_ingested_total", "Crash records stored from worker reports")
                .namespace(NAMESPACE),
        )?;

        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Number of queued jobs").namespace(NAMESPACE),
        )?;

        let online_workers = IntGauge::with_opts(
            Opts::new("online_workers", "Number of online workers").namespace(NAMESPACE),
        )?;

        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Duration of a full scheduler cycle in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        // Register all metrics with the registry
        registry.register(Box::new(jobs_scheduled.clone()))?;
        registry.register(Box::new(allocation_rejections.clone()))?;
        registry.register(Box::new(empty_queue_cycles.clone()))?;
        registry.register(Box::new(workers_marked_offline.clone()))?;
        registry.register(Box::new(jobs_requeued.clone()))?;
        registry.register(Box::new(retries_exhausted.clone()))?;
        registry.register(Box::new(deadlines_missed.clone()))?;
        registry.register(Box::new(job_pushes.clone()))?;
        registry.register(Box::new(crashes_ingested.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(online_workers.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        tracing::debug!("Scheduler metrics registered");

        Ok(Self {
            registry,
            jobs_scheduled,
            allocation_rejections,
            empty_queue_cycles,
            workers_marked_offline,
            jobs_requeued,
            retries_exhausted,
            deadlines_missed,
            job_pushes,
            crashes_ingested,
            queue_depth,
            online_workers,
            cycle_duration,
        })
    }

    /// Returns the registry the metrics are registered with.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all registered metrics in Prometheus text format.
    ///
    /// Encoding failures are reported inline as a comment line rather than an
    /// error, so the output is always scrapeable text.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics")
            .field("jobs_scheduled", &self.jobs_scheduled.get())
            .field("queue_depth", &self.queue_depth.get())
            .field("online_workers", &self.online_workers.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = SchedulerMetrics::new().unwrap();
        let b = SchedulerMetrics::new().unwrap();

        a.jobs_scheduled.inc();

        assert_eq!(a.jobs_scheduled.get(), 1);
        assert_eq!(b.jobs_scheduled.get(), 0);
    }

    #[test]
    fn test_export_contains_metric_names() {
        let metrics = SchedulerMetrics::new().unwrap();
        metrics.jobs_scheduled.inc();
        metrics
            .allocation_rejections
            .with_label_values(&[reasons::NO_CAPACITY])
            .inc();

        let text = metrics.export();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("fuzz_scheduler_jobs_scheduled_total 1"));
        assert!(text.contains("reason=\"no_capacity\""));
    }
}
