//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for scheduling
//! operations: allocation outcomes, worker liveness, retries, deadlines, job
//! pushes and crash ingestion.
//!
//! # Example
//!
//! ```ignore
//! use fuzz_scheduler::metrics::SchedulerMetrics;
//!
//! let metrics = SchedulerMetrics::new()?;
//! metrics.set_gauges(12, 3);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = metrics.export();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::prometheus::{push_outcomes, reasons, SchedulerMetrics, NAMESPACE};
