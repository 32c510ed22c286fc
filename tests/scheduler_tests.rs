//! Integration tests for the scheduler store and scheduling passes.
//!
//! Every test runs against a fresh SQLite file in a temporary directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fuzz_scheduler::config::SchedulerConfig;
use fuzz_scheduler::metrics::SchedulerMetrics;
use fuzz_scheduler::scheduler::{
    AllocationOutcome, AllocationStrategy, Capabilities, CurrentLoad, DeadlineEnforcer,
    JobScheduler, JobStatus, NewJob, ResourceRequirements, RetryOutcome, SchedulerOrchestrator,
    StopReason, WorkerHealthMonitor, WorkerRegistration, WorkerStatus, MISSED_DEADLINE,
};
use fuzz_scheduler::storage::{Database, DatabaseError, NewCrash};
use tempfile::TempDir;

async fn open_db() -> (TempDir, Arc<Database>) {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::connect(dir.path().join("scheduler.db"))
        .await
        .expect("open database");
    (dir, Arc::new(db))
}

fn job(name: &str) -> NewJob {
    NewJob::new(name, serde_json::json!({"fuzzer": name}))
}

fn scheduler(db: &Arc<Database>, strategy: AllocationStrategy) -> JobScheduler {
    JobScheduler::new(
        Arc::clone(db),
        strategy,
        SchedulerMetrics::new().expect("metrics"),
    )
}

async fn worker(db: &Database, ip: &str, caps: Capabilities) -> i64 {
    db.register_worker(WorkerRegistration::new(ip).with_capabilities(caps))
        .await
        .expect("register worker")
}

/// Moves a worker's last heartbeat into the past.
async fn age_heartbeat(db: &Database, worker_id: i64, by: Duration) {
    let past = Utc::now().timestamp_millis() - by.as_millis() as i64;
    sqlx::query("UPDATE workers SET last_heartbeat_ms = ?1 WHERE worker_id = ?2")
        .bind(past)
        .bind(worker_id)
        .execute(db.pool())
        .await
        .expect("age heartbeat");
}

// ============================================================================
// Submission and queueing
// ============================================================================

#[tokio::test]
async fn test_job_without_dependencies_is_queued_immediately() {
    let (_dir, db) = open_db().await;

    let id = db.add_job(job("a")).await.unwrap();

    let stored = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(db.is_queued(id).await.unwrap());
    assert_eq!(db.get_queue_length().await.unwrap(), 1);
}

#[tokio::test]
async fn test_dependent_job_enqueued_exactly_once_after_dependency_completes() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(8.0, 16.0, 4)).await;

    let first = db.add_job(job("first")).await.unwrap();
    let second = db.add_job(job("second")).await.unwrap();
    let child = db
        .add_job(job("child").with_dependencies(vec![first, second]))
        .await
        .unwrap();
    assert!(!db.is_queued(child).await.unwrap());

    for id in [first, second] {
        assert!(db.assign_job_to_worker(id, w).await.unwrap());
        db.update_job_status(id, JobStatus::Running, None)
            .await
            .unwrap();
    }

    db.update_job_status(first, JobStatus::Completed, None)
        .await
        .unwrap();
    assert!(
        !db.is_queued(child).await.unwrap(),
        "one dependency still running"
    );

    db.update_job_status(second, JobStatus::Completed, None)
        .await
        .unwrap();
    assert!(db.is_queued(child).await.unwrap());
    assert_eq!(db.get_queue_length().await.unwrap(), 1);

    // A repeated completion is a no-op and must not enqueue the child again.
    assert!(db
        .update_job_status(second, JobStatus::Completed, None)
        .await
        .unwrap()
        .is_none());
    assert_eq!(db.get_queue_length().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let (_dir, db) = open_db().await;

    let err = db
        .add_job(job("orphan").with_dependencies(vec![42]))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidInput(_)));
    assert!(db.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_orders_by_priority_then_submission() {
    let (_dir, db) = open_db().await;

    let a = db.add_job(job("a").with_priority(10)).await.unwrap();
    let b = db.add_job(job("b").with_priority(50)).await.unwrap();
    let c = db.add_job(job("c").with_priority(90)).await.unwrap();
    let b2 = db.add_job(job("b2").with_priority(50)).await.unwrap();

    let w = worker(&db, "10.0.0.1", Capabilities::new(8.0, 16.0, 8)).await;

    let mut order = Vec::new();
    while let Some(next) = db.get_next_job_from_queue().await.unwrap() {
        order.push(next.job_id);
        assert!(db.assign_job_to_worker(next.job_id, w).await.unwrap());
    }
    assert_eq!(order, vec![c, b, b2, a]);
}

#[tokio::test]
async fn test_priority_out_of_range_is_rejected() {
    let (_dir, db) = open_db().await;

    let err = db.add_job(job("loud").with_priority(101)).await.unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidInput(_)));
}

// ============================================================================
// Allocation
// ============================================================================

#[tokio::test]
async fn test_resource_filter_checks_each_dimension() {
    let (_dir, db) = open_db().await;
    let full = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 2)).await;
    db.update_worker_heartbeat(full, Some(CurrentLoad::new(0.0, 0.0, 2)))
        .await
        .unwrap();

    let sched = scheduler(&db, AllocationStrategy::LoadAware);

    let needs_vm = db
        .add_job(job("needs-vm").with_requirements(ResourceRequirements::new().with_vms(1)))
        .await
        .unwrap();
    let head = db.get_next_job_from_queue().await.unwrap().unwrap();
    assert_eq!(head.job_id, needs_vm);
    assert_eq!(
        sched.allocate(&head).await.unwrap(),
        AllocationOutcome::NoCapacity
    );

    // A job that only asks for CPU fits: the VM dimension imposes nothing.
    let cpu_only = db
        .add_job(
            job("cpu-only")
                .with_priority(90)
                .with_requirements(ResourceRequirements::new().with_cpu(2.0)),
        )
        .await
        .unwrap();
    let head = db.get_next_job_from_queue().await.unwrap().unwrap();
    assert_eq!(head.job_id, cpu_only);
    assert_eq!(
        sched.allocate(&head).await.unwrap(),
        AllocationOutcome::Assigned { worker_id: full }
    );
}

#[tokio::test]
async fn test_load_aware_prefers_least_loaded_and_first_on_tie() {
    let (_dir, db) = open_db().await;
    let busy = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let idle_a = worker(&db, "10.0.0.2", Capabilities::new(4.0, 8.0, 4)).await;
    let idle_b = worker(&db, "10.0.0.3", Capabilities::new(4.0, 8.0, 4)).await;
    db.update_worker_heartbeat(busy, Some(CurrentLoad::new(1.0, 1.0, 2)))
        .await
        .unwrap();
    db.update_worker_heartbeat(idle_b, Some(CurrentLoad::new(0.0, 0.0, 0)))
        .await
        .unwrap();

    let sched = scheduler(&db, AllocationStrategy::LoadAware);
    db.add_job(job("a")).await.unwrap();
    let head = db.get_next_job_from_queue().await.unwrap().unwrap();

    assert_eq!(
        sched.allocate(&head).await.unwrap(),
        AllocationOutcome::Assigned { worker_id: idle_a }
    );
}

#[tokio::test]
async fn test_load_aware_equal_vm_load_prefers_lower_cpu() {
    let (_dir, db) = open_db().await;
    let hot = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let cool = worker(&db, "10.0.0.2", Capabilities::new(4.0, 8.0, 4)).await;
    db.update_worker_heartbeat(hot, Some(CurrentLoad::new(3.5, 2.0, 1)))
        .await
        .unwrap();
    db.update_worker_heartbeat(cool, Some(CurrentLoad::new(0.5, 2.0, 1)))
        .await
        .unwrap();

    let sched = scheduler(&db, AllocationStrategy::LoadAware);
    db.add_job(job("a")).await.unwrap();
    let head = db.get_next_job_from_queue().await.unwrap().unwrap();

    assert_eq!(
        sched.allocate(&head).await.unwrap(),
        AllocationOutcome::Assigned { worker_id: cool }
    );
}

#[tokio::test]
async fn test_round_robin_rotates_through_candidates() {
    let (_dir, db) = open_db().await;
    let w1 = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let w2 = worker(&db, "10.0.0.2", Capabilities::new(4.0, 8.0, 4)).await;

    let sched = scheduler(&db, AllocationStrategy::RoundRobin);
    for name in ["a", "b", "c"] {
        db.add_job(job(name)).await.unwrap();
    }

    let mut placed = Vec::new();
    while let Some(head) = db.get_next_job_from_queue().await.unwrap() {
        placed.push(sched.allocate(&head).await.unwrap().worker_id().unwrap());
    }
    assert_eq!(placed, vec![w1, w2, w1]);
}

#[tokio::test]
async fn test_job_is_never_assigned_twice() {
    let (_dir, db) = open_db().await;
    let w1 = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let w2 = worker(&db, "10.0.0.2", Capabilities::new(4.0, 8.0, 4)).await;
    let id = db.add_job(job("a")).await.unwrap();

    let (first, second) = tokio::join!(
        db.assign_job_to_worker(id, w1),
        db.assign_job_to_worker(id, w2)
    );
    assert_ne!(first.unwrap(), second.unwrap());
    assert_eq!(db.count_active_assignments(id).await.unwrap(), 1);
    assert_eq!(
        db.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Assigned
    );
}

#[tokio::test]
async fn test_cycle_does_not_hand_out_a_slot_twice() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 1)).await;
    db.update_worker_heartbeat(w, Some(CurrentLoad::new(0.0, 0.0, 0)))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let id = db
            .add_job(job(name).with_requirements(ResourceRequirements::new().with_vms(1)))
            .await
            .unwrap();
        ids.push(id);
    }

    let orchestrator =
        SchedulerOrchestrator::new(Arc::clone(&db), &SchedulerConfig::default()).unwrap();
    let stats = orchestrator.run_cycle().await.unwrap();
    assert_eq!(stats.scheduled_jobs, 1);
    assert_eq!(stats.stop_reason, StopReason::NoSuitableWorker);
    assert_eq!(db.get_queue_length().await.unwrap(), 2);

    // Still reserved on the next pass, before the worker reports any load.
    let stats = orchestrator.run_cycle().await.unwrap();
    assert_eq!(stats.scheduled_jobs, 0);

    // Once running, the reported load takes over from the reservation.
    db.update_job_status(ids[0], JobStatus::Running, None)
        .await
        .unwrap();
    db.update_worker_heartbeat(w, Some(CurrentLoad::new(1.0, 1.0, 1)))
        .await
        .unwrap();
    assert_eq!(orchestrator.run_cycle().await.unwrap().scheduled_jobs, 0);

    db.update_job_status(ids[0], JobStatus::Completed, None)
        .await
        .unwrap();
    db.update_worker_heartbeat(w, Some(CurrentLoad::new(0.0, 0.0, 0)))
        .await
        .unwrap();
    assert_eq!(orchestrator.run_cycle().await.unwrap().scheduled_jobs, 1);
    assert_eq!(
        db.get_job(ids[1]).await.unwrap().unwrap().status,
        JobStatus::Assigned
    );
}

#[tokio::test]
async fn test_load_aware_spreads_jobs_within_one_pass() {
    let (_dir, db) = open_db().await;
    let w1 = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 2)).await;
    let w2 = worker(&db, "10.0.0.2", Capabilities::new(4.0, 8.0, 2)).await;

    let mut ids = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let id = db
            .add_job(job(name).with_requirements(ResourceRequirements::new().with_vms(1)))
            .await
            .unwrap();
        ids.push(id);
    }

    let sched = scheduler(&db, AllocationStrategy::LoadAware);
    let report = sched.run_scheduling_cycle(10).await.unwrap();
    assert_eq!(report.scheduled, 4);
    assert_eq!(report.stop_reason, StopReason::QueueEmpty);

    let mut placed = Vec::new();
    for id in &ids {
        placed.push(db.get_job(*id).await.unwrap().unwrap().assigned_worker_id);
    }
    assert_eq!(placed, vec![Some(w1), Some(w2), Some(w1), Some(w2)]);

    let workers = db.get_available_workers(&[]).await.unwrap();
    assert!(workers.iter().all(|w| w.reserved.used_vms == 2 && w.free_vms() == 0));
}

#[tokio::test]
async fn test_assignment_refused_when_worker_is_full() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 1)).await;
    let first = db
        .add_job(job("first").with_requirements(ResourceRequirements::new().with_vms(1)))
        .await
        .unwrap();
    let second = db
        .add_job(
            job("second")
                .with_requirements(ResourceRequirements::new().with_cpu(1.0).with_vms(1)),
        )
        .await
        .unwrap();
    let untracked = db.add_job(job("untracked")).await.unwrap();

    assert!(db.assign_job_to_worker(first, w).await.unwrap());
    assert!(!db.assign_job_to_worker(second, w).await.unwrap());
    assert!(db.is_queued(second).await.unwrap());
    assert_eq!(
        db.get_job(second).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    // A job that declares nothing is not held back by reservations.
    assert!(db.assign_job_to_worker(untracked, w).await.unwrap());

    // Releasing the first job frees its slot.
    db.increment_job_retry(first).await.unwrap();
    assert!(db.assign_job_to_worker(second, w).await.unwrap());
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_retry_budget_exhausts_then_ignores_further_calls() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let id = db.add_job(job("flaky").with_max_retries(3)).await.unwrap();

    for expected in 1..=2u32 {
        assert!(db.assign_job_to_worker(id, w).await.unwrap());
        let outcome = db.increment_job_retry(id).await.unwrap();
        assert_eq!(
            outcome,
            Some(RetryOutcome::Requeued {
                retry_count: expected
            })
        );
        let stored = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.assigned_worker_id, None);
        assert_eq!(stored.remaining_retries(), 3 - expected);
        assert!(db.is_queued(id).await.unwrap());
    }

    assert!(db.assign_job_to_worker(id, w).await.unwrap());
    assert_eq!(
        db.increment_job_retry(id).await.unwrap(),
        Some(RetryOutcome::Exhausted { max_retries: 3 })
    );

    let stored = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("Max retries (3) exceeded")
    );
    assert!(stored.ended_at.is_some());
    assert!(!db.is_queued(id).await.unwrap());
    assert_eq!(db.count_active_assignments(id).await.unwrap(), 0);

    // Fourth call: terminal job, nothing changes.
    assert_eq!(db.increment_job_retry(id).await.unwrap(), None);
    let again = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(again.retry_count, 3);
    assert_eq!(again.status, JobStatus::Failed);

    let history = db.get_job_history(id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|h| h.status == JobStatus::Failed));
}

#[tokio::test]
async fn test_requeued_job_goes_behind_later_submissions() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let a = db.add_job(job("a")).await.unwrap();
    let b = db.add_job(job("b")).await.unwrap();

    assert_eq!(db.get_next_job_from_queue().await.unwrap().unwrap().job_id, a);
    assert!(db.assign_job_to_worker(a, w).await.unwrap());
    db.increment_job_retry(a).await.unwrap();

    let head = db.get_next_job_from_queue().await.unwrap().unwrap();
    assert_eq!(head.job_id, b);
    assert_eq!(head.priority, 50);
    assert!(db.assign_job_to_worker(b, w).await.unwrap());
    assert_eq!(db.get_next_job_from_queue().await.unwrap().unwrap().job_id, a);
}

// ============================================================================
// Workers and health
// ============================================================================

#[tokio::test]
async fn test_registration_is_idempotent_per_ip() {
    let (_dir, db) = open_db().await;

    let first = db
        .register_worker(
            WorkerRegistration::new("10.0.0.9")
                .with_hostname("fuzz-9")
                .with_capabilities(Capabilities::new(4.0, 8.0, 2)),
        )
        .await
        .unwrap();
    let second = db
        .register_worker(WorkerRegistration::new("10.0.0.9").with_tags(["gpu"]))
        .await
        .unwrap();

    assert_eq!(first, second);
    let workers = db.list_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].hostname.as_deref(), Some("fuzz-9"));
    assert_eq!(workers[0].capabilities, Capabilities::new(4.0, 8.0, 2));
    assert_eq!(workers[0].tags, vec!["gpu".to_string()]);
    assert_eq!(workers[0].status, WorkerStatus::Online);
}

#[tokio::test]
async fn test_stale_worker_goes_offline_and_its_job_is_requeued() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let id = db.add_job(job("a")).await.unwrap();
    assert!(db.assign_job_to_worker(id, w).await.unwrap());
    db.update_job_status(id, JobStatus::Running, None)
        .await
        .unwrap();

    age_heartbeat(&db, w, Duration::from_secs(120)).await;

    let monitor = WorkerHealthMonitor::new(
        Arc::clone(&db),
        Duration::from_secs(90),
        SchedulerMetrics::new().unwrap(),
    );
    let report = monitor.check_worker_health().await.unwrap();
    assert_eq!(report.offline_workers, 1);
    assert_eq!(report.requeued_jobs, 1);
    assert_eq!(report.failed_jobs, 0);

    let worker = db.get_worker(w).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);

    let stored = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(db.is_queued(id).await.unwrap());
    assert_eq!(db.count_active_assignments(id).await.unwrap(), 0);

    // A heartbeat brings the worker back online.
    assert!(db.update_worker_heartbeat(w, None).await.unwrap());
    let worker = db.get_worker(w).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
}

#[tokio::test]
async fn test_fresh_worker_is_not_marked_offline() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    age_heartbeat(&db, w, Duration::from_secs(30)).await;

    let marked = db
        .mark_stale_workers_offline(Duration::from_secs(90))
        .await
        .unwrap();
    assert_eq!(marked, 0);
}

// ============================================================================
// Deadlines and dependency failure
// ============================================================================

#[tokio::test]
async fn test_running_job_past_deadline_fails() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let deadline = Utc::now() + chrono::Duration::seconds(60);
    let id = db
        .add_job(job("timed").with_deadline(deadline))
        .await
        .unwrap();
    assert!(db.assign_job_to_worker(id, w).await.unwrap());
    db.update_job_status(id, JobStatus::Running, None)
        .await
        .unwrap();

    let enforcer = DeadlineEnforcer::new(Arc::clone(&db), SchedulerMetrics::new().unwrap());
    assert_eq!(enforcer.check_deadlines().await.unwrap(), 0);

    let later = deadline + chrono::Duration::seconds(1);
    assert_eq!(enforcer.check_deadlines_at(later).await.unwrap(), 1);

    let stored = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some(MISSED_DEADLINE));
    assert_eq!(db.count_active_assignments(id).await.unwrap(), 0);

    // Terminal jobs are not reported twice.
    assert_eq!(enforcer.check_deadlines_at(later).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_dependency_cascades_to_dependents() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;

    let root = db.add_job(job("root").with_max_retries(1)).await.unwrap();
    let child = db
        .add_job(job("child").with_dependencies(vec![root]))
        .await
        .unwrap();
    let grandchild = db
        .add_job(job("grandchild").with_dependencies(vec![child]))
        .await
        .unwrap();

    assert!(db.assign_job_to_worker(root, w).await.unwrap());
    db.update_job_status(root, JobStatus::Failed, Some("boom"))
        .await
        .unwrap();

    let child_job = db.get_job(child).await.unwrap().unwrap();
    assert_eq!(child_job.status, JobStatus::Failed);
    assert_eq!(
        child_job.error_message,
        Some(format!("Dependency {} did not complete", root))
    );
    let grandchild_job = db.get_job(grandchild).await.unwrap().unwrap();
    assert_eq!(grandchild_job.status, JobStatus::Failed);
    assert_eq!(db.get_queue_length().await.unwrap(), 0);

    // Late submissions against the failed root fail at once.
    let late = db
        .add_job(job("late").with_dependencies(vec![root]))
        .await
        .unwrap();
    assert_eq!(
        db.get_job(late).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn test_invalid_transition_is_rejected() {
    let (_dir, db) = open_db().await;
    let id = db.add_job(job("a")).await.unwrap();

    let err = db
        .update_job_status(id, JobStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DatabaseError::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Running,
            ..
        }
    ));
}

// ============================================================================
// Full cycles
// ============================================================================

#[tokio::test]
async fn test_cycle_recovers_jobs_before_scheduling() {
    let (_dir, db) = open_db().await;
    let dead = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let id = db.add_job(job("a")).await.unwrap();
    assert!(db.assign_job_to_worker(id, dead).await.unwrap());

    let alive = worker(&db, "10.0.0.2", Capabilities::new(4.0, 8.0, 4)).await;
    age_heartbeat(&db, dead, Duration::from_secs(600)).await;

    let orchestrator =
        SchedulerOrchestrator::new(Arc::clone(&db), &SchedulerConfig::default()).unwrap();
    let stats = orchestrator.run_cycle().await.unwrap();

    assert_eq!(stats.offline_workers, 1);
    assert_eq!(stats.requeued_jobs, 1);
    assert_eq!(stats.scheduled_jobs, 1);
    assert_eq!(stats.stop_reason, StopReason::QueueEmpty);

    let stored = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Assigned);
    assert_eq!(stored.assigned_worker_id, Some(alive));
    assert_eq!(db.count_active_assignments(id).await.unwrap(), 1);

    // Nothing left to do on a second cycle.
    let stats = orchestrator.run_cycle().await.unwrap();
    assert_eq!(stats.scheduled_jobs, 0);
    assert_eq!(db.count_active_assignments(id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_cycle_stops_when_head_cannot_be_placed() {
    let (_dir, db) = open_db().await;
    worker(&db, "10.0.0.1", Capabilities::new(2.0, 4.0, 1)).await;

    let big = db
        .add_job(
            job("big")
                .with_priority(90)
                .with_requirements(ResourceRequirements::new().with_cpu(16.0)),
        )
        .await
        .unwrap();
    db.add_job(job("small")).await.unwrap();

    let orchestrator =
        SchedulerOrchestrator::new(Arc::clone(&db), &SchedulerConfig::default()).unwrap();
    let stats = orchestrator.run_cycle().await.unwrap();

    assert_eq!(stats.scheduled_jobs, 0);
    assert_eq!(stats.stop_reason, StopReason::NoSuitableWorker);
    assert!(db.is_queued(big).await.unwrap());
    assert_eq!(db.get_queue_length().await.unwrap(), 2);
}

#[tokio::test]
async fn test_status_counts_jobs_workers_and_crashes() {
    let (_dir, db) = open_db().await;
    let w = worker(&db, "10.0.0.1", Capabilities::new(4.0, 8.0, 4)).await;
    let id = db.add_job(job("a")).await.unwrap();
    db.add_job(job("b")).await.unwrap();
    assert!(db.assign_job_to_worker(id, w).await.unwrap());

    let crash = NewCrash {
        crash_type: Some("SIGSEGV".to_string()),
        ..NewCrash::default()
    };
    assert!(db.add_crash(id, w, &crash).await.unwrap().is_some());

    let orchestrator =
        SchedulerOrchestrator::new(Arc::clone(&db), &SchedulerConfig::default()).unwrap();
    let status = orchestrator.get_status().await.unwrap();

    assert_eq!(status.jobs_with("assigned"), 1);
    assert_eq!(status.jobs_with("pending"), 1);
    assert_eq!(status.workers_with("online"), 1);
    assert_eq!(status.queue_length, 1);
    assert_eq!(status.crashes, 1);
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("persist.db");

    let id = {
        let db = Database::connect(&path).await.unwrap();
        let id = db.add_job(job("durable").with_priority(70)).await.unwrap();
        db.close().await;
        id
    };

    let db = Database::connect(&path).await.unwrap();
    let stored = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.name, "durable");
    assert_eq!(stored.priority, 70);
    assert!(db.is_queued(id).await.unwrap());
}
