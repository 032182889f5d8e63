//! End-to-end flows over a scripted peer: forwarding, retry, breaker
//! behavior, cancellation, and crash recovery.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use client::StudyArrival;
use dimse::{tags, Dataset};
use models::{
    JobKind, JobRecord, JobStatus, MatchField, MatchOp, NodeStatus, RoutingAction,
    RoutingCondition, RoutingRule,
};
use resilience::BreakerState;
use support::{eventually, Harness};

fn forward_job(destination: &str, study_uid: &str, max_retries: u32) -> JobRecord {
    let mut job = JobRecord::new(JobKind::Forward);
    job.destination_node_id = Some(destination.to_string());
    job.study_uid = study_uid.to_string();
    job.max_retries = max_retries;
    job
}

#[tokio::test]
async fn forwarding_a_matching_study_stores_it_on_the_peer() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;
    h.seed_local_study("1.2.3", "P-100", "CT", 1);

    let mut rule = RoutingRule::new("r-ct", "CT to peer-1");
    rule.conditions.push(RoutingCondition {
        field: MatchField::Modality,
        op: MatchOp::Equals,
        value: "CT".to_string(),
    });
    rule.actions.push(RoutingAction {
        destinations: vec!["peer-1".to_string()],
    });
    h.system.routing.create_rule(rule).await.unwrap();

    h.system.start().await.unwrap();

    let arrival = StudyArrival {
        dataset: Dataset::new()
            .with(tags::STUDY_INSTANCE_UID, "1.2.3")
            .with(tags::PATIENT_ID, "P-100")
            .with(tags::MODALITY, "CT"),
        calling_ae: "MODALITY7".to_string(),
    };
    let submitted = h.system.routing.on_study(&arrival).await.unwrap();
    assert_eq!(submitted.len(), 1);

    let job = h
        .system
        .jobs
        .wait(submitted[0], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.kind, JobKind::Forward);
    assert_eq!(job.destination_node_id.as_deref(), Some("peer-1"));
    assert_eq!(job.progress.items_done, 1);
    assert_eq!(job.progress.items_total, 1);
    assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    assert!(job.started_at.unwrap() >= job.created_at);

    assert_eq!(h.peer.store_calls(), 1);
    let stored = h.peer.stored();
    assert_eq!(stored[0].study_uid(), Some("1.2.3"));

    let rules = h.system.routing.list_rules().await.unwrap();
    assert_eq!(rules[0].triggered_count, 1);
    assert_eq!(rules[0].success_count, 1);
    assert!(rules[0].last_triggered.is_some());

    h.system.shutdown().await;
}

#[tokio::test]
async fn transient_store_failures_retry_until_success() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;
    h.seed_local_study("1.2.3", "P-100", "CT", 1);
    h.peer
        .fail_stores(dimse::Error::Timeout("write".to_string()), 2);

    h.system.start().await.unwrap();
    let begun = Instant::now();
    let job_id = h
        .system
        .jobs
        .submit(forward_job("peer-1", "1.2.3", 3))
        .await
        .unwrap();

    let job = h
        .system
        .jobs
        .wait(job_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    // Exponential backoff from 10 ms: 10 + 20 before the third attempt.
    assert!(begun.elapsed() >= Duration::from_millis(30));
    assert_eq!(h.peer.store_calls(), 3);

    // Two failures stay below the default threshold of five.
    let stats = h.system.jobs.breaker_stats("peer-1").unwrap();
    assert_eq!(stats.state, BreakerState::Closed);
    assert_eq!(stats.total_failures, 2);

    h.system.shutdown().await;
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_recovers() {
    let h = Harness::new(|config| {
        config.jobs.worker_count = 1;
        config.jobs.breaker.failure_threshold = 3;
        config.jobs.breaker.success_threshold = 2;
        config.jobs.breaker.open_duration = Duration::from_millis(100);
    })
    .await;
    h.register_peer("peer-1", "PEER1").await;
    h.seed_local_study("1.2.3", "P-100", "CT", 1);
    h.peer
        .fail_stores(dimse::Error::Timeout("write".to_string()), 3);

    h.system.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            h.system
                .jobs
                .submit(forward_job("peer-1", "1.2.3", 0))
                .await
                .unwrap(),
        );
    }

    let mut outcomes = Vec::new();
    for id in &ids {
        outcomes.push(h.system.jobs.wait(*id, Duration::from_secs(5)).await.unwrap());
    }
    assert!(outcomes.iter().all(|j| j.status == JobStatus::Failed));

    // Jobs 1-3 hit the wire; 4 and 5 failed fast on the open circuit.
    assert_eq!(h.peer.store_calls(), 3);
    for job in &outcomes[..3] {
        assert!(job.error_message.as_deref().unwrap().contains("timed out"));
    }
    for job in &outcomes[3..] {
        assert!(job.error_message.as_deref().unwrap().contains("circuit open"));
    }
    assert_eq!(
        h.system.jobs.breaker_stats("peer-1").unwrap().state,
        BreakerState::Open
    );

    // After the open duration the breaker probes; two successes close it.
    tokio::time::sleep(Duration::from_millis(120)).await;
    for _ in 0..2 {
        let id = h
            .system
            .jobs
            .submit(forward_job("peer-1", "1.2.3", 0))
            .await
            .unwrap();
        let job = h.system.jobs.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert_eq!(
        h.system.jobs.breaker_stats("peer-1").unwrap().state,
        BreakerState::Closed
    );

    h.system.shutdown().await;
}

#[tokio::test]
async fn cancellation_stops_a_retrieve_between_items() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;
    h.peer.set_move_items(
        (0..100)
            .map(|i| Dataset::new().with(tags::SOP_INSTANCE_UID, format!("1.2.3.{i}")))
            .collect(),
    );
    h.peer.set_move_item_delay(Duration::from_millis(5));

    h.system.start().await.unwrap();

    let mut job = JobRecord::new(JobKind::Retrieve);
    job.source_node_id = Some("peer-1".to_string());
    job.study_uid = "1.2.3".to_string();
    let job_id = h.system.jobs.submit(job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.system.jobs.cancel(job_id).await.unwrap();

    let job = h
        .system
        .jobs
        .wait(job_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.completed_at.is_some());
    assert!(job.progress.items_done >= 1);
    assert!(job.progress.items_done < 100);

    h.system.shutdown().await;
}

#[tokio::test]
async fn recovery_requeues_interrupted_jobs() {
    // Phase 1: a system that never starts workers, so submissions stay
    // queued; two rows are then forced to running and one back to
    // pending, simulating a crash mid-flight.
    let h = Harness::new(|config| {
        config.jobs.worker_count = 0;
    })
    .await;
    h.register_peer("peer-1", "PEER1").await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let mut job = JobRecord::new(JobKind::Echo);
        job.destination_node_id = Some("peer-1".to_string());
        ids.push(h.system.jobs.submit(job).await.unwrap());
    }
    for (id, status) in [
        (ids[0], "running"),
        (ids[1], "running"),
        (ids[2], "pending"),
    ] {
        sqlx::query("UPDATE jobs SET status = ?2, retry_count = 1 WHERE job_id = ?1")
            .bind(id.to_string())
            .bind(status)
            .execute(h.store.pool())
            .await
            .unwrap();
    }
    h.system.shutdown().await;

    // Phase 2: recovery without workers makes the reset observable.
    let observer = client::System::new(
        h.store.clone(),
        Arc::new(h.peer.clone()),
        h.archive.clone(),
        {
            let mut config = client::SystemConfig::default();
            config.jobs.worker_count = 0;
            config
        },
    );
    observer.start().await.unwrap();
    for id in &ids {
        let job = observer.jobs.get(*id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued, "{id} should be re-queued");
        assert_eq!(job.retry_count, 1, "retry count must survive recovery");
    }
    observer.shutdown().await;

    // Phase 3: a full system drains all three.
    let worker = client::System::new(
        h.store.clone(),
        Arc::new(h.peer.clone()),
        h.archive.clone(),
        client::SystemConfig::default(),
    );
    worker.start().await.unwrap();
    for id in &ids {
        let job = worker.jobs.wait(*id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
    }
    worker.shutdown().await;
}

#[tokio::test]
async fn pause_yields_at_a_checkpoint_and_resume_finishes() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;
    h.peer.set_move_items(
        (0..50)
            .map(|i| Dataset::new().with(tags::SOP_INSTANCE_UID, format!("1.2.3.{i}")))
            .collect(),
    );
    h.peer.set_move_item_delay(Duration::from_millis(5));

    h.system.start().await.unwrap();

    let mut job = JobRecord::new(JobKind::Retrieve);
    job.source_node_id = Some("peer-1".to_string());
    job.study_uid = "1.2.3".to_string();
    let job_id = h.system.jobs.submit(job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    h.system.jobs.pause(job_id).await.unwrap();

    eventually(Duration::from_secs(3), || async {
        h.system.jobs.get(job_id).await.unwrap().unwrap().status == JobStatus::Paused
    })
    .await;

    h.system.jobs.resume(job_id).await.unwrap();
    let job = h
        .system
        .jobs
        .wait(job_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.items_done, 50);
    // The re-run issued a second C-MOVE from the top.
    assert_eq!(h.peer.move_calls(), 2);

    h.system.shutdown().await;
}

#[tokio::test]
async fn jobs_for_unknown_nodes_are_rejected_at_dispatch() {
    let h = Harness::new(|_| {}).await;
    h.seed_local_study("1.2.3", "P-100", "CT", 1);
    h.system.start().await.unwrap();

    let job_id = h
        .system
        .jobs
        .submit(forward_job("ghost", "1.2.3", 3))
        .await
        .unwrap();
    let job = h
        .system
        .jobs
        .wait(job_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("unknown destination node"));
    // Validation failures never reach the wire and never retry.
    assert_eq!(h.peer.wire_calls(), 0);
    assert_eq!(job.retry_count, 0);

    h.system.shutdown().await;
}

#[tokio::test]
async fn status_callbacks_fire_only_on_change() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;

    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        h.system.nodes.subscribe_status(move |node_id, from, to| {
            assert_eq!(node_id, "peer-1");
            assert_ne!(from, to);
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    h.system.start().await.unwrap();

    let status = h.system.nodes.verify("peer-1").await.unwrap();
    assert_eq!(status, NodeStatus::Reachable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Unchanged status: callback suppressed.
    let status = h.system.nodes.verify("peer-1").await.unwrap();
    assert_eq!(status, NodeStatus::Reachable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let node = h.system.nodes.get("peer-1").await.unwrap();
    assert!(node.last_verified.is_some());

    h.system.shutdown().await;
}

#[tokio::test]
async fn unregister_is_refused_while_jobs_reference_the_node() {
    let h = Harness::new(|config| {
        config.jobs.worker_count = 0;
    })
    .await;
    h.register_peer("peer-1", "PEER1").await;
    h.seed_local_study("1.2.3", "P-100", "CT", 1);

    let job_id = h
        .system
        .jobs
        .submit(forward_job("peer-1", "1.2.3", 0))
        .await
        .unwrap();

    let denied = h.system.nodes.unregister("peer-1").await;
    assert!(matches!(denied, Err(client::NodeError::InUse(_))));

    h.system.jobs.cancel(job_id).await.unwrap();
    h.system.nodes.unregister("peer-1").await.unwrap();
    assert!(h.system.nodes.get("peer-1").await.is_none());

    h.system.shutdown().await;
}
