//! Sync cycle flows: conflict detection under the manual policy, operator
//! resolution, and automatic pull resolution.

mod support;

use std::time::Duration;

use dimse::{tags, Dataset};
use models::{ConflictKind, ConflictPolicy, JobKind, JobStatus, SyncConfig, SyncDirection};
use support::Harness;

fn remote_study(study_uid: &str, patient: &str, instances: i64) -> Dataset {
    Dataset::new()
        .with(tags::STUDY_INSTANCE_UID, study_uid)
        .with(tags::PATIENT_ID, patient)
        .with(tags::MODALITY, "CT")
        .with(tags::STUDY_RELATED_INSTANCES, instances.to_string())
}

#[tokio::test]
async fn count_mismatch_under_manual_policy_records_a_conflict() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;

    // Local has S1 with 10 instances; the peer reports 12.
    h.seed_local_study("S1", "P-1", "CT", 10);
    h.peer.set_find_results(vec![remote_study("S1", "P-1", 12)]);

    let config = SyncConfig::new("c-1", "pull from peer-1", "peer-1", SyncDirection::Pull);
    // Default policy is manual.
    h.system.sync.create_config(config).await.unwrap();
    h.system.start().await.unwrap();

    let cycle_id = h.system.sync.run_config("c-1").await.unwrap();
    let cycle = h
        .system
        .jobs
        .wait(cycle_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cycle.status, JobStatus::Completed);

    let runs = h.system.sync.history("c-1", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].success);
    assert_eq!(runs[0].studies_checked, 1);
    assert_eq!(runs[0].conflicts_found, 1);
    assert_eq!(runs[0].studies_synced, 0);
    assert_eq!(runs[0].job_id, cycle_id);

    let conflicts = h.system.sync.list_conflicts(None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.study_uid, "S1");
    assert_eq!(conflict.kind, ConflictKind::CountMismatch);
    assert!(!conflict.resolved);
    assert_eq!(conflict.local_instance_count, Some(10));
    assert_eq!(conflict.remote_instance_count, Some(12));

    // Resolving toward the remote pulls the study back.
    h.peer.set_move_items(vec![
        Dataset::new().with(tags::SOP_INSTANCE_UID, "S1.11"),
        Dataset::new().with(tags::SOP_INSTANCE_UID, "S1.12"),
    ]);
    let corrective = h
        .system
        .sync
        .resolve("S1", ConflictPolicy::PreferRemote)
        .await
        .unwrap()
        .expect("a corrective job");
    let job = h
        .system
        .jobs
        .wait(corrective, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.kind, JobKind::Retrieve);
    assert_eq!(job.source_node_id.as_deref(), Some("peer-1"));
    assert_eq!(job.study_uid, "S1");
    assert_eq!(h.peer.move_calls(), 1);

    let conflicts = h.system.sync.list_conflicts(Some("c-1")).await.unwrap();
    assert!(conflicts[0].resolved);
    assert_eq!(
        conflicts[0].resolution_used,
        Some(ConflictPolicy::PreferRemote)
    );
    assert!(h.system.sync.list_conflicts(None).await.unwrap().is_empty());

    h.system.shutdown().await;
}

#[tokio::test]
async fn prefer_remote_pulls_missing_studies_automatically() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;

    // Remote has a study we lack entirely.
    h.peer
        .set_find_results(vec![remote_study("S9", "P-2", 4)]);
    h.peer.set_move_items(vec![
        Dataset::new().with(tags::SOP_INSTANCE_UID, "S9.1"),
    ]);

    let mut config = SyncConfig::new("c-2", "auto pull", "peer-1", SyncDirection::Pull);
    config.conflict_policy = ConflictPolicy::PreferRemote;
    h.system.sync.create_config(config).await.unwrap();
    h.system.start().await.unwrap();

    let cycle_id = h.system.sync.run_config("c-2").await.unwrap();
    let cycle = h
        .system
        .jobs
        .wait(cycle_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cycle.status, JobStatus::Completed);

    let runs = h.system.sync.history("c-2", 10).await.unwrap();
    assert!(runs[0].success);
    assert_eq!(runs[0].studies_synced, 1);
    assert_eq!(runs[0].conflicts_found, 0);
    assert_eq!(h.peer.move_calls(), 1);

    // No conflict rows for an automatically resolved divergence.
    assert!(h.system.sync.list_conflicts(None).await.unwrap().is_empty());

    h.system.shutdown().await;
}

#[tokio::test]
async fn push_direction_sends_local_only_studies_to_the_peer() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;

    h.seed_local_study("S5", "P-3", "CT", 2);
    h.peer.set_find_results(Vec::new());

    let mut config = SyncConfig::new("c-3", "auto push", "peer-1", SyncDirection::Push);
    config.conflict_policy = ConflictPolicy::PreferLocal;
    h.system.sync.create_config(config).await.unwrap();
    h.system.start().await.unwrap();

    let cycle_id = h.system.sync.run_config("c-3").await.unwrap();
    let cycle = h
        .system
        .jobs
        .wait(cycle_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cycle.status, JobStatus::Completed);

    let runs = h.system.sync.history("c-3", 10).await.unwrap();
    assert!(runs[0].success);
    assert_eq!(runs[0].studies_synced, 1);
    // Both local instances went over the wire.
    assert_eq!(h.peer.store_calls(), 2);

    h.system.shutdown().await;
}

#[tokio::test]
async fn pull_only_configs_cannot_push_and_record_conflicts_instead() {
    let h = Harness::new(|_| {}).await;
    h.register_peer("peer-1", "PEER1").await;

    // Local-only study under a pull config preferring local: the policy
    // wants a push the direction forbids.
    h.seed_local_study("S7", "P-4", "CT", 1);
    h.peer.set_find_results(Vec::new());

    let mut config = SyncConfig::new("c-4", "pull only", "peer-1", SyncDirection::Pull);
    config.conflict_policy = ConflictPolicy::PreferLocal;
    h.system.sync.create_config(config).await.unwrap();
    h.system.start().await.unwrap();

    let cycle_id = h.system.sync.run_config("c-4").await.unwrap();
    let cycle = h
        .system
        .jobs
        .wait(cycle_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cycle.status, JobStatus::Completed);

    let conflicts = h.system.sync.list_conflicts(Some("c-4")).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::MissingRemote);
    assert_eq!(h.peer.store_calls(), 0);

    h.system.shutdown().await;
}
