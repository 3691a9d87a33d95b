//! Postgres tracker tests. Run only when `TEST_DATABASE_URL` points at a scratch database.

use nomflow_core::{DomainError, FileOutcome, RecordCounts, RequestStatus, UploadId};
use nomflow_infra::tracker::{BatchCompletionTracker, PostgresTracker, TrackerError};
use sqlx::postgres::PgPoolOptions;

async fn tracker() -> Option<PostgresTracker> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to TEST_DATABASE_URL");
    let tracker = PostgresTracker::new(pool);
    tracker.migrate().await.expect("migrations");
    Some(tracker)
}

fn fresh_upload() -> UploadId {
    UploadId::new(format!("test-{}", uuid::Uuid::now_v7())).unwrap()
}

#[tokio::test]
async fn graph_batches_are_counted_once_and_capped_by_total() {
    let Some(tracker) = tracker().await else {
        return;
    };
    let id = fresh_upload();
    tracker.register(&id, "s", Some("owner@example.com")).await.unwrap();

    tracker.record_graph_stage_batch_success(&id, Some(0)).await.unwrap();
    let row = tracker.record_graph_stage_batch_success(&id, Some(0)).await.unwrap();
    assert_eq!(row.dgraph_completed_batches, 1);

    let row = tracker
        .record_relational_stage_completion(&id, 2, RecordCounts::new(4, 0))
        .await
        .unwrap();
    assert!(row.postgres_success);
    assert!(!row.is_complete());

    tracker.record_graph_stage_batch_success(&id, None).await.unwrap();
    let row = tracker.record_graph_stage_batch_success(&id, None).await.unwrap();
    assert_eq!(row.dgraph_completed_batches, 2);
    assert!(row.is_complete());
}

#[tokio::test]
async fn total_below_completed_is_an_invariant_violation() {
    let Some(tracker) = tracker().await else {
        return;
    };
    let id = fresh_upload();
    tracker.register(&id, "s", None).await.unwrap();
    for _ in 0..3 {
        tracker.record_graph_stage_batch_success(&id, None).await.unwrap();
    }

    let err = tracker
        .record_upload_analysis(&id, 2, RecordCounts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Domain(DomainError::InvariantViolation(_))));
}

#[tokio::test]
async fn unknown_upload_is_not_found() {
    let Some(tracker) = tracker().await else {
        return;
    };
    let err = tracker
        .record_relational_stage_completion(&fresh_upload(), 1, RecordCounts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::NotFound(_)));
}

#[tokio::test]
async fn finalize_transitions_exactly_once() {
    let Some(tracker) = tracker().await else {
        return;
    };
    let id = fresh_upload();
    let row = tracker.register(&id, "s", None).await.unwrap();
    tracker
        .upsert_file_outcome(row.request_id, "s", &FileOutcome::new("a.csv", 3, 1))
        .await
        .unwrap();

    let files = tracker.list_file_outcomes(row.request_id, "s").await.unwrap();
    assert_eq!(files, vec![FileOutcome::new("a.csv", 3, 1)]);

    assert!(tracker.finalize(row.request_id, RequestStatus::Partial).await.unwrap());
    assert!(!tracker.finalize(row.request_id, RequestStatus::Success).await.unwrap());
    assert_eq!(tracker.get(&id).await.unwrap().status, RequestStatus::Partial);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_finalize_has_a_single_winner() {
    let Some(tracker) = tracker().await else {
        return;
    };
    let tracker = std::sync::Arc::new(tracker);
    let request_id = tracker.register(&fresh_upload(), "s", None).await.unwrap().request_id;

    let mut attempts = tokio::task::JoinSet::new();
    for i in 0..8 {
        let tracker = tracker.clone();
        let status = if i % 2 == 0 {
            RequestStatus::Success
        } else {
            RequestStatus::Partial
        };
        attempts.spawn(async move { tracker.finalize(request_id, status).await.unwrap() });
    }

    let mut winners = 0;
    while let Some(won) = attempts.join_next().await {
        if won.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
