//! End-to-end pipeline tests: in-memory broker and tracker driven through the real router.
//!
//! Tests run on a paused clock, so retry backoffs and poll timeouts cost no wall time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use nomflow_core::{FileOutcome, RequestStatus, UploadId, UploadRequest};
use nomflow_events::retry::{NO_OF_RETRIES, retry_count};
use nomflow_events::topics::{
    DEAD_LETTER_QUEUE, EMAIL_NOTIFICATION, PROCESS_NOM_DGRAPH_SUCCESS,
    PROCESS_NOM_POSTGRES_SUCCESS, PROCESS_NOM_POSTGRES_SUCCESS_RETRY,
    UPDATE_NOMINATIVE_USER_REQUEST,
};
use nomflow_events::{DeadLetterRecord, InMemoryBroker, Message, MessageBroker, NotificationRequest};
use nomflow_infra::build_router;
use nomflow_infra::config::WorkerConfig;
use nomflow_infra::notification::NotificationDispatcher;
use nomflow_infra::reconciler::StatusReconciler;
use nomflow_infra::stages::{
    Completion, GraphCompletionStage, RelationalCompletionStage, StageHandler,
};
use nomflow_infra::tracker::{BatchCompletionTracker, InMemoryTracker};
use nomflow_infra::workers::RouterHandle;

const STEP: Duration = Duration::from_millis(100);
const PATIENCE: usize = 10_000;

struct Harness {
    broker: InMemoryBroker,
    tracker: Arc<InMemoryTracker>,
    router: RouterHandle,
}

impl Harness {
    async fn start() -> Self {
        let broker = InMemoryBroker::new();
        let tracker = InMemoryTracker::arc();
        let config = WorkerConfig {
            consumer_name: "test-worker".to_string(),
            ..WorkerConfig::default()
        };

        let router = build_router(&config, tracker.clone(), Arc::new(broker.clone()))
            .start(CancellationToken::new())
            .await
            .unwrap();

        Self {
            broker,
            tracker,
            router,
        }
    }

    fn register(&self, upload_id: &str, scope: &str) -> UploadRequest {
        self.tracker
            .register(UploadId::new(upload_id).unwrap(), scope, Some("owner@example.com"))
            .unwrap()
    }

    async fn send(&self, topic: &str, body: serde_json::Value) {
        self.broker
            .publish(topic, Message::json(&body).unwrap())
            .await
            .unwrap();
    }

    async fn row(&self, upload_id: &str) -> UploadRequest {
        self.tracker
            .get(&UploadId::new(upload_id).unwrap())
            .await
            .unwrap()
    }

    async fn wait_for_row<F>(&self, upload_id: &str, done: F) -> UploadRequest
    where
        F: Fn(&UploadRequest) -> bool,
    {
        for _ in 0..PATIENCE {
            let row = self.row(upload_id).await;
            if done(&row) {
                return row;
            }
            tokio::time::sleep(STEP).await;
        }
        panic!("row {upload_id} never reached the expected state");
    }

    async fn wait_for_published(&self, topic: &str, count: usize) -> Vec<Message> {
        for _ in 0..PATIENCE {
            let published = self.broker.published(topic);
            if published.len() >= count {
                return published;
            }
            tokio::time::sleep(STEP).await;
        }
        panic!("{topic} never received {count} messages");
    }

    /// Let the workers drain whatever is still queued.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(120)).await;
    }
}

fn relational(upload_id: &str, scope: &str, total: i32, failed: i64) -> serde_json::Value {
    json!({
        "upload_id": upload_id,
        "scope": scope,
        "success": true,
        "total_dgraph_batches": total,
        "records_succeeded": 10,
        "records_failed": failed,
    })
}

fn graph(upload_id: &str, scope: &str, batch: i32) -> serde_json::Value {
    json!({ "upload_id": upload_id, "scope": scope, "success": true, "batch": batch })
}

#[tokio::test(start_paused = true)]
async fn relational_first_then_all_graph_batches_succeeds_once() {
    let h = Harness::start().await;
    h.register("U1", "scope-a");

    h.send(PROCESS_NOM_POSTGRES_SUCCESS, relational("U1", "scope-a", 3, 0)).await;
    h.wait_for_row("U1", |r| r.postgres_success).await;

    for batch in 0..3 {
        h.send(PROCESS_NOM_DGRAPH_SUCCESS, graph("U1", "scope-a", batch)).await;
    }

    let row = h.wait_for_row("U1", |r| r.status.is_terminal()).await;
    assert_eq!(row.status, RequestStatus::Success);
    assert_eq!(row.dgraph_completed_batches, 3);

    h.settle().await;
    let mails = h.broker.published(EMAIL_NOTIFICATION);
    assert_eq!(mails.len(), 1);
    let mail: NotificationRequest = mails[0].decode().unwrap();
    assert_eq!(mail.mail_to, vec!["owner@example.com".to_string()]);

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn graph_batches_before_relational_finalize_from_relational_path() {
    let h = Harness::start().await;
    h.register("U1", "scope-a");

    for batch in 0..3 {
        h.send(PROCESS_NOM_DGRAPH_SUCCESS, graph("U1", "scope-a", batch)).await;
    }
    let row = h.wait_for_row("U1", |r| r.dgraph_completed_batches == 3).await;
    assert_eq!(row.status, RequestStatus::Pending);
    assert_eq!(row.total_dgraph_batches, None);

    h.send(PROCESS_NOM_POSTGRES_SUCCESS, relational("U1", "scope-a", 3, 0)).await;

    let row = h.wait_for_row("U1", |r| r.status.is_terminal()).await;
    assert_eq!(row.status, RequestStatus::Success);
    h.wait_for_published(EMAIL_NOTIFICATION, 1).await;

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_is_dead_lettered_after_retry_budget() {
    let h = Harness::start().await;
    let original = Message::json(&relational("ghost", "scope-a", 1, 0)).unwrap();
    h.broker
        .publish(PROCESS_NOM_POSTGRES_SUCCESS, original.clone())
        .await
        .unwrap();

    let dlq = h.wait_for_published(DEAD_LETTER_QUEUE, 1).await;
    let record: DeadLetterRecord = dlq[0].decode().unwrap();
    assert_eq!(record.topic_name, PROCESS_NOM_POSTGRES_SUCCESS_RETRY);
    assert!(record.error.contains("ghost"));
    assert_eq!(record.message.as_bytes(), original.payload.as_slice());
    assert_eq!(record.headers.get(NO_OF_RETRIES).map(String::as_str), Some("21"));

    h.settle().await;
    let retries = h.broker.published(PROCESS_NOM_POSTGRES_SUCCESS_RETRY);
    assert_eq!(retries.len(), 21);
    let counts: Vec<u32> = retries.iter().map(|m| retry_count(&m.headers)).collect();
    assert_eq!(counts, (1..=21).collect::<Vec<_>>());
    assert_eq!(h.broker.published(DEAD_LETTER_QUEUE).len(), 1);

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_records_in_one_file_make_upload_partial() {
    let h = Harness::start().await;
    let row = h.register("U2", "scope-b");
    for outcome in [
        FileOutcome::new("a.xlsx", 10, 0),
        FileOutcome::new("b.xlsx", 8, 2),
        FileOutcome::new("c.xlsx", 5, 0),
    ] {
        h.tracker.add_file_outcome(row.request_id, "scope-b", outcome).unwrap();
    }

    h.send(UPDATE_NOMINATIVE_USER_REQUEST, json!({
        "upload_id": "U2", "scope": "scope-b", "total_dgraph_batches": 1,
        "records_succeeded": 23, "records_failed": 2
    }))
    .await;
    h.send(PROCESS_NOM_DGRAPH_SUCCESS, graph("U2", "scope-b", 0)).await;
    h.send(PROCESS_NOM_POSTGRES_SUCCESS, relational("U2", "scope-b", 1, 2)).await;

    let row = h.wait_for_row("U2", |r| r.status.is_terminal()).await;
    assert_eq!(row.status, RequestStatus::Partial);

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn redelivery_after_finalization_changes_nothing() {
    let h = Harness::start().await;
    h.register("U3", "s");

    h.send(PROCESS_NOM_POSTGRES_SUCCESS, relational("U3", "s", 1, 0)).await;
    h.send(PROCESS_NOM_DGRAPH_SUCCESS, graph("U3", "s", 0)).await;
    let finalized = h.wait_for_row("U3", |r| r.status.is_terminal()).await;

    h.send(PROCESS_NOM_POSTGRES_SUCCESS, relational("U3", "s", 1, 0)).await;
    h.send(PROCESS_NOM_DGRAPH_SUCCESS, graph("U3", "s", 0)).await;
    h.send(PROCESS_NOM_DGRAPH_SUCCESS, json!({"upload_id": "U3", "scope": "s", "success": true})).await;
    h.settle().await;

    let row = h.row("U3").await;
    assert_eq!(row.status, finalized.status);
    assert_eq!(row.dgraph_completed_batches, 1);
    assert_eq!(row.total_dgraph_batches, Some(1));
    assert_eq!(h.broker.published(EMAIL_NOTIFICATION).len(), 1);

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_goes_straight_to_dead_letters() {
    let h = Harness::start().await;
    h.broker
        .publish(PROCESS_NOM_DGRAPH_SUCCESS, Message::new("{not json"))
        .await
        .unwrap();

    let dlq = h.wait_for_published(DEAD_LETTER_QUEUE, 1).await;
    let record: DeadLetterRecord = dlq[0].decode().unwrap();
    assert_eq!(record.message, "{not json");
    assert!(record.error.contains("undecodable payload"));
    assert!(h.broker.published("process_nom_dgraph_success_retry").is_empty());

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_worker() {
    let h = Harness::start().await;
    h.router.shutdown().await;

    // Nothing consumes after shutdown.
    h.broker
        .publish(PROCESS_NOM_DGRAPH_SUCCESS, Message::new("{not json"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.broker.published(DEAD_LETTER_QUEUE).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_final_signals_notify_exactly_once_per_upload() {
    const UPLOADS: usize = 64;

    let broker = InMemoryBroker::new();
    let tracker = InMemoryTracker::arc();
    let completion = Completion::new(
        StatusReconciler::new(tracker.clone()),
        NotificationDispatcher::new(Arc::new(broker.clone())),
    );
    let graph_stage = Arc::new(GraphCompletionStage::new(tracker.clone(), completion.clone()));
    let relational_stage = Arc::new(RelationalCompletionStage::new(tracker.clone(), completion));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..UPLOADS {
        let upload_id = format!("race-{i}");
        tracker
            .register(
                UploadId::new(upload_id.clone()).unwrap(),
                "s",
                Some(format!("owner-{i}@example.com").as_str()),
            )
            .unwrap();

        let graph_stage = graph_stage.clone();
        let relational_stage = relational_stage.clone();
        tasks.spawn(async move {
            let last_batch = Message::json(&graph(&upload_id, "s", 0)).unwrap();
            let completed = Message::json(&relational(&upload_id, "s", 1, 0)).unwrap();
            let (g, r) = tokio::join!(
                tokio::spawn(async move { graph_stage.handle(&last_batch).await }),
                tokio::spawn(async move { relational_stage.handle(&completed).await }),
            );
            g.unwrap().unwrap();
            r.unwrap().unwrap();
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    let mut per_recipient: HashMap<String, usize> = HashMap::new();
    for mail in broker.published(EMAIL_NOTIFICATION) {
        let mail: NotificationRequest = mail.decode().unwrap();
        for to in mail.mail_to {
            *per_recipient.entry(to).or_default() += 1;
        }
    }
    assert_eq!(per_recipient.len(), UPLOADS);
    assert!(per_recipient.values().all(|count| *count == 1));

    for i in 0..UPLOADS {
        let row = tracker.get(&UploadId::new(format!("race-{i}")).unwrap()).await.unwrap();
        assert_eq!(row.status, RequestStatus::Success);
    }
}
