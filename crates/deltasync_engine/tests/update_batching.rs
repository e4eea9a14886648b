//! Timer-driven batching of UI updates.

use async_trait::async_trait;
use deltasync_engine::{
    OperationOutcome, Priority, SchedulerConfig, SyncError, SyncResult, UpdateHandler,
    UpdateKind, UpdateOperation, UpdateRequest, UpdateScheduler,
};
use deltasync_protocol::FieldValue;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(UpdateKind, FieldValue)>>,
    reject: Mutex<bool>,
}

#[async_trait]
impl UpdateHandler for Recorder {
    async fn handle(&self, operation: &UpdateOperation) -> SyncResult<()> {
        if *self.reject.lock() {
            return Err(SyncError::Handler("view not mounted".into()));
        }
        self.calls
            .lock()
            .push((operation.kind, operation.data.clone()));
        Ok(())
    }
}

fn common(emojis: &[&str]) -> FieldValue {
    let mut map = BTreeMap::new();
    map.insert("emojis".to_string(), FieldValue::from(emojis.to_vec()));
    FieldValue::Map(map)
}

fn scheduler_with(recorder: &Arc<Recorder>, config: SchedulerConfig) -> UpdateScheduler {
    let scheduler = UpdateScheduler::new(config);
    for kind in [UpdateKind::CommonEmoji, UpdateKind::GroupIcon] {
        scheduler.register_handler(kind, recorder.clone());
    }
    scheduler
}

#[tokio::test(start_paused = true)]
async fn common_emoji_bursts_are_handled_once() {
    let recorder = Arc::new(Recorder::default());
    let scheduler = scheduler_with(&recorder, SchedulerConfig::default());

    let (_, done) = scheduler.enqueue_with_completion(UpdateRequest::new(
        UpdateKind::CommonEmoji,
        common(&["smile"]),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.enqueue(UpdateRequest::new(UpdateKind::CommonEmoji, common(&["wave"])));
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.enqueue(UpdateRequest::new(UpdateKind::CommonEmoji, common(&["tada"])));

    assert_eq!(done.await.unwrap(), OperationOutcome::Completed);
    let calls = recorder.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, common(&["smile", "wave", "tada"]));
    assert_eq!(scheduler.status().queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn higher_tiers_run_first() {
    let recorder = Arc::new(Recorder::default());
    let scheduler = scheduler_with(&recorder, SchedulerConfig::default().with_max_batch_size(1));

    scheduler.enqueue(
        UpdateRequest::new(UpdateKind::GroupIcon, "icon.png").with_priority(Priority::Low),
    );
    let (_, done) = scheduler.enqueue_with_completion(
        UpdateRequest::new(UpdateKind::CommonEmoji, common(&["smile"]))
            .with_priority(Priority::High),
    );

    done.await.unwrap();
    assert_eq!(recorder.calls.lock().len(), 1);
    assert_eq!(recorder.calls.lock()[0].0, UpdateKind::CommonEmoji);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let kinds: Vec<UpdateKind> = recorder.calls.lock().iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![UpdateKind::CommonEmoji, UpdateKind::GroupIcon]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_operations_report_failure() {
    let recorder = Arc::new(Recorder::default());
    *recorder.reject.lock() = true;
    let scheduler = scheduler_with(&recorder, SchedulerConfig::default());

    let (_, done) = scheduler.enqueue_with_completion(
        UpdateRequest::new(UpdateKind::GroupIcon, "icon.png")
            .with_priority(Priority::High)
            .with_max_retries(1),
    );

    match done.await.unwrap() {
        OperationOutcome::Failed { error } => assert!(error.contains("view not mounted")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(scheduler.pending().is_empty());
    assert!(recorder.calls.lock().is_empty());
}
