
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use eval_broker::worker::{MappedSchedulerProvider, Scheduler, Worker};
use eval_broker::{BrokerError, Evaluation, Result};
use test_harness::*;

/// Records every evaluation it sees and fails a configurable number of
/// times before succeeding.
#[derive(Default)]
struct RecordingScheduler {
    processed: Mutex<Vec<String>>,
    failures_left: AtomicU32,
}

impl RecordingScheduler {
    fn failing(times: u32) -> Self {
        Self {
            processed: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(times),
        }
    }

    fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn process(&self, eval: &Evaluation) -> Result<()> {
        self.processed.lock().unwrap().push(eval.id.clone());
        let left = self.failures_left.load(Ordering::Acquire);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::Release);
            return Err(BrokerError::SchedulerFailed("induced failure".into()));
        }
        Ok(())
    }
}

fn provider_for(job_type: &str, scheduler: Arc<dyn Scheduler>) -> Arc<MappedSchedulerProvider> {
    let mut schedulers: HashMap<String, Arc<dyn Scheduler>> = HashMap::new();
    schedulers.insert(job_type.to_string(), scheduler);
    Arc::new(MappedSchedulerProvider::new(schedulers))
}

#[tokio::test]
async fn worker_processes_and_acks() {
    let broker = test_broker();
    broker.set_enabled(true).await;

    let mut evals = Vec::new();
    for _ in 0..3 {
        let eval = mock_eval();
        broker.enqueue(eval.clone()).await.unwrap();
        evals.push(eval);
    }

    let scheduler = Arc::new(RecordingScheduler::default());
    let provider = provider_for(JOB_TYPE_SERVICE, scheduler.clone());
    let worker = Worker::new(broker.clone(), provider, Duration::from_millis(20));
    let token = worker.cancellation_token();
    let handle = worker.spawn();

    wait_for(|| async {
        scheduler.processed_ids().len() == 3 && broker.stats().await.is_empty()
    })
    .await;

    let mut processed = scheduler.processed_ids();
    processed.sort();
    let mut expected: Vec<String> = evals.into_iter().map(|e| e.id).collect();
    expected.sort();
    assert_eq!(processed, expected);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker should stop after cancel")
        .unwrap();
}

#[tokio::test]
async fn worker_retries_until_the_scheduler_succeeds() {
    let broker = test_broker();
    broker.set_enabled(true).await;

    let eval = mock_eval();
    broker.enqueue(eval.clone()).await.unwrap();

    // Fails twice, succeeds on the third delivery, all inside the delivery
    // limit of three.
    let scheduler = Arc::new(RecordingScheduler::failing(2));
    let provider = provider_for(JOB_TYPE_SERVICE, scheduler.clone());
    let worker = Worker::new(broker.clone(), provider, Duration::from_millis(20));
    let token = worker.cancellation_token();
    let handle = worker.spawn();

    wait_for(|| async {
        scheduler.processed_ids().len() == 3 && broker.stats().await.is_empty()
    })
    .await;
    assert_eq!(scheduler.processed_ids(), vec![eval.id.clone(); 3]);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker should stop after cancel")
        .unwrap();
}

#[tokio::test]
async fn worker_stops_on_cancel() {
    let broker = test_broker();
    broker.set_enabled(true).await;

    let provider = provider_for(JOB_TYPE_SERVICE, Arc::new(RecordingScheduler::default()));
    let worker = Worker::new(broker, provider, Duration::from_millis(20));
    let token = worker.cancellation_token();
    let handle = worker.spawn();

    tokio::time::sleep(Duration::from_millis(5)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker should stop after cancel")
        .unwrap();
}

#[tokio::test]
async fn worker_backs_off_while_the_broker_is_disabled() {
    let broker = test_broker();

    let scheduler = Arc::new(RecordingScheduler::default());
    let provider = provider_for(JOB_TYPE_SERVICE, scheduler.clone());
    let worker = Worker::new(broker.clone(), provider, Duration::from_millis(20));
    let token = worker.cancellation_token();
    let handle = worker.spawn();

    // Every dequeue fails while disabled; the worker must keep running and
    // pick up work once the broker comes up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    broker.set_enabled(true).await;
    let eval = mock_eval();
    broker.enqueue(eval.clone()).await.unwrap();

    wait_for(|| async { scheduler.processed_ids() == vec![eval.id.clone()] }).await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker should stop after cancel")
        .unwrap();
}
