//! The evaluation broker: an in-memory, concurrency-safe coordination queue
//! that serializes scheduling work per job and redelivers deliveries that
//! are not acknowledged within the visibility window.
//!
//! The whole structure sits behind one lock held only for the duration of
//! each operation. Only [`EvalBroker::dequeue`] may suspend the caller, and
//! it does so with the lock released, waiting on per-type wakeup slots and
//! re-scanning after every wake.

pub mod queues;
pub mod stats;
mod timer;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collections::ScheduledTaskHeap;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::evaluation::{Evaluation, NamespacedId};
use queues::{PendingQueue, ReadyQueue};
use stats::BrokerStats;
use timer::VisibilityTimer;

/// Reserved type that receives evaluations once they exceed the configured
/// delivery limit, so a consumer can mark them failed.
pub const DEAD_LETTER_QUEUE: &str = "_dlq";

/// An un-acknowledged delivery: the evaluation, its receipt handle and the
/// armed visibility timer.
#[derive(Debug)]
struct InflightEval {
    eval: Evaluation,
    receipt_handle: String,
    timer: VisibilityTimer,
}

#[derive(Debug, Default)]
struct BrokerState {
    enabled: bool,

    /// Tracked evaluations by ID, to de-duplicate enqueue. The value is the
    /// number of delivery attempts so far.
    evals: HashMap<String, u32>,

    /// The one evaluation per (job, namespace) allowed to be ready or
    /// inflight.
    job_evals: HashMap<NamespacedId, String>,

    /// Extra evaluations queued behind the active one for a job.
    pending: HashMap<NamespacedId, PendingQueue>,

    /// Superseded pending evaluations awaiting external cancellation.
    cancelable: VecDeque<Evaluation>,

    /// Ready evaluations per scheduler type.
    ready: HashMap<String, ReadyQueue>,

    /// Outstanding deliveries by evaluation ID.
    inflight: HashMap<String, InflightEval>,

    /// Per-type wakeup slots for blocked dequeues.
    waiting: HashMap<String, Arc<Notify>>,

    /// Evaluations to re-submit once the delivery identified by the receipt
    /// handle is acked. Dropped if it is nacked instead.
    requeue: HashMap<String, Evaluation>,

    /// Evaluations not eligible to enqueue until their wait time.
    delay_heap: ScheduledTaskHeap<Evaluation>,

    stats: BrokerStats,

    /// Cancelled on disable: stops the delay watcher and stat emitter and
    /// wakes every forwarder parked under [`EvalBroker::dequeue`].
    background_token: Option<CancellationToken>,
}

/// The evaluation broker. Entirely in-memory: disabling it flushes all
/// state, and recovery is the caller's job via event-log replay.
///
/// Construct one explicitly and share it by `Arc`; the enable/disable
/// lifecycle belongs to whichever component starts and stops the system.
#[derive(Debug)]
pub struct EvalBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    /// Signals the delay watcher that the heap changed and its armed timer
    /// may be stale.
    delayed_update: Notify,
}

impl EvalBroker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(BrokerState::default()),
            delayed_update: Notify::new(),
        })
    }

    pub async fn enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Controls whether the broker accepts and hands out work. Enabling
    /// starts the delay watcher and periodic stat emission; disabling stops
    /// them, cancels every visibility timer and flushes all queue state.
    pub async fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let mut state = self.state.lock().await;
        let prev_enabled = state.enabled;
        state.enabled = enabled;

        if !prev_enabled && enabled {
            let token = CancellationToken::new();
            state.background_token = Some(token.clone());
            tokio::spawn(Arc::clone(self).run_delayed_evals_watcher(token.clone()));
            tokio::spawn(Arc::clone(self).run_stats_emitter(token));
            tracing::info!("eval broker enabled");
        }

        if !enabled {
            self.flush(&mut state);
            tracing::info!("eval broker disabled and flushed");
        }
    }

    pub async fn enqueue(&self, eval: Evaluation) -> Result<()> {
        let mut state = self.state.lock().await;
        self.process_enqueue(&mut state, eval, None)
    }

    /// Admits a batch atomically: the lock is held until every evaluation is
    /// enqueued, so an unblocked dequeue sees the batch's highest-priority
    /// member rather than an arbitrary first admission. An evaluation paired
    /// with the receipt handle of its own outstanding delivery is held back
    /// until that delivery is acked.
    pub async fn enqueue_all(&self, evals: Vec<(Evaluation, Option<String>)>) -> Result<()> {
        let mut state = self.state.lock().await;
        for (eval, receipt_handle) in evals {
            self.process_enqueue(&mut state, eval, receipt_handle.as_deref())?;
        }
        Ok(())
    }

    /// De-duplicates and routes one evaluation. Must be called with the lock
    /// held.
    fn process_enqueue(
        &self,
        state: &mut BrokerState,
        eval: Evaluation,
        receipt_handle: Option<&str>,
    ) -> Result<()> {
        if !state.enabled {
            tracing::debug!(
                eval_id = %eval.id,
                job_id = %eval.job_id,
                "broker is not enabled, dropping evaluation"
            );
            return Ok(());
        }
        tracing::debug!(
            eval_id = %eval.id,
            job_id = %eval.job_id,
            triggered_by = %eval.triggered_by,
            "enqueueing evaluation"
        );

        if state.evals.contains_key(&eval.id) {
            // Already tracked. With a matching receipt handle the scheduler
            // is re-blocking the evaluation until the outstanding delivery
            // is acked or nacked; otherwise re-submission is a no-op.
            if let Some(handle) = receipt_handle {
                if let Some(inflight) = state.inflight.get(&eval.id) {
                    if inflight.receipt_handle == handle {
                        state.requeue.insert(handle.to_string(), eval);
                    }
                }
            }
            return Ok(());
        }
        state.evals.insert(eval.id.clone(), 0);

        let queue = eval.job_type.clone();
        self.enqueue_locked(state, eval, &queue)
    }

    /// Routes an evaluation to the delay heap or straight to ready/pending
    /// admission. Must be called with the lock held.
    fn enqueue_locked(&self, state: &mut BrokerState, eval: Evaluation, queue: &str) -> Result<()> {
        if !state.enabled {
            return Ok(());
        }
        match eval.wait_until {
            Some(wait_until) if wait_until > Utc::now() => self.enqueue_waiting(state, eval),
            _ => {
                self.enqueue_ready(state, eval, queue);
                Ok(())
            }
        }
    }

    fn enqueue_waiting(&self, state: &mut BrokerState, eval: Evaluation) -> Result<()> {
        state.delay_heap.push(eval.clone())?;
        state.stats.total_waiting += 1;
        state.stats.delayed_evals.insert(eval.id.clone(), eval);
        // Wake the watcher so it re-arms against the new earliest time.
        self.delayed_update.notify_one();
        Ok(())
    }

    fn enqueue_ready(&self, state: &mut BrokerState, eval: Evaluation, queue: &str) {
        let namespaced_id = eval.namespaced_id();
        match state.job_evals.get(&namespaced_id) {
            None => {
                state.job_evals.insert(namespaced_id, eval.id.clone());
            }
            Some(active) if *active != eval.id => {
                state
                    .pending
                    .entry(namespaced_id)
                    .or_default()
                    .push(eval);
                state.stats.total_pending += 1;
                return;
            }
            // The active evaluation itself, being redelivered after a nack.
            Some(_) => {}
        }

        state
            .ready
            .entry(queue.to_string())
            .or_insert_with(ReadyQueue::new)
            .push(eval);

        state.stats.total_ready += 1;
        state
            .stats
            .by_scheduler
            .entry(queue.to_string())
            .or_default()
            .ready += 1;

        // Unblock any pending dequeues for this type.
        state
            .waiting
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .notify_one();
    }

    /// Hands out the highest-priority ready evaluation across the requested
    /// types, blocking until work arrives or `timeout` elapses. A zero
    /// timeout blocks indefinitely. Returns `Ok(None)` on timeout.
    pub async fn dequeue(
        self: &Arc<Self>,
        types: &[String],
        timeout: Duration,
    ) -> Result<Option<(Evaluation, String)>> {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };

        loop {
            if let Some(delivery) = self.scan_for_schedulers(types).await? {
                return Ok(Some(delivery));
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
            };

            if !self.wait_for_schedulers(types, remaining).await {
                return Ok(None);
            }
        }
    }

    /// Scans the ready queues of the requested types and dequeues from the
    /// one with the highest top priority, picking uniformly at random among
    /// tied types to spread load.
    async fn scan_for_schedulers(
        self: &Arc<Self>,
        types: &[String],
    ) -> Result<Option<(Evaluation, String)>> {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return Err(BrokerError::BrokerDisabled);
        }

        let mut eligible: Vec<&str> = Vec::new();
        let mut eligible_priority = 0i64;
        for job_type in types {
            let Some(ready) = state.ready.get(job_type) else {
                continue;
            };
            let Some(head) = ready.peek() else {
                continue;
            };
            if eligible.is_empty() || head.priority > eligible_priority {
                eligible.clear();
                eligible.push(job_type);
                eligible_priority = head.priority;
            } else if head.priority == eligible_priority {
                eligible.push(job_type);
            }
        }

        let chosen = match eligible.len() {
            0 => return Ok(None),
            1 => eligible[0],
            n => eligible[rand::thread_rng().gen_range(0..n)],
        };
        Ok(self.dequeue_for_sched(&mut state, chosen))
    }

    /// Pops the next evaluation for a scheduler type, arms its visibility
    /// timer and records the delivery. Assumes the lock is held.
    fn dequeue_for_sched(
        self: &Arc<Self>,
        state: &mut BrokerState,
        job_type: &str,
    ) -> Option<(Evaluation, String)> {
        let eval = state.ready.get_mut(job_type)?.pop()?;

        let receipt_handle = Uuid::new_v4().to_string();
        let timer = self.arm_visibility_timer(eval.id.clone(), receipt_handle.clone());

        *state.evals.entry(eval.id.clone()).or_insert(0) += 1;
        state.inflight.insert(
            eval.id.clone(),
            InflightEval {
                eval: eval.clone(),
                receipt_handle: receipt_handle.clone(),
                timer,
            },
        );

        state.stats.total_ready = state.stats.total_ready.saturating_sub(1);
        state.stats.total_inflight += 1;
        let by_sched = state
            .stats
            .by_scheduler
            .entry(job_type.to_string())
            .or_default();
        by_sched.ready = by_sched.ready.saturating_sub(1);
        by_sched.inflight += 1;

        Some((eval, receipt_handle))
    }

    /// Spawns the deferred callback that nacks the delivery if it is not
    /// resolved within the visibility window.
    fn arm_visibility_timer(
        self: &Arc<Self>,
        eval_id: String,
        receipt_handle: String,
    ) -> VisibilityTimer {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let broker = Arc::clone(self);
        let window = self.config.visibility_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if flag.swap(true, Ordering::AcqRel) {
                // An ack/nack stopped the timer first.
                return;
            }
            if let Err(error) = broker.nack(&eval_id, &receipt_handle).await {
                tracing::warn!(
                    eval_id = %eval_id,
                    error = %error,
                    "failed to nack expired evaluation"
                );
            }
        });
        VisibilityTimer::new(fired, task)
    }

    /// Blocks until one of the requested types signals ready work, the
    /// broker is disabled, or the timeout elapses. Returns whether a re-scan
    /// is worthwhile; spurious wakeups are expected and handled by the
    /// caller's re-scan.
    async fn wait_for_schedulers(&self, types: &[String], timeout: Option<Duration>) -> bool {
        let ready = Arc::new(Notify::new());
        let mut forwarders = Vec::with_capacity(types.len());
        {
            let mut state = self.state.lock().await;
            // Disabled since the last scan; re-scanning surfaces the error.
            let Some(disable_token) = state.background_token.clone() else {
                return true;
            };
            for job_type in types {
                let slot = Arc::clone(
                    state
                        .waiting
                        .entry(job_type.clone())
                        .or_insert_with(|| Arc::new(Notify::new())),
                );
                let ready = Arc::clone(&ready);
                let disabled = disable_token.clone();
                forwarders.push(tokio::spawn(async move {
                    // A `Notify` wake only reaches registered waiters, so a
                    // forwarder first polled after a disable would miss it.
                    // The cancelled token is level-triggered and covers that
                    // window.
                    tokio::select! {
                        _ = slot.notified() => {}
                        _ = disabled.cancelled() => {}
                    }
                    ready.notify_one();
                }));
            }
        }

        let woke = match timeout {
            None => {
                ready.notified().await;
                true
            }
            Some(timeout) => tokio::time::timeout(timeout, ready.notified())
                .await
                .is_ok(),
        };
        for forwarder in &forwarders {
            forwarder.abort();
        }
        woke
    }

    /// The receipt handle of an evaluation's outstanding delivery, if any.
    pub async fn inflight(&self, eval_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .inflight
            .get(eval_id)
            .map(|entry| entry.receipt_handle.clone())
    }

    /// Re-arms the visibility timer to the full window, for a consumer still
    /// working past the original one.
    pub async fn inflight_extend(
        self: &Arc<Self>,
        eval_id: &str,
        receipt_handle: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .inflight
            .get(eval_id)
            .ok_or(BrokerError::NotInflight)?;
        if entry.receipt_handle != receipt_handle {
            return Err(BrokerError::ReceiptHandleMismatch);
        }
        if !entry.timer.stop() {
            return Err(BrokerError::NackTimeoutReached);
        }
        let timer = self.arm_visibility_timer(eval_id.to_string(), receipt_handle.to_string());
        if let Some(entry) = state.inflight.get_mut(eval_id) {
            entry.timer = timer;
        }
        Ok(())
    }

    /// Acknowledges a delivery as successfully processed, terminating the
    /// evaluation. Unblocks the job's pending queue: the top-ranked pending
    /// evaluation is admitted and the rest become cancelable.
    pub async fn ack(&self, eval_id: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        // The requeued evaluation is admitted on success and dropped on any
        // failure, so take it out up front.
        let requeued = state.requeue.remove(receipt_handle);

        let entry = state
            .inflight
            .get(eval_id)
            .ok_or(BrokerError::NotInflight)?;
        if entry.receipt_handle != receipt_handle {
            return Err(BrokerError::ReceiptHandleMismatch);
        }
        if !entry.timer.stop() {
            // The visibility timer won the race; an automatic nack has
            // already reclaimed this delivery.
            return Err(BrokerError::NackTimeoutReached);
        }

        let entry = state
            .inflight
            .remove(eval_id)
            .ok_or(BrokerError::NotInflight)?;
        let deliveries = state.evals.remove(eval_id).unwrap_or(0);

        state.stats.total_inflight = state.stats.total_inflight.saturating_sub(1);
        let queue = if deliveries > self.config.max_receive_count {
            DEAD_LETTER_QUEUE
        } else {
            entry.eval.job_type.as_str()
        };
        let by_sched = state
            .stats
            .by_scheduler
            .entry(queue.to_string())
            .or_default();
        by_sched.inflight = by_sched.inflight.saturating_sub(1);

        let namespaced_id = entry.eval.namespaced_id();
        state.job_evals.remove(&namespaced_id);

        if let Some(mut pending) = state.pending.remove(&namespaced_id) {
            // Only the latest pending evaluation is worth running; the rest
            // are superseded and handed to the caller for cancellation.
            let canceled = pending.mark_for_cancel();
            state.stats.total_pending =
                state.stats.total_pending.saturating_sub(canceled.len());
            state.cancelable.extend(canceled);
            state.stats.total_cancelable = state.cancelable.len();

            if let Some(next) = pending.pop() {
                state.stats.total_pending = state.stats.total_pending.saturating_sub(1);
                let queue = next.job_type.clone();
                self.enqueue_locked(&mut state, next, &queue)?;
            }
            if !pending.is_empty() {
                state.pending.insert(namespaced_id, pending);
            }
        }

        if let Some(eval) = requeued {
            self.process_enqueue(&mut state, eval, None)?;
        }
        Ok(())
    }

    /// Reports a delivery as failed. The evaluation is re-enqueued after a
    /// backoff delay, or routed to [`DEAD_LETTER_QUEUE`] once it has reached
    /// the delivery limit.
    pub async fn nack(&self, eval_id: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        // A nack invalidates any same-ID re-submission waiting on this
        // delivery.
        state.requeue.remove(receipt_handle);

        let entry = state
            .inflight
            .get(eval_id)
            .ok_or(BrokerError::NotInflight)?;
        if entry.receipt_handle != receipt_handle {
            return Err(BrokerError::ReceiptHandleMismatch);
        }
        // Stopping a timer that already fired is harmless here.
        entry.timer.stop();

        let entry = state
            .inflight
            .remove(eval_id)
            .ok_or(BrokerError::NotInflight)?;

        state.stats.total_inflight = state.stats.total_inflight.saturating_sub(1);
        let by_sched = state
            .stats
            .by_scheduler
            .entry(entry.eval.job_type.clone())
            .or_default();
        by_sched.inflight = by_sched.inflight.saturating_sub(1);

        let deliveries = state.evals.get(eval_id).copied().unwrap_or(0);
        let mut eval = entry.eval;
        if deliveries >= self.config.max_receive_count {
            tracing::debug!(
                eval_id = %eval_id,
                deliveries,
                "delivery limit reached, routing to dead-letter queue"
            );
            self.enqueue_locked(&mut state, eval, DEAD_LETTER_QUEUE)
        } else {
            eval.wait_until = Some(Utc::now() + self.nack_reenqueue_delay(deliveries));
            let queue = eval.job_type.clone();
            self.enqueue_locked(&mut state, eval, &queue)
        }
    }

    /// Redelivery delay for an evaluation given its delivery attempts so
    /// far: none on the first attempt, the initial delay on the first nack,
    /// then a delay that compounds with each subsequent nack.
    fn nack_reenqueue_delay(&self, deliveries: u32) -> chrono::Duration {
        let delay = match deliveries {
            0 => Duration::ZERO,
            1 => self.config.initial_retry_delay,
            n => self.config.subsequent_retry_delay * (n - 1),
        };
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Drains up to `batch_size` superseded evaluations for the caller to
    /// mark canceled in its own persisted state.
    pub async fn cancelable(&self, batch_size: usize) -> Vec<Evaluation> {
        let mut state = self.state.lock().await;
        let take = batch_size.min(state.cancelable.len());
        let drained: Vec<Evaluation> = state.cancelable.drain(..take).collect();
        state.stats.total_cancelable = state.cancelable.len();
        drained
    }

    /// Point-in-time snapshot of queue depths.
    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats.clone()
    }

    /// Clears every queue, table and heap. Must be called with the lock
    /// held.
    fn flush(&self, state: &mut BrokerState) {
        // Cancelling the token stops the background tasks and wakes blocked
        // dequeues, including forwarders spawned but not yet polled, so they
        // re-scan and observe the disabled broker.
        if let Some(token) = state.background_token.take() {
            token.cancel();
        }

        for entry in state.inflight.values() {
            entry.timer.stop();
        }

        state.stats = BrokerStats::default();
        state.evals.clear();
        state.job_evals.clear();
        state.pending.clear();
        state.cancelable.clear();
        state.ready.clear();
        state.inflight.clear();
        state.waiting.clear();
        state.requeue.clear();
        state.delay_heap = ScheduledTaskHeap::new();
    }

    /// Long-lived task that promotes delayed evaluations once their wait
    /// time arrives. Any heap change re-arms the timer against the new
    /// earliest entry.
    async fn run_delayed_evals_watcher(self: Arc<Self>, token: CancellationToken) {
        loop {
            match self.next_delayed_eval().await {
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = self.delayed_update.notified() => continue,
                    }
                }
                Some((eval_id, wait_until)) => {
                    let remaining = (wait_until - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = self.delayed_update.notified() => continue,
                        _ = tokio::time::sleep(remaining) => {
                            let mut state = self.state.lock().await;
                            // The entry may have been flushed while we slept.
                            if let Some(eval) = state.delay_heap.remove(&eval_id) {
                                tracing::debug!(eval_id = %eval_id, "enqueueing delayed evaluation");
                                state.stats.total_waiting =
                                    state.stats.total_waiting.saturating_sub(1);
                                state.stats.delayed_evals.remove(&eval_id);
                                let queue = eval.job_type.clone();
                                self.enqueue_ready(&mut state, eval, &queue);
                            }
                        }
                    }
                }
            }
        }
    }

    /// The next delayed evaluation to launch and when, or `None` if the
    /// delay heap is empty.
    async fn next_delayed_eval(&self) -> Option<(String, chrono::DateTime<Utc>)> {
        let state = self.state.lock().await;
        state
            .delay_heap
            .peek()
            .and_then(|eval| eval.wait_until.map(|at| (eval.id.clone(), at)))
    }

    /// Periodically logs queue depths while the broker is enabled.
    async fn run_stats_emitter(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.stats_emit_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let stats = self.stats().await;
                    tracing::debug!(
                        ready = stats.total_ready,
                        inflight = stats.total_inflight,
                        pending = stats.total_pending,
                        waiting = stats.total_waiting,
                        cancelable = stats.total_cancelable,
                        "eval broker stats"
                    );
                }
            }
        }
    }
}
