//! Scheduler worker: the consumer side of the broker contract.
//!
//! A worker loops dequeueing evaluations for the types its schedulers
//! handle, runs the matching scheduler, and resolves every delivery with
//! exactly one ack or nack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::EvalBroker;
use crate::error::Result;
use crate::evaluation::Evaluation;

/// A scheduling pass over one evaluation. Implementations decide placement;
/// the worker only cares whether the pass succeeded.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn process(&self, eval: &Evaluation) -> Result<()>;
}

/// Resolves the scheduler responsible for a job type.
pub trait SchedulerProvider: Send + Sync {
    fn scheduler(&self, job_type: &str) -> Option<Arc<dyn Scheduler>>;

    /// The job types this provider can schedule, used as the worker's
    /// dequeue filter.
    fn enabled_types(&self) -> Vec<String>;
}

/// Static job-type to scheduler mapping.
#[derive(Default)]
pub struct MappedSchedulerProvider {
    schedulers: HashMap<String, Arc<dyn Scheduler>>,
}

impl MappedSchedulerProvider {
    pub fn new(schedulers: HashMap<String, Arc<dyn Scheduler>>) -> Self {
        Self { schedulers }
    }
}

impl SchedulerProvider for MappedSchedulerProvider {
    fn scheduler(&self, job_type: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.get(job_type).cloned()
    }

    fn enabled_types(&self) -> Vec<String> {
        self.schedulers.keys().cloned().collect()
    }
}

/// Exponential backoff for repeated dequeue failures, so a disabled or
/// erroring broker is not polled in a tight loop.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// The delay for the next attempt, doubling each time up to the cap.
    pub fn next(&mut self) -> Duration {
        let exp = self.attempts.min(16);
        self.attempts += 1;
        let delay = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(20), Duration::from_secs(2))
    }
}

/// One scheduler worker loop. Dequeues an evaluation, runs the matching
/// scheduler, then acks on success or nacks on failure. A delivery received
/// while shutting down is nacked so another worker can claim it.
pub struct Worker {
    broker: Arc<EvalBroker>,
    provider: Arc<dyn SchedulerProvider>,
    dequeue_timeout: Duration,
    token: CancellationToken,
}

impl Worker {
    pub fn new(
        broker: Arc<EvalBroker>,
        provider: Arc<dyn SchedulerProvider>,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            provider,
            dequeue_timeout,
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled by [`Worker::stop`]; clones can be watched by the
    /// component that owns the worker.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let types = self.provider.enabled_types();
        let mut backoff = Backoff::default();
        tracing::info!(types = ?types, "scheduler worker started");

        while !self.token.is_cancelled() {
            match self.broker.dequeue(&types, self.dequeue_timeout).await {
                Err(error) => {
                    tracing::warn!(error = %error, "failed to dequeue evaluation");
                    let delay = backoff.next();
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(None) => continue,
                Ok(Some((eval, receipt_handle))) => {
                    backoff.reset();
                    if self.token.is_cancelled() {
                        // Hand the delivery back rather than processing it
                        // mid-shutdown.
                        if let Err(error) = self.broker.nack(&eval.id, &receipt_handle).await {
                            tracing::warn!(eval_id = %eval.id, error = %error, "failed to nack evaluation during shutdown");
                        }
                        break;
                    }
                    self.process(&eval, &receipt_handle).await;
                }
            }
        }
        tracing::info!("scheduler worker stopped");
    }

    async fn process(&self, eval: &Evaluation, receipt_handle: &str) {
        let Some(scheduler) = self.provider.scheduler(&eval.job_type) else {
            tracing::warn!(
                eval_id = %eval.id,
                job_type = %eval.job_type,
                "no scheduler for job type, nacking evaluation"
            );
            if let Err(error) = self.broker.nack(&eval.id, receipt_handle).await {
                tracing::warn!(eval_id = %eval.id, error = %error, "failed to nack evaluation");
            }
            return;
        };

        match scheduler.process(eval).await {
            Ok(()) => {
                if let Err(error) = self.broker.ack(&eval.id, receipt_handle).await {
                    tracing::warn!(eval_id = %eval.id, error = %error, "failed to ack evaluation");
                }
            }
            Err(error) => {
                tracing::warn!(eval_id = %eval.id, error = %error, "scheduler failed to process evaluation");
                if let Err(error) = self.broker.nack(&eval.id, receipt_handle).await {
                    tracing::warn!(eval_id = %eval.id, error = %error, "failed to nack evaluation");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert_eq!(backoff.next(), Duration::from_millis(40));
        assert_eq!(backoff.next(), Duration::from_millis(80));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }
}
