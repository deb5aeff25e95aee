//! Upstream feed from the persisted evaluation event log.
//!
//! The broker is in-memory only, so after a restart its state is rebuilt by
//! replaying creation events from the durable store. The watcher subscribes
//! to that stream and enqueues each created evaluation; update and delete
//! events are ignored, since broker-side state is only ever removed through
//! an ack.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::EvalBroker;
use crate::evaluation::Evaluation;

/// An entry from the evaluation event log.
#[derive(Debug, Clone)]
pub enum EvaluationEvent {
    Created(Evaluation),
    Updated(Evaluation),
    Deleted(String),
}

/// Subscribes to the evaluation event log and feeds creations into the
/// broker.
pub struct EvalWatcher {
    broker: Arc<EvalBroker>,
    events: mpsc::Receiver<EvaluationEvent>,
    token: CancellationToken,
}

impl EvalWatcher {
    pub fn new(
        broker: Arc<EvalBroker>,
        events: mpsc::Receiver<EvaluationEvent>,
        token: CancellationToken,
    ) -> Self {
        Self {
            broker,
            events,
            token,
        }
    }

    /// Runs the watcher until the event stream closes or the token is
    /// cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    tracing::info!("evaluation watcher stopping");
                    return;
                }
                event = self.events.recv() => {
                    match event {
                        None => {
                            tracing::info!("evaluation event stream closed, watcher stopping");
                            return;
                        }
                        Some(event) => self.handle_event(event).await,
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: EvaluationEvent) {
        match event {
            EvaluationEvent::Created(eval) => {
                if !eval.should_enqueue() {
                    tracing::debug!(
                        eval_id = %eval.id,
                        status = %eval.status,
                        "skipping evaluation not eligible for enqueue"
                    );
                    return;
                }
                if let Err(error) = self.broker.enqueue(eval).await {
                    tracing::warn!(error = %error, "failed to enqueue evaluation from event log");
                }
            }
            // Broker state is deleted only through Ack.
            EvaluationEvent::Updated(eval) => {
                tracing::trace!(eval_id = %eval.id, "ignoring evaluation update event");
            }
            EvaluationEvent::Deleted(eval_id) => {
                tracing::trace!(eval_id = %eval_id, "ignoring evaluation delete event");
            }
        }
    }
}
