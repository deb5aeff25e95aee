//! In-memory evaluation broker for a distributed compute-job orchestrator.
//!
//! Producers submit evaluations (units of scheduling work) and scheduler
//! workers dequeue them, with per-job mutual exclusion, delayed admission,
//! visibility-timeout redelivery and a dead-letter path for evaluations that
//! repeatedly fail. The broker holds no durable state: if the process
//! restarts, queue state is rebuilt by replaying the evaluation event log
//! through the [`watcher`].

pub mod broker;
pub mod collections;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod watcher;
pub mod worker;

pub use broker::stats::{BrokerStats, SchedulerStats};
pub use broker::{EvalBroker, DEAD_LETTER_QUEUE};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use evaluation::{Evaluation, NamespacedId};
