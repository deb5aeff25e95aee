use std::collections::HashMap;

use crate::evaluation::Evaluation;

/// Point-in-time snapshot of broker state, safe to read under concurrent
/// mutation since [`EvalBroker::stats`](crate::EvalBroker::stats) copies it
/// out under the lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_inflight: usize,
    pub total_pending: usize,
    pub total_waiting: usize,
    pub total_cancelable: usize,
    /// Evaluations currently held in the delay heap, by ID.
    pub delayed_evals: HashMap<String, Evaluation>,
    pub by_scheduler: HashMap<String, SchedulerStats>,
}

impl BrokerStats {
    pub fn is_empty(&self) -> bool {
        self.total_ready == 0
            && self.total_inflight == 0
            && self.total_pending == 0
            && self.total_waiting == 0
            && self.total_cancelable == 0
    }
}

/// Ready/inflight counts for a single scheduler type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ready: usize,
    pub inflight: usize,
}
