use std::time::Duration;

use crate::error::{BrokerError, Result};

/// Configuration for the evaluation broker.
///
/// Controls the delivery window, redelivery backoff and the point at which a
/// repeatedly failing evaluation is routed to the dead-letter queue.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Time a consumer has to Ack/Nack a delivery before it is automatically
    /// redelivered.
    pub visibility_timeout: Duration,

    /// Delay applied before re-enqueueing an evaluation Nacked for the
    /// first time.
    pub initial_retry_delay: Duration,

    /// Delay applied before re-enqueueing an evaluation Nacked more than
    /// once. Compounds with each Nack after the first.
    pub subsequent_retry_delay: Duration,

    /// Number of deliveries after which an evaluation is routed to the
    /// dead-letter queue instead of its own type. Must be at least 1.
    pub max_receive_count: u32,

    /// Interval between periodic stat log emissions while enabled.
    pub stats_emit_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            initial_retry_delay: Duration::from_secs(1),
            subsequent_retry_delay: Duration::from_secs(30),
            max_receive_count: 3,
            stats_emit_interval: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_receive_count == 0 {
            return Err(BrokerError::InvalidConfig(
                "max_receive_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry_delays(mut self, initial: Duration, subsequent: Duration) -> Self {
        self.initial_retry_delay = initial;
        self.subsequent_retry_delay = subsequent;
        self
    }

    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_default() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.visibility_timeout, Duration::from_secs(60));
        assert_eq!(cfg.initial_retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.subsequent_retry_delay, Duration::from_secs(30));
        assert_eq!(cfg.max_receive_count, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn broker_config_builders() {
        let cfg = BrokerConfig::default()
            .with_visibility_timeout(Duration::from_millis(50))
            .with_retry_delays(Duration::from_millis(5), Duration::from_millis(50))
            .with_max_receive_count(5);
        assert_eq!(cfg.visibility_timeout, Duration::from_millis(50));
        assert_eq!(cfg.initial_retry_delay, Duration::from_millis(5));
        assert_eq!(cfg.subsequent_retry_delay, Duration::from_millis(50));
        assert_eq!(cfg.max_receive_count, 5);
    }

    #[test]
    fn broker_config_rejects_zero_receive_count() {
        let cfg = BrokerConfig::default().with_max_receive_count(0);
        assert!(matches!(
            cfg.validate(),
            Err(BrokerError::InvalidConfig(_))
        ));
    }
}
