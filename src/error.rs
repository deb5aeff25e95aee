use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("evaluation is not inflight")]
    NotInflight,

    #[error("evaluation receipt handle does not match")]
    ReceiptHandleMismatch,

    #[error("evaluation visibility timeout reached")]
    NackTimeoutReached,

    #[error("eval broker disabled")]
    BrokerDisabled,

    #[error("task already exists in heap: {0}")]
    DuplicateTask(String),

    #[error("invalid broker config: {0}")]
    InvalidConfig(String),

    #[error("scheduler failed: {0}")]
    SchedulerFailed(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
