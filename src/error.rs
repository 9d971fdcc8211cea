use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The item's payload size could not be computed; only that item is affected.
    #[error("Failed to measure item: {0}")]
    Measurement(String),

    /// The remote side refused the item, either alone or with its whole batch.
    #[error("Rejected by submitter: {0}")]
    Rejected(String),

    /// The item was never submitted because an earlier batch failed as a whole.
    #[error("Not submitted, delivery aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, BatchError>;
