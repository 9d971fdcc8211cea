use crate::error::{BatchError, Result};

/// An outbound record as seen by the assembler.
///
/// The assembler never looks at the payload itself. It only needs the
/// encoded size, which may fail, and the partition the record belongs to.
pub trait Item {
    /// Encoded size in bytes, as the remote API will count it.
    fn byte_size(&self) -> Result<u64>;

    /// Routing key; `None` and `Some("")` both select the default partition.
    fn partition_key(&self) -> Option<&str>;
}

/// An item that could not be placed in, or delivered with, a batch.
#[derive(Debug)]
pub struct ItemFailure<T> {
    pub item: T,
    pub error: BatchError,
}

impl<T> ItemFailure<T> {
    pub fn new(item: T, error: BatchError) -> Self {
        Self { item, error }
    }
}
