pub mod assembler;
pub mod batch;
pub mod delivery;
pub mod item;

pub use assembler::{Assembler, Remaining};
pub use batch::{Batch, BatchLimits};
pub use delivery::{deliver, deliver_pipelined, BatchSubmitter, DeliveryReport, SubmitOutcome};
pub use item::{Item, ItemFailure};
