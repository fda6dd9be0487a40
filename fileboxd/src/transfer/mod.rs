//! Sequential upload and download queues.
//!
//! Each direction is owned by its own task; front ends talk to it through a
//! [`TransferHandle`] and observe it through [`TransferEvent`]s.

pub mod executor;
pub mod queue;
pub mod service;
pub mod task;

pub use executor::{HttpTransferExecutor, ProgressSink, TransferError, TransferExecutor};
pub use queue::{QueueSnapshot, TransferQueue};
pub use service::{QueueClosed, TransferEvent, TransferHandle, spawn_transfer_queue};
pub use task::{
    Direction, TaskId, TaskStatus, TransferLimits, TransferRequest, TransferSpec, TransferTask,
    ValidationError,
};
