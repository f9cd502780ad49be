// Model swapper modules

pub mod backoff;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod fabric;
pub mod messages;
pub mod policy;
pub mod reaper;
pub mod scheduler;
pub mod signals;
pub mod slot;
pub mod types;

// Re-export commonly used types
pub use checkpoint::CheckpointStore;
pub use client::{chunk_rows, ModelSwapperClient, ResultConsumer};
pub use config::*;
pub use error::{Result, SwapperError};
pub use fabric::{Persistence, QueueFabric};
pub use messages::{Command, CommandStatus, ModelResult};
pub use policy::{LongestWaitingFirst, SwapPolicy};
pub use reaper::ProcessReaper;
pub use scheduler::{ModelScheduler, ModelState, SchedulerHandle, SchedulerSnapshot, SlotState};
pub use types::*;
