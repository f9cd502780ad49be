//! Model swapper.
//!
//! Multiplexes an unbounded set of stateful models onto a fixed pool of
//! runner subprocesses. Producers talk to durable per-model queues through
//! [`ModelSwapperClient`]; the [`ModelScheduler`] loads, swaps and checkpoints
//! models so each one sees its input exactly in order.

pub mod swapper;

pub use swapper::*;
