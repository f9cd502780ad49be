//! Slot pool: runner subprocess lifecycle, the per-slot management thread and
//! the built-in echo runner.

pub mod ipc_types;
pub mod runner_main;
pub mod slot_agent;
pub mod slot_worker;
