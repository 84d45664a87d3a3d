//! Task layer over tokio
//!
//! Supplies the scheduler primitives transactions are built on: schedule a
//! future and get a handle, attach a completion callback, find the current
//! task, and wait for many handles.

pub mod signal;
pub mod task;

pub use signal::Signal;
pub use task::{gather, spawn, Completion, Deferred, TaskHandle, TaskKind, TaskRef};

pub(crate) use task::prepare;
