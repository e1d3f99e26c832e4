//! Perpetua worker: worker pool and periodic tasks around the core engine.

pub mod config;
pub mod periodic;
pub mod runtime;

pub use config::{StoreMode, WorkerConfig};
pub use runtime::{InProcessQueue, Services, WorkerRuntime};
