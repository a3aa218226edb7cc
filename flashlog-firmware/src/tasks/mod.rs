//! Embassy async tasks

pub mod idle;
pub mod persist;

pub use idle::idle_task;
pub use persist::{persist_task, FirmwareService};
