//! Persistent monitor worker services

pub mod manager;
pub mod protocol;

pub use manager::{MonitorWorkerManager, WorkerConfig, WorkerNotification, WorkerState};
pub use protocol::{WorkerCommand, WorkerEvent, MONITOR_EVENT_TAG};
