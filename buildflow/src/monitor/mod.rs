//! Generic periodic-condition-with-timeout primitive.

mod polling;

pub use polling::{MonitorCanceller, MonitorHandle, PollingMonitor};
