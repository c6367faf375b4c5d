//! Status notification system.
//!
//! Every build task, execution session and build set transition is
//! published to a [`StatusSink`]. Persistence or API layers consume these
//! notifications; the crate ships logging, no-op and collecting sinks.

mod event;
mod sink;

pub use event::{
    BuildExecutionStatusChangedEvent, BuildSetStatusChangedEvent, BuildStatusChangedEvent,
};
pub use sink::{CollectingStatusSink, LoggingStatusSink, NoOpStatusSink, StatusSink};
