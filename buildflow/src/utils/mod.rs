//! Utility functions for timestamp handling.

pub mod timestamps;

pub use timestamps::{elapsed_ms, format_iso8601, now_utc, Timestamp};
