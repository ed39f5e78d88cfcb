//! Reliability primitives
//!
//! - [`backoff`] - retry delay calculation

mod backoff;

pub use backoff::{backoff, backoff_delay, DEFAULT_BACKOFF_BASE};
