//! Job model
//!
//! This module provides:
//! - [`JobState`] - the closed set of job states and the transition table
//! - [`Job`] - the durable job record
//! - [`NewJob`] - a validated job submission
//! - [`JobUpdate`] - a partial update applied by the store

mod record;
mod state;

pub use record::{Job, JobUpdate, NewJob, ValidationError, DEFAULT_MAX_RETRIES};
pub use state::{JobState, ParseJobStateError};
